//! Partial derivatives of a component.
//!
//! [`Partials`] stores one block per declared `(of, wrt)` pair. A block is
//! either dense (row-major, `size(of) x size(wrt)`) or sparse, holding only
//! the values of the declared nonzero entries. Writing into a pair that was
//! not declared is an error.

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use crate::core::{EvalError, PartialDecl, PartialMethod};
use crate::vectors::{Owner, Region};

#[derive(Debug, Clone)]
struct Block {
    nrows: usize,
    ncols: usize,
    sparsity: Option<(Vec<usize>, Vec<usize>)>,
    values: Vec<f64>,
    method: PartialMethod,
}

impl Block {
    fn expected_len(&self) -> usize {
        match &self.sparsity {
            Some((rows, _)) => rows.len(),
            None => self.nrows * self.ncols,
        }
    }

    fn to_dense(&self) -> DMatrix<f64> {
        match &self.sparsity {
            Some((rows, cols)) => {
                let mut m = DMatrix::zeros(self.nrows, self.ncols);
                for ((&r, &c), &v) in rows.iter().zip(cols.iter()).zip(self.values.iter()) {
                    m[(r, c)] += v;
                }
                m
            }
            None => DMatrix::from_row_slice(self.nrows, self.ncols, &self.values),
        }
    }
}

fn undeclared(owner: &Owner, of: &str, wrt: &str) -> EvalError {
    EvalError::UndeclaredPartial {
        path: owner.path().clone(),
        class: owner.class().clone(),
        of: of.to_string(),
        wrt: wrt.to_string(),
    }
}

/// Partial derivatives of a single component.
#[derive(Debug, Clone)]
pub struct Partials {
    owner: Owner,
    blocks: BTreeMap<(String, String), Block>,
}

impl Partials {
    /// Creates the storage for declared pairs. `size` returns the size of a
    /// variable by its local name.
    pub(crate) fn new<F>(owner: Owner, decls: &[PartialDecl], size: F) -> Self
    where
        F: Fn(&str) -> usize,
    {
        let blocks = decls
            .iter()
            .map(|decl| {
                let nrows = size(decl.of());
                let ncols = size(decl.wrt());
                let mut block = Block {
                    nrows,
                    ncols,
                    sparsity: decl.sparsity().clone(),
                    values: Vec::new(),
                    method: decl.method(),
                };
                let len = block.expected_len();
                block.values = decl
                    .val()
                    .as_ref()
                    .and_then(|val| val.broadcast(len))
                    .unwrap_or_else(|| vec![0.0; len]);
                ((decl.of().clone(), decl.wrt().clone()), block)
            })
            .collect();

        Self { owner, blocks }
    }

    fn block_mut(&mut self, of: &str, wrt: &str) -> Result<&mut Block, EvalError> {
        let owner = &self.owner;
        self.blocks
            .get_mut(&(of.to_string(), wrt.to_string()))
            .ok_or_else(|| undeclared(owner, of, wrt))
    }

    /// Sets the values of a declared block. Dense blocks take row-major
    /// values, sparse blocks the values of the nonzero entries in the
    /// declared order. A single value is broadcast.
    pub fn set(&mut self, of: &str, wrt: &str, values: &[f64]) -> Result<(), EvalError> {
        let owner = &self.owner;
        let block = self
            .blocks
            .get_mut(&(of.to_string(), wrt.to_string()))
            .ok_or_else(|| undeclared(owner, of, wrt))?;
        let expected = block.expected_len();

        if values.len() == expected {
            block.values.copy_from_slice(values);
        } else if values.len() == 1 {
            block.values.fill(values[0]);
        } else {
            return Err(EvalError::SizeMismatch {
                path: owner.path().clone(),
                class: owner.class().clone(),
                name: format!("{of}, {wrt}"),
                expected,
                got: values.len(),
            });
        }

        Ok(())
    }

    /// Sets a dense block from a matrix.
    pub fn set_matrix(&mut self, of: &str, wrt: &str, m: &DMatrix<f64>) -> Result<(), EvalError> {
        let values = m.transpose();
        self.set(of, wrt, values.as_slice())
    }

    /// Returns `true` if the pair was declared.
    pub fn is_declared(&self, of: &str, wrt: &str) -> bool {
        self.blocks.contains_key(&(of.to_string(), wrt.to_string()))
    }

    /// Dense copy of a declared block.
    pub fn get(&self, of: &str, wrt: &str) -> Option<DMatrix<f64>> {
        self.blocks
            .get(&(of.to_string(), wrt.to_string()))
            .map(Block::to_dense)
    }

    /// Pairs approximated by finite differences.
    pub(crate) fn fd_pairs(&self) -> Vec<(String, String)> {
        self.blocks
            .iter()
            .filter(|(_, b)| b.method == PartialMethod::Fd)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// All declared pairs.
    pub(crate) fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.blocks.keys().map(|(o, w)| (o.as_str(), w.as_str()))
    }

    /// Stores a dense approximation into a block, keeping only the declared
    /// nonzero entries of sparse blocks.
    pub(crate) fn store_dense(&mut self, of: &str, wrt: &str, m: &DMatrix<f64>) -> Result<(), EvalError> {
        let block = self.block_mut(of, wrt)?;
        match &block.sparsity {
            Some((rows, cols)) => {
                for (i, (&r, &c)) in rows.iter().zip(cols.iter()).enumerate() {
                    block.values[i] = m[(r, c)];
                }
            }
            None => {
                for r in 0..block.nrows {
                    for c in 0..block.ncols {
                        block.values[r * block.ncols + c] = m[(r, c)];
                    }
                }
            }
        }
        Ok(())
    }

    /// Assembles the Jacobian of variables in `rows` with respect to
    /// variables in `cols`. Undeclared pairs are zero.
    pub(crate) fn assemble(&self, rows: &Region, cols: &Region) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(rows.size(), cols.size());

        for ((of, wrt), block) in &self.blocks {
            let (Some(r), Some(c)) = (rows.slot(of), cols.slot(wrt)) else {
                continue;
            };
            m.view_mut((r.start, c.start), (r.size, c.size))
                .copy_from(&block.to_dense());
        }

        m
    }
}
