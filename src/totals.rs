//! Total derivatives of the model.
//!
//! Linearizing every component gives the linear system `A du = b` over all
//! continuous outputs, where the row block of a component holds the
//! derivatives of its residuals with respect to its own outputs and, through
//! the connections, to the outputs feeding its inputs. Total derivatives of
//! responses with respect to design variables are obtained by solving this
//! system. In forward mode, there is one solve per entry of the design
//! variables and the blocks are swept in execution order. In reverse mode,
//! there is one solve of the transposed system per entry of the responses
//! and the blocks are swept backwards.
//!
//! Blocks without coupling are solved by substitution. Coupled blocks and
//! blocks with an implicit component are solved together, by LU
//! decomposition of their part of the system.

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use log::debug;
use nalgebra::{linalg::LU, DMatrix, DVector, Dyn};

use crate::core::{EvalError, Mode};
use crate::group::Group;
use crate::model::{Block, CompKind, Model};

/// Seed of the inputs of a component given values in the global output
/// space. Only sources accepted by `include` contribute.
pub(crate) fn gather_seed<F>(model: &Model, c: usize, x: &[f64], include: F) -> Vec<f64>
where
    F: Fn(usize) -> bool,
{
    let info = &model.comps[c];
    let mut seed = vec![0.0; info.inputs.size()];

    for src in info.sources.iter().filter(|s| include(s.comp)) {
        let slot = &info.inputs.slots[src.slot];
        for (s, v) in seed[slot.range()].iter_mut().zip(&x[src.range.clone()]) {
            *s = src.scale * v;
        }
    }

    seed
}

/// Part of the linear system belonging to given components, with rows and
/// columns ordered by the outputs of the components.
pub(crate) fn block_matrix(
    model: &mut Model,
    root: &mut Group,
    members: &[usize],
) -> Result<DMatrix<f64>, EvalError> {
    let ranges: Vec<Range<usize>> = members
        .iter()
        .map(|&c| model.comps[c].outputs.range.clone())
        .collect();
    let n: usize = ranges.iter().map(Range::len).sum();
    let n_out = model.outputs.as_slice().len();
    let in_block: HashSet<usize> = members.iter().copied().collect();

    let mut matrix = DMatrix::zeros(n, n);
    let mut unit = vec![0.0; n_out];
    let mut col = 0;

    for range in &ranges {
        for j in range.clone() {
            unit[j] = 1.0;

            let mut row = 0;
            for (&c, r) in members.iter().zip(&ranges) {
                let d_in = gather_seed(model, c, &unit, |s| in_block.contains(&s));
                let d_res = model.apply_fwd(root, c, &d_in, &unit[r.clone()])?;
                for (i, v) in d_res.into_iter().enumerate() {
                    matrix[(row + i, col)] = v;
                }
                row += r.len();
            }

            unit[j] = 0.0;
            col += 1;
        }
    }

    Ok(matrix)
}

/// Total derivatives keyed by `(of, wrt)` names as requested.
///
/// Every entry is a matrix with one row per element of `of` and one column
/// per element of `wrt`.
#[derive(Debug, Clone, Default)]
pub struct Totals {
    entries: BTreeMap<(String, String), DMatrix<f64>>,
}

impl Totals {
    /// Derivative of `of` with respect to `wrt`.
    pub fn get(&self, of: &str, wrt: &str) -> Option<&DMatrix<f64>> {
        self.entries.get(&(of.to_string(), wrt.to_string()))
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&(String, String), &DMatrix<f64>)> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A block is trivial when its system matrix is the identity.
fn is_trivial(model: &Model, block: &Block) -> bool {
    !block.coupled && model.comps[block.comps[0]].kind != CompKind::Implicit
}

struct Engine<'a> {
    model: &'a mut Model,
    root: &'a mut Group,
    blocks: Vec<Block>,
    /// Factorized block systems, transposed in reverse mode. `None` for
    /// trivial blocks.
    lus: Vec<Option<LU<f64, Dyn, Dyn>>>,
}

impl<'a> Engine<'a> {
    fn new(model: &'a mut Model, root: &'a mut Group, mode: Mode) -> Result<Self, EvalError> {
        let blocks = model.blocks.clone();

        for block in &blocks {
            for &c in &block.comps {
                model.linearize(root, c)?;
            }
        }

        let mut lus = Vec::with_capacity(blocks.len());
        for block in &blocks {
            if is_trivial(model, block) {
                lus.push(None);
                continue;
            }

            let matrix = block_matrix(model, root, &block.comps)?;
            let matrix = match mode {
                Mode::Fwd => matrix,
                Mode::Rev => matrix.transpose(),
            };
            let lu = matrix.lu();
            if !lu.is_invertible() {
                return Err(EvalError::SingularJacobian(block.paths(&model.comps)));
            }
            lus.push(Some(lu));
        }

        Ok(Self {
            model,
            root,
            blocks,
            lus,
        })
    }

    fn block_values(&self, block: &Block, x: &[f64]) -> DVector<f64> {
        let values: Vec<f64> = block
            .comps
            .iter()
            .flat_map(|&c| x[self.model.comps[c].outputs.range.clone()].iter().copied())
            .collect();
        DVector::from_vec(values)
    }

    fn store_block(&self, block: &Block, values: &DVector<f64>, x: &mut [f64]) {
        let mut offset = 0;
        for &c in &block.comps {
            let range = self.model.comps[c].outputs.range.clone();
            let n = range.len();
            x[range].copy_from_slice(&values.as_slice()[offset..offset + n]);
            offset += n;
        }
    }

    fn solve_block(&self, b: usize, rhs: DVector<f64>) -> Result<DVector<f64>, EvalError> {
        match &self.lus[b] {
            None => Ok(rhs),
            Some(lu) => lu
                .solve(&rhs)
                .ok_or_else(|| EvalError::SingularJacobian(self.blocks[b].paths(&self.model.comps))),
        }
    }

    /// Solves `A du = rhs`.
    fn forward(&mut self, mut rhs: Vec<f64>) -> Result<Vec<f64>, EvalError> {
        let mut du = vec![0.0; rhs.len()];

        for b in 0..self.blocks.len() {
            let block = self.blocks[b].clone();
            let in_block: HashSet<usize> = block.comps.iter().copied().collect();

            // Move the contributions of already solved blocks to the right
            // hand side.
            for &c in &block.comps {
                let d_in = gather_seed(self.model, c, &du, |s| !in_block.contains(&s));
                if d_in.iter().all(|v| *v == 0.0) {
                    continue;
                }
                let range = self.model.comps[c].outputs.range.clone();
                let zeros = vec![0.0; range.len()];
                let d_res = self.model.apply_fwd(self.root, c, &d_in, &zeros)?;
                for (r, d) in rhs[range].iter_mut().zip(d_res) {
                    *r -= d;
                }
            }

            let solution = self.solve_block(b, self.block_values(&block, &rhs))?;
            self.store_block(&block, &solution, &mut du);
        }

        Ok(du)
    }

    /// Solves `A^T lambda = rhs`.
    fn reverse(&mut self, mut rhs: Vec<f64>) -> Result<Vec<f64>, EvalError> {
        let mut lambda = vec![0.0; rhs.len()];

        for b in (0..self.blocks.len()).rev() {
            let block = self.blocks[b].clone();
            let in_block: HashSet<usize> = block.comps.iter().copied().collect();

            let solution = self.solve_block(b, self.block_values(&block, &rhs))?;
            self.store_block(&block, &solution, &mut lambda);

            // Propagate to the blocks upstream.
            for &c in &block.comps {
                let range = self.model.comps[c].outputs.range.clone();
                if lambda[range.clone()].iter().all(|v| *v == 0.0) {
                    continue;
                }
                let (d_in, _) = self.model.apply_rev(self.root, c, &lambda[range])?;

                let info = &self.model.comps[c];
                for src in info.sources.iter().filter(|s| !in_block.contains(&s.comp)) {
                    let slot = &info.inputs.slots[src.slot];
                    for (r, d) in rhs[src.range.clone()].iter_mut().zip(&d_in[slot.range()]) {
                        *r -= src.scale * d;
                    }
                }
            }
        }

        Ok(lambda)
    }
}

/// Computes total derivatives of outputs `of` with respect to outputs `wrt`,
/// both given by a name and a range in the global output vector.
pub(crate) fn compute(
    model: &mut Model,
    root: &mut Group,
    of: &[(String, Range<usize>)],
    wrt: &[(String, Range<usize>)],
    mode: Mode,
) -> Result<Totals, EvalError> {
    let n_out = model.outputs.as_slice().len();
    let mut entries: BTreeMap<(String, String), DMatrix<f64>> = BTreeMap::new();
    for (o, o_range) in of {
        for (w, w_range) in wrt {
            entries.insert((o.clone(), w.clone()), DMatrix::zeros(o_range.len(), w_range.len()));
        }
    }

    let mut engine = Engine::new(model, root, mode)?;
    let mut solves = 0;

    match mode {
        Mode::Fwd => {
            for (w, w_range) in wrt {
                for (j, idx) in w_range.clone().enumerate() {
                    let mut rhs = vec![0.0; n_out];
                    rhs[idx] = 1.0;
                    let du = engine.forward(rhs)?;
                    solves += 1;

                    for (o, o_range) in of {
                        if let Some(m) = entries.get_mut(&(o.clone(), w.clone())) {
                            m.set_column(j, &DVector::from_column_slice(&du[o_range.clone()]));
                        }
                    }
                }
            }
        }
        Mode::Rev => {
            for (o, o_range) in of {
                for (i, idx) in o_range.clone().enumerate() {
                    let mut rhs = vec![0.0; n_out];
                    rhs[idx] = 1.0;
                    let lambda = engine.reverse(rhs)?;
                    solves += 1;

                    for (w, w_range) in wrt {
                        if let Some(m) = entries.get_mut(&(o.clone(), w.clone())) {
                            for (k, v) in lambda[w_range.clone()].iter().enumerate() {
                                m[(i, k)] = *v;
                            }
                        }
                    }
                }
            }
        }
    }

    debug!("computed totals in {:?} mode with {} linear solves", mode, solves);
    Ok(Totals { entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    use crate::core::{DeclarationError, Declarations, ExplicitComponent, PartialOptions};
    use crate::vectors::View;

    struct Scale(f64);

    impl ExplicitComponent for Scale {
        fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
            decl.add_input("x", 1.0)?;
            decl.add_output("y", 1.0)?;
            decl.declare_partials("y", "x", PartialOptions::new().with_val(self.0))
        }

        fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
            outputs.set_scalar("y", self.0 * inputs.scalar("x")?)
        }
    }

    fn range(model: &Model, abs: &str) -> (String, Range<usize>) {
        let loc = model.locate(abs).unwrap();
        (abs.to_string(), loc.range)
    }

    #[test]
    fn chain_rule_in_both_modes() {
        let mut root = Group::new();
        root.add_explicit("c1", Scale(2.0));
        root.add_explicit("c2", Scale(3.0));
        root.connect("c1.y", "c2.x");

        let mut model = Model::setup(&mut root, false).unwrap();
        let of = [range(&model, "c2.y")];
        let wrt = [range(&model, "_auto_ivc.v0")];

        for mode in [Mode::Fwd, Mode::Rev] {
            let totals = compute(&mut model, &mut root, &of, &wrt, mode).unwrap();
            assert_eq!(totals.len(), 1);
            assert_abs_diff_eq!(totals.get("c2.y", "_auto_ivc.v0").unwrap()[(0, 0)], 6.0);
        }
    }

    #[test]
    fn coupled_block_is_solved_together() {
        let mut root = Group::new();
        root.add_explicit("a", Scale(0.5));
        root.add_explicit("b", Scale(0.5));
        root.connect("a.y", "b.x");
        root.connect("b.y", "a.x");

        let mut model = Model::setup(&mut root, false).unwrap();
        let of = [range(&model, "b.y")];
        let wrt = [range(&model, "a.y")];

        // du_a = 1 + 0.5 du_b, du_b = 0.5 du_a.
        let fwd = compute(&mut model, &mut root, &of, &wrt, Mode::Fwd).unwrap();
        let rev = compute(&mut model, &mut root, &of, &wrt, Mode::Rev).unwrap();
        let expected = 0.5 / (1.0 - 0.25);
        assert_abs_diff_eq!(fwd.get("b.y", "a.y").unwrap()[(0, 0)], expected, epsilon = 1e-12);
        assert_abs_diff_eq!(rev.get("b.y", "a.y").unwrap()[(0, 0)], expected, epsilon = 1e-12);
    }

    #[test]
    fn block_matrix_of_cycle() {
        let mut root = Group::new();
        root.add_explicit("a", Scale(0.5));
        root.add_explicit("b", Scale(2.0));
        root.connect("a.y", "b.x");
        root.connect("b.y", "a.x");

        let mut model = Model::setup(&mut root, false).unwrap();
        let block = model.blocks.iter().find(|b| b.coupled).cloned().unwrap();
        for &c in &block.comps {
            model.linearize(&mut root, c).unwrap();
        }

        let m = block_matrix(&mut model, &mut root, &block.comps).unwrap();
        assert_abs_diff_eq!(m, nalgebra::dmatrix![1.0, -0.5; -2.0, 1.0]);
    }

    #[test]
    fn singular_cycle_is_reported() {
        let mut root = Group::new();
        root.add_explicit("a", Scale(1.0));
        root.add_explicit("b", Scale(1.0));
        root.connect("a.y", "b.x");
        root.connect("b.y", "a.x");

        let mut model = Model::setup(&mut root, false).unwrap();
        let of = [range(&model, "b.y")];
        let wrt = [range(&model, "a.y")];

        let err = compute(&mut model, &mut root, &of, &wrt, Mode::Fwd).unwrap_err();
        assert!(matches!(err, EvalError::SingularJacobian(ref paths) if paths == &vec!["a".to_string(), "b".to_string()]));
    }
}
