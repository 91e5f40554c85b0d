//! Global vectors and the views lent to components.
//!
//! All continuous inputs of the model live in one contiguous [`Vector`], all
//! continuous outputs in another one, and the residuals use the layout of the
//! outputs. Variables of a single component occupy one contiguous region, so
//! a component sees its variables through a [`View`] over a slice of the
//! global storage. Discrete values are stored alongside in a separate list.
//!
//! While a component evaluates, the vectors it may only read are locked by a
//! [`ReadOnlyGuard`]. The guard is a counter, so locks nest, and it is
//! released when dropped, which happens on every exit path of the
//! evaluation.

use std::cell::Cell;
use std::ops::Range;

use getset::Getters;
use serde_json::Value;

use crate::core::{EvalError, VarKind, VarMeta};

/// Kind of a global vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    /// Continuous and discrete inputs.
    Input,
    /// Continuous and discrete outputs.
    Output,
    /// Residuals of outputs.
    Residual,
}

impl VectorKind {
    /// Name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            VectorKind::Input => "input",
            VectorKind::Output => "output",
            VectorKind::Residual => "residual",
        }
    }
}

/// Identification of a component used in error messages.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct Owner {
    /// Absolute path of the component.
    path: String,
    /// Class name of the component.
    class: String,
}

impl Owner {
    pub(crate) fn new(path: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            class: class.into(),
        }
    }
}

/// Location of a variable within the region of its component.
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub(crate) name: String,
    pub(crate) start: usize,
    pub(crate) size: usize,
}

impl Slot {
    pub(crate) fn range(&self) -> Range<usize> {
        self.start..self.start + self.size
    }
}

/// Layout of the variables of one kind (inputs or outputs) of a component.
#[derive(Debug, Clone, Default)]
pub(crate) struct Region {
    /// Range in the continuous storage of the global vector.
    pub(crate) range: Range<usize>,
    /// Range in the discrete storage of the global vector.
    pub(crate) discrete_range: Range<usize>,
    /// Continuous variables, with starts relative to `range.start`.
    pub(crate) slots: Vec<Slot>,
    /// Discrete variables, with starts relative to `discrete_range.start`.
    pub(crate) discrete: Vec<Slot>,
}

impl Region {
    /// Lays out the variables of given kinds contiguously at given offsets.
    pub(crate) fn build(
        vars: &[VarMeta],
        continuous: VarKind,
        discrete: VarKind,
        offset: usize,
        discrete_offset: usize,
    ) -> Self {
        let mut slots = Vec::new();
        let mut start = 0;
        for var in vars.iter().filter(|v| v.kind() == continuous) {
            slots.push(Slot {
                name: var.name().clone(),
                start,
                size: var.size(),
            });
            start += var.size();
        }

        let discrete: Vec<Slot> = vars
            .iter()
            .filter(|v| v.kind() == discrete)
            .enumerate()
            .map(|(i, v)| Slot {
                name: v.name().clone(),
                start: i,
                size: 1,
            })
            .collect();

        Self {
            range: offset..offset + start,
            discrete_range: discrete_offset..discrete_offset + discrete.len(),
            slots,
            discrete,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.range.len()
    }

    pub(crate) fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub(crate) fn discrete_slot(&self, name: &str) -> Option<&Slot> {
        self.discrete.iter().find(|s| s.name == name)
    }

    /// Layout with the same slots but covering a standalone buffer.
    pub(crate) fn local(&self) -> Region {
        Region {
            range: 0..self.range.len(),
            discrete_range: 0..self.discrete_range.len(),
            slots: self.slots.clone(),
            discrete: self.discrete.clone(),
        }
    }
}

/// Token that keeps a vector read only while alive.
#[derive(Debug)]
pub struct ReadOnlyGuard<'a> {
    lock: &'a Cell<usize>,
}

impl<'a> ReadOnlyGuard<'a> {
    pub(crate) fn new(lock: &'a Cell<usize>) -> Self {
        lock.set(lock.get() + 1);
        Self { lock }
    }
}

impl Drop for ReadOnlyGuard<'_> {
    fn drop(&mut self) {
        self.lock.set(self.lock.get() - 1);
    }
}

/// Global storage of one kind of values.
#[derive(Debug)]
pub struct Vector {
    kind: VectorKind,
    data: Vec<f64>,
    discrete: Vec<Value>,
    lock: Cell<usize>,
}

impl Vector {
    /// Allocates a zeroed vector.
    pub fn new(kind: VectorKind, size: usize, discrete: usize) -> Self {
        Self {
            kind,
            data: vec![0.0; size],
            discrete: vec![Value::Null; discrete],
            lock: Cell::new(0),
        }
    }

    /// Kind of the vector.
    pub fn kind(&self) -> VectorKind {
        self.kind
    }

    /// All continuous values.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// All discrete values.
    pub fn discrete(&self) -> &[Value] {
        &self.discrete
    }

    pub(crate) fn discrete_mut(&mut self) -> &mut [Value] {
        &mut self.discrete
    }

    /// Returns `true` while any read-only guard is alive.
    pub fn is_read_only(&self) -> bool {
        self.lock.get() > 0
    }

    /// Locks the vector for reading until the guard is dropped.
    pub fn read_only(&self) -> ReadOnlyGuard<'_> {
        ReadOnlyGuard::new(&self.lock)
    }

    /// Splits the vector into the storage of a region and the lock.
    pub(crate) fn region_mut(&mut self, region: &Region) -> (&mut [f64], &mut [Value], &Cell<usize>) {
        (
            &mut self.data[region.range.clone()],
            &mut self.discrete[region.discrete_range.clone()],
            &self.lock,
        )
    }
}

/// Standalone copy of a region. Components write into a scratch buffer which
/// is committed to the global vector only when the evaluation succeeds.
#[derive(Debug)]
pub(crate) struct Scratch {
    data: Vec<f64>,
    discrete: Vec<Value>,
    region: Region,
    lock: Cell<usize>,
}

impl Scratch {
    pub(crate) fn copy_of(vector: &Vector, region: &Region) -> Self {
        Self {
            data: vector.data[region.range.clone()].to_vec(),
            discrete: vector.discrete[region.discrete_range.clone()].to_vec(),
            region: region.local(),
            lock: Cell::new(0),
        }
    }

    pub(crate) fn from_values(region: &Region, data: Vec<f64>) -> Self {
        Self {
            data,
            discrete: vec![Value::Null; region.discrete_range.len()],
            region: region.local(),
            lock: Cell::new(0),
        }
    }

    pub(crate) fn zeros(region: &Region) -> Self {
        Self::from_values(region, vec![0.0; region.size()])
    }

    pub(crate) fn view<'a>(&'a mut self, kind: VectorKind, owner: &'a Owner) -> View<'a> {
        View::new(
            kind,
            &mut self.data,
            &mut self.discrete,
            &self.region,
            &self.lock,
            owner,
        )
    }

    /// Read-only view.
    pub(crate) fn locked_view<'a>(
        &'a mut self,
        kind: VectorKind,
        owner: &'a Owner,
    ) -> (ReadOnlyGuard<'a>, View<'a>) {
        let guard = ReadOnlyGuard::new(&self.lock);
        let view = View::new(
            kind,
            &mut self.data,
            &mut self.discrete,
            &self.region,
            &self.lock,
            owner,
        );
        (guard, view)
    }

    pub(crate) fn data(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub(crate) fn discrete(&self) -> &[Value] {
        &self.discrete
    }

    /// Writes the buffer back into the region of the global vector.
    pub(crate) fn commit(self, vector: &mut Vector, region: &Region) {
        vector.data[region.range.clone()].copy_from_slice(&self.data);
        vector.discrete[region.discrete_range.clone()].clone_from_slice(&self.discrete);
    }
}

/// Access of a component to its variables of one kind.
///
/// Values are addressed by the local names the component declared. Writes
/// fail while the underlying vector is read only.
pub struct View<'a> {
    kind: VectorKind,
    data: &'a mut [f64],
    discrete: &'a mut [Value],
    region: &'a Region,
    lock: &'a Cell<usize>,
    owner: &'a Owner,
}

impl<'a> View<'a> {
    pub(crate) fn new(
        kind: VectorKind,
        data: &'a mut [f64],
        discrete: &'a mut [Value],
        region: &'a Region,
        lock: &'a Cell<usize>,
        owner: &'a Owner,
    ) -> Self {
        Self {
            kind,
            data,
            discrete,
            region,
            lock,
            owner,
        }
    }

    fn unknown(&self, name: &str) -> EvalError {
        EvalError::UnknownVariable {
            path: self.owner.path().clone(),
            class: self.owner.class().clone(),
            name: name.to_string(),
        }
    }

    fn check_writable(&self, name: &str) -> Result<(), EvalError> {
        if self.lock.get() > 0 {
            Err(EvalError::ReadOnly {
                path: self.owner.path().clone(),
                class: self.owner.class().clone(),
                name: name.to_string(),
                vector: self.kind.name(),
            })
        } else {
            Ok(())
        }
    }

    /// Returns `true` if writes are rejected.
    pub fn is_read_only(&self) -> bool {
        self.lock.get() > 0
    }

    /// Local names of the continuous variables.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.region.slots.iter().map(|s| s.name.as_str())
    }

    /// Values of a continuous variable.
    pub fn get(&self, name: &str) -> Result<&[f64], EvalError> {
        let slot = self.region.slot(name).ok_or_else(|| self.unknown(name))?;
        Ok(&self.data[slot.range()])
    }

    /// The first value of a continuous variable, convenient for scalars.
    pub fn scalar(&self, name: &str) -> Result<f64, EvalError> {
        Ok(self.get(name)?[0])
    }

    /// Sets all values of a continuous variable.
    pub fn set(&mut self, name: &str, values: &[f64]) -> Result<(), EvalError> {
        self.check_writable(name)?;
        let slot = self.region.slot(name).ok_or_else(|| self.unknown(name))?;

        if values.len() != slot.size {
            return Err(EvalError::SizeMismatch {
                path: self.owner.path().clone(),
                class: self.owner.class().clone(),
                name: name.to_string(),
                expected: slot.size,
                got: values.len(),
            });
        }

        self.data[slot.range()].copy_from_slice(values);
        Ok(())
    }

    /// Sets all elements of a continuous variable to the same value.
    pub fn set_scalar(&mut self, name: &str, value: f64) -> Result<(), EvalError> {
        self.check_writable(name)?;
        let slot = self.region.slot(name).ok_or_else(|| self.unknown(name))?;
        self.data[slot.range()].fill(value);
        Ok(())
    }

    /// Value of a discrete variable.
    pub fn discrete(&self, name: &str) -> Result<&Value, EvalError> {
        let slot = self
            .region
            .discrete_slot(name)
            .ok_or_else(|| self.unknown(name))?;
        Ok(&self.discrete[slot.start])
    }

    /// Sets the value of a discrete variable.
    pub fn set_discrete(&mut self, name: &str, value: impl Into<Value>) -> Result<(), EvalError> {
        self.check_writable(name)?;
        let slot = self
            .region
            .discrete_slot(name)
            .ok_or_else(|| self.unknown(name))?;
        self.discrete[slot.start] = value.into();
        Ok(())
    }

    /// All continuous values of the region in layout order.
    pub fn as_slice(&self) -> &[f64] {
        &self.data[..]
    }
}
