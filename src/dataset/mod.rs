//! Windowing datasets.
//!
//! Every dataset honours the same contract: `len()` items addressable by row
//! index, each built deterministically on access. Chromosome partitioning is
//! applied when the elements table is loaded; the only per-epoch variation is
//! the strided downsampling of [`ChromatinDataset`].

mod chromatin;
mod embeddings;
mod footprint;
mod paired;
mod peaks;
mod sequence;
mod variant;

pub use chromatin::{ChromatinDataset, ChromatinWindow};
pub use embeddings::{EmbeddingsDataset, Region, TargetSource};
pub use footprint::FootprintingDataset;
pub use paired::{LabeledPairs, PairedControlDataset, PairedWindows};
pub use peaks::PeaksDataset;
pub use sequence::ElementWindowDataset;
pub use variant::{is_degenerate_allele, AllelePair, Variant, VariantDataset};

use std::ops::Range;

use thiserror::Error;

use crate::genomics::{GenomeError, TableError};
use crate::store::StoreError;

/// Errors raised while building dataset items.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// Reference or signal access failed.
    #[error(transparent)]
    Genome(#[from] GenomeError),
    /// Elements table is malformed.
    #[error(transparent)]
    Table(#[from] TableError),
    /// Embedding store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Row index outside the dataset.
    #[error("index {idx} out of range for dataset of length {len}")]
    IndexOutOfRange {
        /// Requested index.
        idx: usize,
        /// Dataset length.
        len: usize,
    },
    /// Label not present in the class map.
    #[error("unknown class label '{0}'")]
    UnknownClass(String),
    /// Dataset construction parameters are inconsistent.
    #[error("invalid dataset configuration: {0}")]
    InvalidConfig(String),
}

/// Indexed collection of examples.
pub trait Dataset {
    /// Item produced for each row.
    type Item;

    /// Number of rows in the current epoch.
    fn len(&self) -> usize;

    /// Returns `true` when the dataset has no rows.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the item at `idx`.
    fn get(&self, idx: usize) -> Result<Self::Item, DatasetError>;

    /// Select the rows visible in `epoch`. Most datasets ignore this.
    fn set_epoch(&mut self, _epoch: usize) {}
}

/// Supervision target of a training example.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// Total signal counts (regression on log1p scale).
    Counts(f32),
    /// Class index.
    Class(usize),
}

/// Model input paired with its target.
#[derive(Debug, Clone, PartialEq)]
pub struct Example<I> {
    /// Model input.
    pub input: I,
    /// Supervision target.
    pub target: Target,
}

impl<I> Example<I> {
    /// Construct an example.
    pub fn new(input: I, target: Target) -> Self {
        Self { input, target }
    }
}

/// Contiguous `[start, end)` ranges of `batch_size` rows covering `[0, len)`.
pub fn batch_ranges(len: usize, batch_size: usize) -> impl Iterator<Item = Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len)
        .step_by(batch_size)
        .map(move |start| start..(start + batch_size).min(len))
}

/// Materialise the items of `range`.
pub fn load_batch<D: Dataset + ?Sized>(
    dataset: &D,
    range: Range<usize>,
) -> Result<Vec<D::Item>, DatasetError> {
    range.map(|idx| dataset.get(idx)).collect()
}

pub(crate) fn check_index(idx: usize, len: usize) -> Result<(), DatasetError> {
    if idx >= len {
        return Err(DatasetError::IndexOutOfRange { idx, len });
    }
    Ok(())
}

/// Concatenation of two datasets with the same item type.
#[derive(Debug)]
pub struct Concat<A, B> {
    first: A,
    second: B,
}

impl<A, B> Concat<A, B> {
    /// Rows of `first` followed by rows of `second`.
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A, B> Dataset for Concat<A, B>
where
    A: Dataset,
    B: Dataset<Item = A::Item>,
{
    type Item = A::Item;

    fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    fn get(&self, idx: usize) -> Result<Self::Item, DatasetError> {
        check_index(idx, self.len())?;
        if idx < self.first.len() {
            self.first.get(idx)
        } else {
            self.second.get(idx - self.first.len())
        }
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.first.set_epoch(epoch);
        self.second.set_epoch(epoch);
    }
}

/// Dataset whose items are transformed by a function.
pub struct Mapped<D, F> {
    inner: D,
    map: F,
}

impl<D: std::fmt::Debug, F> std::fmt::Debug for Mapped<D, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapped").field("inner", &self.inner).finish()
    }
}

impl<D, F> Mapped<D, F> {
    /// Apply `map` to every item of `inner`.
    pub fn new(inner: D, map: F) -> Self {
        Self { inner, map }
    }
}

impl<D, F, T> Dataset for Mapped<D, F>
where
    D: Dataset,
    F: Fn(D::Item) -> Result<T, DatasetError>,
{
    type Item = T;

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, idx: usize) -> Result<T, DatasetError> {
        let item = self.inner.get(idx)?;
        (self.map)(item)
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.inner.set_epoch(epoch);
    }
}

/// Type-erased dataset, for callers choosing the dataset at runtime.
pub type BoxedDataset<T> = Box<dyn Dataset<Item = T>>;

impl<D: Dataset + ?Sized> Dataset for Box<D> {
    type Item = D::Item;

    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, idx: usize) -> Result<Self::Item, DatasetError> {
        (**self).get(idx)
    }

    fn set_epoch(&mut self, epoch: usize) {
        (**self).set_epoch(epoch);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// In-memory dataset over a vector of items.
    #[derive(Debug, Clone)]
    pub struct VecDataset<T>(pub Vec<T>);

    impl<T: Clone> Dataset for VecDataset<T> {
        type Item = T;

        fn len(&self) -> usize {
            self.0.len()
        }

        fn get(&self, idx: usize) -> Result<T, DatasetError> {
            check_index(idx, self.0.len())?;
            Ok(self.0[idx].clone())
        }
    }
}
