use std::sync::Arc;

use super::{check_index, Dataset, DatasetError, Example, Target};
use crate::genomics::{
    dinucleotide_shuffle, example_rng, fetch_padded, one_hot_encode, valid_range, ElementsTable,
    GenomeSource, Window,
};

/// Element window and its matched control.
#[derive(Debug, Clone, PartialEq)]
pub struct PairedWindows {
    /// Window over the element.
    pub seq: Window,
    /// Dinucleotide-shuffled control of the same sequence.
    pub ctrl: Window,
}

/// Element windows paired with seeded dinucleotide-shuffled controls.
///
/// Only the in-chromosome part of a window is shuffled; out-of-bounds rows
/// stay zero in both the element and the control.
#[derive(Clone)]
pub struct PairedControlDataset {
    genome: Arc<dyn GenomeSource>,
    elements: ElementsTable,
    seed: u64,
}

impl std::fmt::Debug for PairedControlDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairedControlDataset")
            .field("elements", &self.elements.len())
            .field("seed", &self.seed)
            .finish()
    }
}

impl PairedControlDataset {
    /// Pair every element of `elements` with a control shuffled under `seed`.
    pub fn new(genome: Arc<dyn GenomeSource>, elements: ElementsTable, seed: u64) -> Self {
        Self {
            genome,
            elements,
            seed,
        }
    }

    /// Underlying (filtered) table.
    pub fn elements(&self) -> &ElementsTable {
        &self.elements
    }
}

impl Dataset for PairedControlDataset {
    type Item = PairedWindows;

    fn len(&self) -> usize {
        self.elements.len()
    }

    fn get(&self, idx: usize) -> Result<PairedWindows, DatasetError> {
        let element = self
            .elements
            .get(idx)
            .ok_or(DatasetError::IndexOutOfRange { idx, len: self.len() })?;
        let (start, end) = (element.start as i64, element.end as i64);
        let genome = self.genome.as_ref();
        let sequence = fetch_padded(genome, &element.chrom, start, end)?;

        let mut control = sequence.clone();
        let chrom_len = genome.chrom_len(&element.chrom)?;
        if let Some(range) = valid_range(start, end, chrom_len) {
            let lo = (range.start as i64 - start) as usize;
            let hi = (range.end as i64 - start) as usize;
            let mut rng = example_rng(self.seed, element.idx_orig);
            let shuffled = dinucleotide_shuffle(&sequence[lo..hi], &mut rng);
            control[lo..hi].copy_from_slice(&shuffled);
        }

        Ok(PairedWindows {
            seq: one_hot_encode(&sequence),
            ctrl: one_hot_encode(&control),
        })
    }
}

/// Flattens paired windows into labelled examples: row `2i` is the element
/// of pair `i` (class 1), row `2i + 1` its control (class 0).
#[derive(Debug, Clone)]
pub struct LabeledPairs<D> {
    inner: D,
}

impl<D> LabeledPairs<D> {
    /// Class index of controls.
    pub const CONTROL: usize = 0;
    /// Class index of elements.
    pub const ELEMENT: usize = 1;

    /// Wrap a paired dataset.
    pub fn new(inner: D) -> Self {
        Self { inner }
    }
}

impl<D> Dataset for LabeledPairs<D>
where
    D: Dataset<Item = PairedWindows>,
{
    type Item = Example<Window>;

    fn len(&self) -> usize {
        self.inner.len() * 2
    }

    fn get(&self, idx: usize) -> Result<Example<Window>, DatasetError> {
        check_index(idx, self.len())?;
        let pair = self.inner.get(idx / 2)?;
        Ok(if idx % 2 == 0 {
            Example::new(pair.seq, Target::Class(Self::ELEMENT))
        } else {
            Example::new(pair.ctrl, Target::Class(Self::CONTROL))
        })
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.inner.set_epoch(epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genomics::{onehot_to_chars, InMemoryGenome, TsvTable};

    fn dataset(seed: u64) -> PairedControlDataset {
        let genome = InMemoryGenome::new().with_chrom("chr1", b"ACGTTGCAAGGCTTACGATC");
        let table =
            TsvTable::parse("chr\tinput_start\tinput_end\nchr1\t0\t16\nchr1\t14\t24\n").unwrap();
        let elements = ElementsTable::from_tsv(&table, None).unwrap();
        PairedControlDataset::new(Arc::new(genome), elements, seed)
    }

    #[test]
    fn control_keeps_composition_and_is_deterministic() {
        let first = dataset(3).get(0).unwrap();
        let again = dataset(3).get(0).unwrap();
        assert_eq!(first, again);

        let mut seq = onehot_to_chars(first.seq.view());
        let mut ctrl = onehot_to_chars(first.ctrl.view());
        assert_eq!(seq, b"ACGTTGCAAGGCTTAC");
        seq.sort_unstable();
        ctrl.sort_unstable();
        assert_eq!(seq, ctrl);
    }

    #[test]
    fn out_of_bounds_rows_stay_blank_in_control() {
        let pair = dataset(0).get(1).unwrap();
        let ctrl = onehot_to_chars(pair.ctrl.view());
        assert_eq!(&ctrl[6..], b"NNNN");
    }

    #[test]
    fn labeled_pairs_alternate_element_and_control() {
        let labeled = LabeledPairs::new(dataset(1));
        assert_eq!(labeled.len(), 4);
        assert_eq!(labeled.get(0).unwrap().target, Target::Class(1));
        assert_eq!(labeled.get(3).unwrap().target, Target::Class(0));
    }
}
