use std::path::Path;

use super::{Dataset, DatasetError, PairedWindows};
use crate::genomics::{dinucleotide_shuffle, example_rng, one_hot_encode, TsvTable};

/// Raw sequences from a table, each paired with a seeded
/// dinucleotide-shuffled control.
#[derive(Debug, Clone)]
pub struct FootprintingDataset {
    sequences: Vec<Vec<u8>>,
    seed: u64,
}

impl FootprintingDataset {
    /// Column holding the sequences.
    pub const SEQ_COLUMN: &'static str = "seq";

    /// Build from a parsed table with a `seq` column.
    pub fn from_tsv(table: &TsvTable, seed: u64) -> Result<Self, DatasetError> {
        table.column_index(Self::SEQ_COLUMN)?;
        let sequences = (0..table.len())
            .map(|row| {
                table
                    .field(row, Self::SEQ_COLUMN)
                    .map(|s| s.trim().as_bytes().to_ascii_uppercase())
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { sequences, seed })
    }

    /// Load a sequence table.
    pub fn load<P: AsRef<Path>>(path: P, seed: u64) -> Result<Self, DatasetError> {
        let table = TsvTable::read(path)?;
        Self::from_tsv(&table, seed)
    }

    /// Raw sequence of row `idx`.
    pub fn sequence(&self, idx: usize) -> Option<&[u8]> {
        self.sequences.get(idx).map(Vec::as_slice)
    }
}

impl Dataset for FootprintingDataset {
    type Item = PairedWindows;

    fn len(&self) -> usize {
        self.sequences.len()
    }

    fn get(&self, idx: usize) -> Result<PairedWindows, DatasetError> {
        let sequence = self
            .sequences
            .get(idx)
            .ok_or(DatasetError::IndexOutOfRange { idx, len: self.len() })?;
        let mut rng = example_rng(self.seed, idx);
        let control = dinucleotide_shuffle(sequence, &mut rng);
        Ok(PairedWindows {
            seq: one_hot_encode(sequence),
            ctrl: one_hot_encode(&control),
        })
    }
}
