use std::sync::Arc;

use super::{Dataset, DatasetError};
use crate::genomics::{fetch_window, ElementsTable, GenomeSource, Window};

/// Plain one-hot windows over the rows of an elements table.
#[derive(Clone)]
pub struct ElementWindowDataset {
    genome: Arc<dyn GenomeSource>,
    elements: ElementsTable,
}

impl std::fmt::Debug for ElementWindowDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementWindowDataset")
            .field("elements", &self.elements.len())
            .finish()
    }
}

impl ElementWindowDataset {
    /// Windows of `elements` read from `genome`.
    pub fn new(genome: Arc<dyn GenomeSource>, elements: ElementsTable) -> Self {
        Self { genome, elements }
    }

    /// Underlying (filtered) table.
    pub fn elements(&self) -> &ElementsTable {
        &self.elements
    }
}

impl Dataset for ElementWindowDataset {
    type Item = Window;

    fn len(&self) -> usize {
        self.elements.len()
    }

    fn get(&self, idx: usize) -> Result<Window, DatasetError> {
        let element = self
            .elements
            .get(idx)
            .ok_or(DatasetError::IndexOutOfRange { idx, len: self.len() })?;
        Ok(fetch_window(
            self.genome.as_ref(),
            &element.chrom,
            element.start as i64,
            element.end as i64,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genomics::{onehot_to_chars, InMemoryGenome, TsvTable};

    #[test]
    fn windows_follow_table_rows() {
        let genome = InMemoryGenome::new().with_chrom("chr1", b"ACGTACGTAA");
        let table = TsvTable::parse("chr\tinput_start\tinput_end\nchr1\t2\t6\nchr1\t8\t12\n")
            .unwrap();
        let elements = ElementsTable::from_tsv(&table, None).unwrap();
        let dataset = ElementWindowDataset::new(Arc::new(genome), elements);

        assert_eq!(dataset.len(), 2);
        assert_eq!(onehot_to_chars(dataset.get(0).unwrap().view()), b"GTAC");
        assert_eq!(onehot_to_chars(dataset.get(1).unwrap().view()), b"AANN");
        assert!(dataset.get(2).is_err());
    }
}
