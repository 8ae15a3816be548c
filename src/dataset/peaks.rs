use std::sync::Arc;

use super::{Dataset, DatasetError, Example, Target};
use crate::genomics::{fetch_window, ClassMap, ElementsTable, GenomeSource, Window};

/// Windows labelled with the class of their `label` column.
#[derive(Clone)]
pub struct PeaksDataset {
    genome: Arc<dyn GenomeSource>,
    elements: ElementsTable,
    classes: ClassMap,
}

impl std::fmt::Debug for PeaksDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeaksDataset")
            .field("elements", &self.elements.len())
            .field("classes", &self.classes)
            .finish()
    }
}

impl PeaksDataset {
    /// Label column name.
    pub const LABEL_COLUMN: &'static str = "label";

    /// Fails when the table lacks a `label` column or any label is missing
    /// from `classes`.
    pub fn new(
        genome: Arc<dyn GenomeSource>,
        elements: ElementsTable,
        classes: ClassMap,
    ) -> Result<Self, DatasetError> {
        elements.require_columns(&[Self::LABEL_COLUMN])?;
        for element in elements.iter() {
            let label = elements.field(element, Self::LABEL_COLUMN)?;
            if classes.index(label).is_none() {
                return Err(DatasetError::UnknownClass(label.to_string()));
            }
        }
        Ok(Self {
            genome,
            elements,
            classes,
        })
    }

    /// Underlying (filtered) table.
    pub fn elements(&self) -> &ElementsTable {
        &self.elements
    }

    /// Class map used for labels.
    pub fn classes(&self) -> &ClassMap {
        &self.classes
    }

    /// Class index of row `idx`.
    pub fn class_of(&self, idx: usize) -> Result<usize, DatasetError> {
        let element = self
            .elements
            .get(idx)
            .ok_or(DatasetError::IndexOutOfRange { idx, len: self.len() })?;
        let label = self.elements.field(element, Self::LABEL_COLUMN)?;
        self.classes
            .index(label)
            .ok_or_else(|| DatasetError::UnknownClass(label.to_string()))
    }
}

impl Dataset for PeaksDataset {
    type Item = Example<Window>;

    fn len(&self) -> usize {
        self.elements.len()
    }

    fn get(&self, idx: usize) -> Result<Example<Window>, DatasetError> {
        let class = self.class_of(idx)?;
        let element = self
            .elements
            .get(idx)
            .ok_or(DatasetError::IndexOutOfRange { idx, len: self.len() })?;
        let window = fetch_window(
            self.genome.as_ref(),
            &element.chrom,
            element.start as i64,
            element.end as i64,
        )?;
        Ok(Example::new(window, Target::Class(class)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genomics::{InMemoryGenome, TsvTable};

    fn table(labels: &[&str]) -> ElementsTable {
        let mut text = String::from("chr\tinput_start\tinput_end\tlabel\n");
        for (i, label) in labels.iter().enumerate() {
            text.push_str(&format!("chr1\t{}\t{}\t{label}\n", i * 2, i * 2 + 4));
        }
        ElementsTable::from_tsv(&TsvTable::parse(&text).unwrap(), None).unwrap()
    }

    #[test]
    fn labels_map_to_class_indices() {
        let genome = Arc::new(InMemoryGenome::new().with_chrom("chr1", b"ACGTACGTAC"));
        let classes = ClassMap::from_labels(["GM12878", "H1ESC", "HEPG2"]);
        let dataset = PeaksDataset::new(genome, table(&["HEPG2", "GM12878"]), classes).unwrap();
        let example = dataset.get(0).unwrap();
        assert_eq!(example.target, Target::Class(2));
        assert_eq!(example.input.nrows(), 4);
        assert_eq!(dataset.class_of(1).unwrap(), 0);
    }

    #[test]
    fn unknown_label_is_rejected() {
        let genome = Arc::new(InMemoryGenome::new().with_chrom("chr1", b"ACGTACGTAC"));
        let classes = ClassMap::from_labels(["K562"]);
        assert!(matches!(
            PeaksDataset::new(genome, table(&["IMR90"]), classes),
            Err(DatasetError::UnknownClass(label)) if label == "IMR90"
        ));
    }
}
