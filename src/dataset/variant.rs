use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use super::{Dataset, DatasetError};
use crate::genomics::{fetch_padded, one_hot_encode, GenomeSource, TsvTable, Window};

/// Reference and alternate haplotype windows of one variant.
#[derive(Debug, Clone, PartialEq)]
pub struct AllelePair {
    /// Window carrying `allele1`.
    pub allele1: Window,
    /// Window carrying `allele2`.
    pub allele2: Window,
}

/// One row of a variants table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    /// Row index in the unfiltered table.
    pub idx_orig: usize,
    /// Chromosome name.
    pub chrom: String,
    /// 0-based position of the first base of `allele1`.
    pub pos: u64,
    /// Reference-side allele.
    pub allele1: String,
    /// Alternate allele.
    pub allele2: String,
}

/// Returns `true` for allele placeholders carrying no nucleotide (`-`, `.`,
/// `N`, empty).
pub fn is_degenerate_allele(allele: &str) -> bool {
    !allele
        .bytes()
        .any(|b| matches!(b.to_ascii_uppercase(), b'A' | b'C' | b'G' | b'T'))
}

/// Allele windows centred on variant positions.
///
/// Each window is `left flank + allele + right flank`, where the right flank
/// resumes after the reference span of `allele1` and the result is truncated
/// to the window length. A degenerate allele is treated as a deletion; when
/// both alleles are degenerate both windows are all zero.
#[derive(Clone)]
pub struct VariantDataset {
    genome: Arc<dyn GenomeSource>,
    variants: Vec<Variant>,
    window: u64,
}

impl std::fmt::Debug for VariantDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariantDataset")
            .field("variants", &self.variants.len())
            .field("window", &self.window)
            .finish()
    }
}

impl VariantDataset {
    /// Required columns of a variants table.
    pub const REQUIRED: [&'static str; 4] = ["chr", "pos", "allele1", "allele2"];

    /// Build from a parsed table, keeping rows on `chroms` when given.
    pub fn from_tsv(
        genome: Arc<dyn GenomeSource>,
        table: &TsvTable,
        chroms: Option<&[String]>,
        window: u64,
    ) -> Result<Self, DatasetError> {
        for col in Self::REQUIRED {
            table.column_index(col)?;
        }
        if window == 0 {
            return Err(DatasetError::InvalidConfig(
                "variant window must be positive".to_string(),
            ));
        }
        let keep: Option<HashSet<&str>> = chroms.map(|c| c.iter().map(String::as_str).collect());
        let mut variants = Vec::new();
        for row in 0..table.len() {
            let chrom = table.field(row, "chr")?;
            if keep.as_ref().is_some_and(|k| !k.contains(chrom)) {
                continue;
            }
            variants.push(Variant {
                idx_orig: row,
                chrom: chrom.to_string(),
                pos: table.parse_field(row, "pos")?,
                allele1: table.field(row, "allele1")?.trim().to_string(),
                allele2: table.field(row, "allele2")?.trim().to_string(),
            });
        }
        Ok(Self {
            genome,
            variants,
            window,
        })
    }

    /// Load a variants TSV.
    pub fn load<P: AsRef<Path>>(
        genome: Arc<dyn GenomeSource>,
        path: P,
        chroms: Option<&[String]>,
        window: u64,
    ) -> Result<Self, DatasetError> {
        let table = TsvTable::read(path)?;
        Self::from_tsv(genome, &table, chroms, window)
    }

    /// Loaded variants in table order.
    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    fn haplotype(&self, variant: &Variant, allele: &str) -> Result<Vec<u8>, DatasetError> {
        let genome = self.genome.as_ref();
        let window = self.window as i64;
        let pos = variant.pos as i64;
        let start = pos - window / 2;
        let ref_span = if is_degenerate_allele(&variant.allele1) {
            0
        } else {
            variant.allele1.len() as i64
        };

        let mut sequence = fetch_padded(genome, &variant.chrom, start, pos)?;
        if !is_degenerate_allele(allele) {
            sequence.extend(allele.bytes().map(|b| b.to_ascii_uppercase()));
        }
        let remaining = (window - sequence.len() as i64).max(0);
        let right_start = pos + ref_span;
        sequence.extend(fetch_padded(
            genome,
            &variant.chrom,
            right_start,
            right_start + remaining,
        )?);
        sequence.truncate(self.window as usize);
        Ok(sequence)
    }
}

impl Dataset for VariantDataset {
    type Item = AllelePair;

    fn len(&self) -> usize {
        self.variants.len()
    }

    fn get(&self, idx: usize) -> Result<AllelePair, DatasetError> {
        let variant = self
            .variants
            .get(idx)
            .ok_or(DatasetError::IndexOutOfRange { idx, len: self.len() })?;
        if is_degenerate_allele(&variant.allele1) && is_degenerate_allele(&variant.allele2) {
            let blank = Window::zeros((self.window as usize, 4));
            return Ok(AllelePair {
                allele1: blank.clone(),
                allele2: blank,
            });
        }
        Ok(AllelePair {
            allele1: one_hot_encode(&self.haplotype(variant, &variant.allele1)?),
            allele2: one_hot_encode(&self.haplotype(variant, &variant.allele2)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genomics::{is_blank, onehot_to_chars, InMemoryGenome};

    fn dataset(rows: &str, window: u64) -> VariantDataset {
        let genome = InMemoryGenome::new().with_chrom("chr1", b"AAAACCCCGGGGTTTT");
        let table = TsvTable::parse(&format!("chr\tpos\tallele1\tallele2\n{rows}")).unwrap();
        VariantDataset::from_tsv(Arc::new(genome), &table, None, window).unwrap()
    }

    #[test]
    fn snv_windows_differ_only_at_centre() {
        let data = dataset("chr1\t6\tC\tT\n", 8);
        let pair = data.get(0).unwrap();
        assert_eq!(onehot_to_chars(pair.allele1.view()), b"AACCCCGG");
        assert_eq!(onehot_to_chars(pair.allele2.view()), b"AACCTCGG");
    }

    #[test]
    fn deletion_and_insertion_keep_window_length() {
        let data = dataset("chr1\t6\tCCG\tC\nchr1\t6\t-\tAT\n", 8);
        let deletion = data.get(0).unwrap();
        assert_eq!(onehot_to_chars(deletion.allele2.view()), b"AACCCGGG");

        let insertion = data.get(1).unwrap();
        assert_eq!(onehot_to_chars(insertion.allele1.view()), b"AACCCCGG");
        assert_eq!(onehot_to_chars(insertion.allele2.view()), b"AACCATCC");
    }

    #[test]
    fn doubly_degenerate_variant_is_blank() {
        let data = dataset("chr1\t6\t.\tN\n", 8);
        let pair = data.get(0).unwrap();
        assert!(is_blank(pair.allele1.view()));
        assert!(is_blank(pair.allele2.view()));
        assert_eq!(pair.allele1.nrows(), 8);
    }

    #[test]
    fn degenerate_detection() {
        assert!(is_degenerate_allele("-"));
        assert!(is_degenerate_allele(""));
        assert!(!is_degenerate_allele("a"));
    }
}
