//! Embedding extraction.
//!
//! Batches are read in dataset order, tokenized, embedded and appended to a
//! [`StoreWriter`] as `emb_<start>_<end>` chunks. Datasets yielding several
//! windows per row (paired controls, allele pairs) fill one group per window
//! in lockstep, so every group carries identical chunk keys.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dataset::{batch_ranges, load_batch, AllelePair, Dataset, DatasetError, PairedWindows};
use crate::genomics::Window;
use crate::model::{offsets_to_indices, FixedIndex, IndexLayout, ModelError, SequenceModel};
use crate::store::{StoreError, StoreWriter};

/// Errors raised during extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Dataset access failed.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    /// Tokenizer or model failed.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Store write failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Windows of one dataset differ in length.
    #[error("window of length {found} in a dataset of length-{expected} windows")]
    RaggedWindows {
        /// Length of the first window.
        expected: usize,
        /// Offending length.
        found: usize,
    },
}

/// Dataset items that map onto named store groups.
pub trait GroupedWindows {
    /// Store group of each window, in order.
    const GROUPS: &'static [&'static str];

    /// Windows in [`Self::GROUPS`] order.
    fn into_windows(self) -> Vec<Window>;
}

impl GroupedWindows for Window {
    const GROUPS: &'static [&'static str] = &["seq"];

    fn into_windows(self) -> Vec<Window> {
        vec![self]
    }
}

impl GroupedWindows for PairedWindows {
    const GROUPS: &'static [&'static str] = &["seq", "ctrl"];

    fn into_windows(self) -> Vec<Window> {
        vec![self.seq, self.ctrl]
    }
}

impl GroupedWindows for AllelePair {
    const GROUPS: &'static [&'static str] = &["allele1", "allele2"];

    fn into_windows(self) -> Vec<Window> {
        vec![self.allele1, self.allele2]
    }
}

/// Outcome of one extraction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionSummary {
    /// Final store location.
    pub path: PathBuf,
    /// Examples written per group.
    pub examples: usize,
    /// Chunks written per group.
    pub chunks: usize,
    /// Groups written.
    pub groups: Vec<String>,
    /// Batches whose tokenizer offsets disagreed with the fixed index map.
    pub index_mismatches: usize,
}

/// Runs a [`SequenceModel`] over a dataset and stores its token embeddings.
#[derive(Debug, Clone)]
pub struct EmbeddingExtractor<M> {
    model: M,
    batch_size: usize,
    verify_fixed: bool,
}

impl<M: SequenceModel> EmbeddingExtractor<M> {
    /// Extractor reading `batch_size` examples at a time.
    pub fn new(model: M, batch_size: usize) -> Self {
        Self {
            model,
            batch_size: batch_size.max(1),
            verify_fixed: false,
        }
    }

    /// Compare every batch's offsets against the fixed index map and warn on
    /// disagreement (for example k-mer blocks split by ambiguous bases).
    pub fn verify_fixed(mut self, verify: bool) -> Self {
        self.verify_fixed = verify;
        self
    }

    /// Wrapped model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Extract embeddings of every row of `dataset` into a store at `out`.
    pub fn extract<D>(&self, dataset: &D, out: &Path) -> Result<ExtractionSummary, ExtractError>
    where
        D: Dataset + ?Sized,
        D::Item: GroupedWindows,
    {
        let groups = <D::Item as GroupedWindows>::GROUPS;
        let layout = self.model.index_layout();
        let n = dataset.len();
        let mut writer = StoreWriter::create(out)?;
        let mut seq_len: Option<usize> = None;
        let mut fixed: Option<FixedIndex> = None;
        let mut chunks = 0;
        let mut index_mismatches = 0;

        for range in batch_ranges(n, self.batch_size) {
            let items = load_batch(dataset, range.clone())?;
            let mut per_group: Vec<Vec<Window>> = vec![Vec::with_capacity(items.len()); groups.len()];
            for item in items {
                for (slot, window) in per_group.iter_mut().zip(item.into_windows()) {
                    slot.push(window);
                }
            }

            let len = match seq_len {
                Some(len) => len,
                None => {
                    let len = per_group[0].first().map_or(0, |w| w.nrows());
                    for name in groups {
                        writer.create_group(name, n, len)?;
                    }
                    fixed = FixedIndex::for_layout(layout, len);
                    if let Some(fixed) = &fixed {
                        for name in groups {
                            writer.write_fixed_index(name, fixed)?;
                        }
                    }
                    seq_len = Some(len);
                    len
                }
            };
            if let Some(bad) = per_group.iter().flatten().find(|w| w.nrows() != len) {
                return Err(ExtractError::RaggedWindows {
                    expected: len,
                    found: bad.nrows(),
                });
            }

            for (name, windows) in groups.iter().zip(&per_group) {
                let tokens = self.model.tokenize(windows)?;
                let embeddings = self.model.embed(&tokens)?;
                match &fixed {
                    None => {
                        let rows = offsets_to_indices(&tokens.offsets, len);
                        writer.write_variable_index_rows(name, range.start, rows.view())?;
                    }
                    Some(fixed) if self.verify_fixed => {
                        let rows = offsets_to_indices(&tokens.offsets, len);
                        if !matches_fixed(&rows, fixed, len) {
                            index_mismatches += 1;
                            warn!(
                                group = *name,
                                start = range.start,
                                end = range.end,
                                "tokenizer offsets disagree with the fixed index map"
                            );
                        }
                    }
                    Some(_) => {}
                }
                writer.append_embeddings(name, range.start, embeddings.view())?;
            }
            chunks += 1;
            debug!(start = range.start, end = range.end, "extracted batch");
        }

        if seq_len.is_none() {
            for name in groups {
                writer.create_group(name, 0, 0)?;
            }
        }
        let path = writer.finish()?;
        info!(
            path = %path.display(),
            examples = n,
            chunks,
            layout = layout_name(layout),
            "embedding extraction complete"
        );
        Ok(ExtractionSummary {
            path,
            examples: n,
            chunks,
            groups: groups.iter().map(|g| g.to_string()).collect(),
            index_mismatches,
        })
    }
}

fn matches_fixed(rows: &Array2<u32>, fixed: &FixedIndex, len: usize) -> bool {
    let expected = fixed.positions(len);
    rows.rows()
        .into_iter()
        .all(|row| row.iter().copied().eq(expected.iter().copied()))
}

fn layout_name(layout: IndexLayout) -> &'static str {
    match layout {
        IndexLayout::Variable => "variable",
        IndexLayout::Slice => "slice",
        IndexLayout::Kmer { .. } => "kmer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::VecDataset;
    use crate::genomics::one_hot_encode;
    use crate::model::{IndexMap, KmerEmbedder, ModelFamily, OneHotBaseline};
    use crate::store::{tmp_path, StoreReader};

    fn windows(seqs: &[&[u8]]) -> VecDataset<Window> {
        VecDataset(seqs.iter().map(|s| one_hot_encode(s)).collect())
    }

    #[test]
    fn one_hot_extraction_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("baseline");
        let data = windows(&[b"ACGT", b"TTGA", b"CCNA"]);
        let summary = EmbeddingExtractor::new(OneHotBaseline, 2)
            .extract(&data, &out)
            .unwrap();
        assert_eq!(summary.chunks, 2);
        assert!(!tmp_path(&out).exists());

        let group = StoreReader::open(&out).unwrap().group("seq").unwrap();
        assert_eq!(group.chunk_keys(), vec!["emb_0_2", "emb_2_3"]);
        let emb = group.position_embeddings(2).unwrap();
        assert_eq!(emb.row(2).sum(), 0.0);
        assert_eq!(emb[[3, 0]], 1.0);
    }

    #[test]
    fn variable_layout_stores_per_example_rows() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("var");
        let model = KmerEmbedder::variable(ModelFamily::Dnabert2, 2, 3, 0).unwrap();
        let data = windows(&[b"ACGTA", b"ANGTA"]);
        EmbeddingExtractor::new(model, 4).extract(&data, &out).unwrap();

        let group = StoreReader::open(&out).unwrap().group("seq").unwrap();
        let IndexMap::Variable(map) = group.index_map().unwrap() else {
            panic!("expected a variable map");
        };
        assert_eq!(map.row(0).to_vec(), vec![1, 1, 2, 2, 3]);
        assert_eq!(map.row(1).to_vec(), vec![1, 2, 3, 3, 4]);
    }

    #[test]
    fn paired_extraction_fills_groups_in_lockstep() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pairs");
        let pair = |a: &[u8], b: &[u8]| PairedWindows {
            seq: one_hot_encode(a),
            ctrl: one_hot_encode(b),
        };
        let data = VecDataset(vec![pair(b"ACG", b"GCA"), pair(b"TTT", b"TTT"), pair(b"AAA", b"AAA")]);
        EmbeddingExtractor::new(OneHotBaseline, 2).extract(&data, &out).unwrap();

        let store = StoreReader::open(&out).unwrap();
        let seq = store.group("seq").unwrap();
        let ctrl = store.group("ctrl").unwrap();
        assert_eq!(seq.chunk_keys(), ctrl.chunk_keys());
        assert_eq!(ctrl.position_embeddings(0).unwrap()[[0, 2]], 1.0);
    }

    #[test]
    fn fixed_map_verification_counts_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nt");
        let data = windows(&[b"ACGTACGTAC", b"ACGNACGTAC"]);
        let summary = EmbeddingExtractor::new(KmerEmbedder::nucleotide_transformer(4, 0), 1)
            .verify_fixed(true)
            .extract(&data, &out)
            .unwrap();
        assert_eq!(summary.index_mismatches, 1);
    }

    #[test]
    fn ragged_windows_fail_without_final_store() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("ragged");
        let data = windows(&[b"ACGT", b"ACGTA"]);
        let result = EmbeddingExtractor::new(OneHotBaseline, 1).extract(&data, &out);
        assert!(matches!(result, Err(ExtractError::RaggedWindows { .. })));
        assert!(!out.exists());
    }
}
