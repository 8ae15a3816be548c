//! Built-in models.
//!
//! Small, deterministic stand-ins for pretrained language models so every
//! pipeline stage can run without external weights.

use ndarray::{s, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    IndexLayout, LikelihoodModel, ModelError, ModelFamily, SequenceModel, TokenBatch, Tokenizer,
    BASE_ID_OFFSET, CLS_ID, KMER_ID_OFFSET,
};
use crate::genomics::{base_index, onehot_to_chars, Window, NUM_BASES};

fn base_token(base: u8) -> u32 {
    match base_index(base) {
        Some(idx) => BASE_ID_OFFSET + idx as u32,
        None => BASE_ID_OFFSET + NUM_BASES as u32,
    }
}

fn kmer_code(kmer: &[u8]) -> Option<u32> {
    kmer.iter().try_fold(0u32, |code, &base| {
        base_index(base).map(|idx| code * NUM_BASES as u32 + idx as u32)
    })
}

fn windows_to_sequences(windows: &[Window]) -> Vec<Vec<u8>> {
    windows.iter().map(|w| onehot_to_chars(w.view())).collect()
}

/// One token per nucleotide, no special tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn encode(&self, sequence: &[u8]) -> (Vec<u32>, Vec<(usize, usize)>) {
        let ids = sequence.iter().map(|&b| base_token(b)).collect();
        let offsets = (0..sequence.len()).map(|p| (p, p + 1)).collect();
        (ids, offsets)
    }

    fn vocab_size(&self) -> usize {
        KMER_ID_OFFSET as usize
    }
}

/// Non-overlapping k-mer tokenizer.
///
/// Each block of `k` unambiguous bases becomes one k-mer token; blocks
/// holding an ambiguous base, and the tail shorter than `k`, fall back to
/// single-nucleotide tokens. An optional leading CLS token has offset
/// `(0, 0)`.
#[derive(Debug, Clone, Copy)]
pub struct KmerTokenizer {
    k: usize,
    cls: bool,
}

impl KmerTokenizer {
    /// Tokenizer with block size `k`, prefixed with CLS when `cls` is set.
    pub fn new(k: usize, cls: bool) -> Self {
        Self { k: k.max(1), cls }
    }

    /// Block size.
    pub fn k(&self) -> usize {
        self.k
    }
}

impl Tokenizer for KmerTokenizer {
    fn encode(&self, sequence: &[u8]) -> (Vec<u32>, Vec<(usize, usize)>) {
        let mut ids = Vec::with_capacity(sequence.len() / self.k + 2);
        let mut offsets = Vec::with_capacity(ids.capacity());
        if self.cls {
            ids.push(CLS_ID);
            offsets.push((0, 0));
        }
        let mut pos = 0;
        while pos < sequence.len() {
            let end = pos + self.k;
            if let Some(code) = sequence.get(pos..end).and_then(kmer_code) {
                ids.push(KMER_ID_OFFSET + code);
                offsets.push((pos, end));
                pos = end;
                continue;
            }
            let block_end = end.min(sequence.len());
            for p in pos..block_end {
                ids.push(base_token(sequence[p]));
                offsets.push((p, p + 1));
            }
            pos = block_end;
        }
        (ids, offsets)
    }

    fn vocab_size(&self) -> usize {
        KMER_ID_OFFSET as usize + NUM_BASES.pow(self.k as u32)
    }
}

/// One-hot sequence baseline: every nucleotide embeds as its indicator row.
#[derive(Debug, Clone, Copy, Default)]
pub struct OneHotBaseline;

impl SequenceModel for OneHotBaseline {
    fn family(&self) -> ModelFamily {
        ModelFamily::SequenceBaseline
    }

    fn embedding_dim(&self) -> usize {
        NUM_BASES
    }

    fn tokenize(&self, windows: &[Window]) -> Result<TokenBatch, ModelError> {
        CharTokenizer.encode_batch(&windows_to_sequences(windows))
    }

    fn embed(&self, tokens: &TokenBatch) -> Result<Array3<f32>, ModelError> {
        let (batch, width) = tokens.ids.dim();
        let mut out = Array3::zeros((batch, width, NUM_BASES));
        for ((b, t), &id) in tokens.ids.indexed_iter() {
            let col = id.wrapping_sub(BASE_ID_OFFSET) as usize;
            if col < NUM_BASES {
                out[[b, t, col]] = 1.0;
            }
        }
        Ok(out)
    }
}

/// Random k-mer embedding table behind a [`KmerTokenizer`].
#[derive(Debug, Clone)]
pub struct KmerEmbedder {
    family: ModelFamily,
    tokenizer: KmerTokenizer,
    table: Array2<f32>,
}

impl KmerEmbedder {
    /// Nucleotide-transformer style embedder: CLS followed by 6-mers.
    pub fn nucleotide_transformer(dim: usize, seed: u64) -> Self {
        Self::build(ModelFamily::NucleotideTransformer, KmerTokenizer::new(6, true), dim, seed)
    }

    /// Embedder for a variable-offset family with block size `k`.
    pub fn variable(family: ModelFamily, k: usize, dim: usize, seed: u64) -> Result<Self, ModelError> {
        if family.index_layout() != IndexLayout::Variable {
            return Err(ModelError::InvalidBatch(format!(
                "{family} does not use variable offsets"
            )));
        }
        Ok(Self::build(family, KmerTokenizer::new(k, true), dim, seed))
    }

    fn build(family: ModelFamily, tokenizer: KmerTokenizer, dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (dim.max(1) as f32).sqrt();
        let mut table =
            Array2::from_shape_fn((tokenizer.vocab_size(), dim), |_| rng.gen_range(-scale..scale));
        table.row_mut(super::PAD_ID as usize).fill(0.0);
        Self {
            family,
            tokenizer,
            table,
        }
    }

    /// Tokenizer in use.
    pub fn tokenizer(&self) -> &KmerTokenizer {
        &self.tokenizer
    }

    /// Embedding table `[vocab, dim]`.
    pub fn table(&self) -> &Array2<f32> {
        &self.table
    }
}

impl SequenceModel for KmerEmbedder {
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn embedding_dim(&self) -> usize {
        self.table.ncols()
    }

    fn index_layout(&self) -> IndexLayout {
        match self.family.index_layout() {
            IndexLayout::Kmer { .. } => IndexLayout::Kmer { k: self.tokenizer.k() },
            layout => layout,
        }
    }

    fn tokenize(&self, windows: &[Window]) -> Result<TokenBatch, ModelError> {
        self.tokenizer.encode_batch(&windows_to_sequences(windows))
    }

    fn embed(&self, tokens: &TokenBatch) -> Result<Array3<f32>, ModelError> {
        let (batch, width) = tokens.ids.dim();
        let dim = self.table.ncols();
        let mut out = Array3::zeros((batch, width, dim));
        for ((b, t), &id) in tokens.ids.indexed_iter() {
            if id as usize >= self.table.nrows() {
                return Err(ModelError::Shape {
                    expected: format!("token id < {}", self.table.nrows()),
                    found: id.to_string(),
                });
            }
            out.slice_mut(s![b, t, ..]).assign(&self.table.row(id as usize));
        }
        Ok(out)
    }
}

/// Order-k Markov background model with add-one smoothing.
///
/// Nucleotides whose full context is unavailable (sequence start or an
/// ambiguous base inside the context) are scored with the longest clean
/// suffix of the context. Ambiguous nucleotides contribute zero.
#[derive(Debug, Clone)]
pub struct MarkovLikelihood {
    order: usize,
    // tables[o] has one row of log-probabilities per context of length o.
    tables: Vec<Array2<f32>>,
}

impl MarkovLikelihood {
    /// Fit an order-`order` model on `sequences`.
    pub fn fit<S: AsRef<[u8]>>(sequences: &[S], order: usize) -> Self {
        let mut counts: Vec<Array2<f32>> = (0..=order)
            .map(|o| Array2::from_elem((NUM_BASES.pow(o as u32), NUM_BASES), 1.0))
            .collect();
        for sequence in sequences {
            let sequence = sequence.as_ref();
            for (pos, &base) in sequence.iter().enumerate() {
                let Some(col) = base_index(base) else { continue };
                for (o, table) in counts.iter_mut().enumerate() {
                    if pos < o {
                        break;
                    }
                    if let Some(ctx) = kmer_code(&sequence[pos - o..pos]) {
                        table[[ctx as usize, col]] += 1.0;
                    }
                }
            }
        }
        for table in &mut counts {
            for mut row in table.rows_mut() {
                let total: f32 = row.sum();
                row.mapv_inplace(|c| (c / total).ln());
            }
        }
        Self {
            order,
            tables: counts,
        }
    }

    /// Context length.
    pub fn order(&self) -> usize {
        self.order
    }
}

impl LikelihoodModel for MarkovLikelihood {
    fn nucleotide_log_likelihoods(&self, sequence: &[u8]) -> Result<Vec<f32>, ModelError> {
        let scores = sequence
            .iter()
            .enumerate()
            .map(|(pos, &base)| {
                let Some(col) = base_index(base) else {
                    return 0.0;
                };
                (0..=self.order.min(pos))
                    .rev()
                    .find_map(|o| {
                        kmer_code(&sequence[pos - o..pos])
                            .map(|ctx| self.tables[o][[ctx as usize, col]])
                    })
                    .unwrap_or(self.tables[0][[0, col]])
            })
            .collect();
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genomics::one_hot_encode;

    #[test]
    fn kmer_tokenizer_splits_ambiguous_blocks() {
        let tokenizer = KmerTokenizer::new(3, true);
        let (ids, offsets) = tokenizer.encode(b"ACGNACGTA");
        assert_eq!(ids[0], CLS_ID);
        // ACG -> 0*16 + 1*4 + 2
        assert_eq!(ids[1], KMER_ID_OFFSET + 6);
        assert_eq!(&ids[2..5], &[6, 2, 3]);
        assert_eq!(offsets[2], (3, 4));
        assert_eq!(*offsets.last().unwrap(), (6, 9));
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn one_hot_baseline_reproduces_window() {
        let window = one_hot_encode(b"ACGTN");
        let model = OneHotBaseline;
        let tokens = model.tokenize(std::slice::from_ref(&window)).unwrap();
        let emb = model.embed(&tokens).unwrap();
        assert_eq!(emb.dim(), (1, 5, 4));
        for p in 0..5 {
            for c in 0..4 {
                assert_eq!(emb[[0, p, c]], f32::from(window[[p, c]]));
            }
        }
    }

    #[test]
    fn kmer_embedder_is_seeded() {
        let a = KmerEmbedder::nucleotide_transformer(8, 11);
        let b = KmerEmbedder::nucleotide_transformer(8, 11);
        assert_eq!(a.table(), b.table());
        assert_eq!(a.index_layout(), IndexLayout::Kmer { k: 6 });
        assert!(KmerEmbedder::variable(ModelFamily::HyenaDna, 3, 8, 0).is_err());
    }

    #[test]
    fn markov_model_prefers_training_composition() {
        let model = MarkovLikelihood::fit(&[b"ACACACACACACACAC".to_vec()], 1);
        let seen = model.log_likelihood(b"ACACAC").unwrap();
        let unseen = model.log_likelihood(b"GTGTGT").unwrap();
        assert!(seen > unseen);
        assert_eq!(model.nucleotide_log_likelihoods(b"N").unwrap(), vec![0.0]);
    }
}
