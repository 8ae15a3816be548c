//! Sequence model abstractions.
//!
//! Pretrained genomic language models are external collaborators; the crate
//! sees them through [`SequenceModel`] (tokenize + embed) and
//! [`LikelihoodModel`] (per-nucleotide log-likelihoods). Each family fixes how
//! token outputs map back to nucleotide positions ([`IndexLayout`]).

mod baseline;
mod index_map;

pub use baseline::{
    CharTokenizer, KmerEmbedder, KmerTokenizer, MarkovLikelihood, OneHotBaseline,
};
pub use index_map::{
    gather_positions, kmer_indices, offsets_to_indices, FixedIndex, IndexMap,
};

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, Array3};
use thiserror::Error;

use crate::genomics::Window;

/// Padding token id.
pub const PAD_ID: u32 = 0;
/// Classification token id.
pub const CLS_ID: u32 = 1;
/// Id of the first single-nucleotide token (`A`); `C, G, T, N` follow.
pub const BASE_ID_OFFSET: u32 = 2;
/// Id of the first k-mer token.
pub const KMER_ID_OFFSET: u32 = 7;

/// Errors raised by models and tokenizers.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Input batch was empty or ragged.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
    /// Tensor shapes disagree.
    #[error("shape mismatch: expected {expected}, found {found}")]
    Shape {
        /// Expected shape description.
        expected: String,
        /// Observed shape description.
        found: String,
    },
    /// Unrecognised model family name.
    #[error("unknown model family '{0}'")]
    UnknownFamily(String),
}

/// Mapping scheme from nucleotide positions to token outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLayout {
    /// Per-example map computed from tokenizer offsets.
    Variable,
    /// One token per position, shared `[0, L]` slice.
    Slice,
    /// Fixed k-mer blocks after a leading CLS token.
    Kmer {
        /// Block size.
        k: usize,
    },
}

/// Supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    /// BPE tokens with offsets.
    Dnabert2,
    /// BPE tokens with offsets.
    MistralDna,
    /// BPE tokens with offsets.
    GenaLm,
    /// Non-overlapping 6-mers after CLS.
    NucleotideTransformer,
    /// Character-level tokens.
    HyenaDna,
    /// Character-level tokens.
    Caduceus,
    /// One-hot sequence baseline.
    SequenceBaseline,
}

impl ModelFamily {
    /// All families in declaration order.
    pub const ALL: [ModelFamily; 7] = [
        ModelFamily::Dnabert2,
        ModelFamily::MistralDna,
        ModelFamily::GenaLm,
        ModelFamily::NucleotideTransformer,
        ModelFamily::HyenaDna,
        ModelFamily::Caduceus,
        ModelFamily::SequenceBaseline,
    ];

    /// How token outputs of this family map to positions.
    pub fn index_layout(self) -> IndexLayout {
        match self {
            ModelFamily::Dnabert2 | ModelFamily::MistralDna | ModelFamily::GenaLm => {
                IndexLayout::Variable
            }
            ModelFamily::NucleotideTransformer => IndexLayout::Kmer { k: 6 },
            ModelFamily::HyenaDna | ModelFamily::Caduceus | ModelFamily::SequenceBaseline => {
                IndexLayout::Slice
            }
        }
    }

    /// Hub organisation prefix of the family's published checkpoints.
    pub fn hub_prefix(self) -> Option<&'static str> {
        match self {
            ModelFamily::Dnabert2 => Some("zhihan1996"),
            ModelFamily::MistralDna => Some("RaphaelMourad"),
            ModelFamily::GenaLm => Some("AIRI-Institute"),
            ModelFamily::NucleotideTransformer => Some("InstaDeepAI"),
            ModelFamily::HyenaDna => Some("LongSafari"),
            ModelFamily::Caduceus => Some("kuleshov-group"),
            ModelFamily::SequenceBaseline => None,
        }
    }

    /// Command-line name.
    pub fn name(self) -> &'static str {
        match self {
            ModelFamily::Dnabert2 => "dnabert2",
            ModelFamily::MistralDna => "mistral-dna",
            ModelFamily::GenaLm => "gena-lm",
            ModelFamily::NucleotideTransformer => "nucleotide-transformer",
            ModelFamily::HyenaDna => "hyenadna",
            ModelFamily::Caduceus => "caduceus",
            ModelFamily::SequenceBaseline => "sequence-baseline",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelFamily {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|family| family.name() == wanted)
            .ok_or_else(|| ModelError::UnknownFamily(s.to_string()))
    }
}

/// Tokenized batch, right-padded with [`PAD_ID`].
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBatch {
    /// Token ids, `[batch, tokens]`.
    pub ids: Array2<u32>,
    /// Per-example `(start, end)` nucleotide span of every token.
    pub offsets: Vec<Vec<(usize, usize)>>,
    /// Window length in nucleotides.
    pub seq_len: usize,
}

impl TokenBatch {
    /// Number of examples.
    pub fn len(&self) -> usize {
        self.ids.nrows()
    }

    /// Returns `true` for an empty batch.
    pub fn is_empty(&self) -> bool {
        self.ids.nrows() == 0
    }
}

/// Converts nucleotide strings into token ids with offsets.
pub trait Tokenizer {
    /// Tokens and nucleotide offsets of one sequence.
    fn encode(&self, sequence: &[u8]) -> (Vec<u32>, Vec<(usize, usize)>);

    /// Size of the id space.
    fn vocab_size(&self) -> usize;

    /// Tokenize equal-length sequences into a padded batch.
    fn encode_batch(&self, sequences: &[Vec<u8>]) -> Result<TokenBatch, ModelError> {
        let seq_len = sequences.first().map_or(0, Vec::len);
        if sequences.iter().any(|s| s.len() != seq_len) {
            return Err(ModelError::InvalidBatch(
                "sequences in a batch must share one length".to_string(),
            ));
        }
        let encoded: Vec<_> = sequences.iter().map(|s| self.encode(s)).collect();
        let width = encoded.iter().map(|(ids, _)| ids.len()).max().unwrap_or(0);
        let mut ids = Array2::from_elem((sequences.len(), width), PAD_ID);
        let mut offsets = Vec::with_capacity(encoded.len());
        for (row, (tokens, spans)) in encoded.into_iter().enumerate() {
            for (col, token) in tokens.into_iter().enumerate() {
                ids[[row, col]] = token;
            }
            offsets.push(spans);
        }
        Ok(TokenBatch {
            ids,
            offsets,
            seq_len,
        })
    }
}

/// Embedding model over one-hot windows.
pub trait SequenceModel {
    /// Family of the model.
    fn family(&self) -> ModelFamily;

    /// Width of each token embedding.
    fn embedding_dim(&self) -> usize;

    /// Position-to-token mapping scheme.
    fn index_layout(&self) -> IndexLayout {
        self.family().index_layout()
    }

    /// Tokenize a batch of windows.
    fn tokenize(&self, windows: &[Window]) -> Result<TokenBatch, ModelError>;

    /// Token embeddings `[batch, tokens, dim]`; inference only.
    fn embed(&self, tokens: &TokenBatch) -> Result<Array3<f32>, ModelError>;
}

/// Model scoring nucleotide sequences.
pub trait LikelihoodModel {
    /// Natural-log likelihood of every nucleotide of `sequence`.
    fn nucleotide_log_likelihoods(&self, sequence: &[u8]) -> Result<Vec<f32>, ModelError>;

    /// Sum of per-nucleotide log-likelihoods.
    fn log_likelihood(&self, sequence: &[u8]) -> Result<f64, ModelError> {
        Ok(self
            .nucleotide_log_likelihoods(sequence)?
            .iter()
            .map(|&v| f64::from(v))
            .sum())
    }
}
