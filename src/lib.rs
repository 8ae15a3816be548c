//! # dnalm-bench
//!
//! Benchmarking harness for DNA language models.
//!
//! The crate turns genome coordinate tables into one-hot sequence windows,
//! runs them through a sequence model, persists token embeddings to a chunked
//! on-disk store, trains lightweight probing heads on top of those embeddings
//! and evaluates everything against held-out chromosomes.
//!
//! ## Pipeline
//!
//! 1. **Datasets** ([`dataset`]): elements table + genome → windows, paired
//!    controls, signal tracks, or variant allele pairs.
//! 2. **Extraction** ([`extract`]): tokenize → forward → offset-to-index map →
//!    `emb_<start>_<end>` chunks written to [`store`].
//! 3. **Training** ([`train`]): convolutional probes or LoRA-adapted models,
//!    per-epoch checkpoints, resumption, out-of-memory fallback.
//! 4. **Evaluation** ([`evaluate`]): AUROC/AUPRC/MCC/accuracy and
//!    Pearson/Spearman on log1p counts, reported as JSON.
//!
//! ## Usage Example
//!
//! ```ignore
//! use dnalm_bench::{BenchConfig, EmbeddingExtractor, OneHotBaseline};
//!
//! let config = BenchConfig::from_env();
//! let extractor = EmbeddingExtractor::new(OneHotBaseline, 64);
//! let summary = extractor.extract(&dataset, &config.work_path("emb/onehot"))?;
//! assert_eq!(summary.examples, dataset.len());
//! ```

#![warn(missing_docs, missing_debug_implementations)]
#![allow(clippy::new_without_default)]

pub mod config;   // Process configuration and chromosome splits
pub mod genomics; // Reference access, one-hot encoding, element tables
pub mod dataset;  // Windowing datasets
pub mod model;    // Tokenizers, model families, index maps
pub mod store;    // Chunked embedding store
pub mod extract;  // Embedding extraction pipeline
pub mod evaluate; // Metrics, likelihood and variant evaluators
pub mod train;    // Probing / fine-tuning trainer

// Re-exports for convenience
pub use config::{BenchConfig, ChromSplit};
pub use dataset::{Dataset, Example, Target};
pub use evaluate::MetricsReport;
pub use extract::{EmbeddingExtractor, ExtractionSummary};
pub use genomics::{GenomeSource, Window};
pub use model::{IndexLayout, IndexMap, KmerEmbedder, ModelFamily, OneHotBaseline, SequenceModel};
pub use store::{StoreReader, StoreWriter};
pub use train::{ConvProbe, LoraKmerModel, Objective, Trainable, Trainer, TrainerConfig};
