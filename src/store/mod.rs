//! Chunked embedding store.
//!
//! A store is a directory holding `manifest.json` and one safetensors file
//! per written range, each carrying a single tensor named after its dataset:
//!
//! ```text
//! <path>/manifest.json
//! <path>/<group>/idx_var_<start>_<end>.safetensors  idx_var  u32 [end - start, L]
//! <path>/<group>/idx_fix.safetensors                idx_fix  u32 [2] (slice) or [L] (gather)
//! <path>/<group>/emb_<start>_<end>.safetensors      emb_<start>_<end>  f32 [end - start, T, d]
//! ```
//!
//! Writers build everything under `<path>.tmp` and rename it to `<path>`
//! only from [`StoreWriter::finish`]; a writer dropped before that leaves no
//! store at `<path>`.

mod reader;
mod writer;

pub use reader::{GroupReader, StoreReader};
pub use writer::StoreWriter;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use bytemuck::{AnyBitPattern, NoUninit};
use safetensors::tensor::{Dtype, SafeTensorError, SafeTensors, TensorView};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ModelError;

/// Manifest file name inside a store directory.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Current manifest format version.
pub const FORMAT_VERSION: u32 = 1;

/// Errors raised by store readers and writers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Source error.
        source: io::Error,
    },
    /// Tensor file could not be encoded or decoded.
    #[error("tensor file {path}: {reason}")]
    Tensor {
        /// File being accessed.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },
    /// Manifest could not be encoded or decoded.
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    /// Group does not exist.
    #[error("unknown group '{0}'")]
    UnknownGroup(String),
    /// Group already exists.
    #[error("group '{0}' already exists")]
    DuplicateGroup(String),
    /// Chunk does not start where the previous one ended.
    #[error("group '{group}': chunk starting at {start} is not contiguous (expected {expected})")]
    NonContiguous {
        /// Group name.
        group: String,
        /// Requested start.
        start: usize,
        /// Next expected start.
        expected: usize,
    },
    /// Array shape disagrees with the group layout.
    #[error("group '{group}': {reason}")]
    Shape {
        /// Group name.
        group: String,
        /// Description of the mismatch.
        reason: String,
    },
    /// Group was not fully written before finishing.
    #[error("group '{group}' covers {written} of {expected} examples")]
    Incomplete {
        /// Group name.
        group: String,
        /// Examples written.
        written: usize,
        /// Examples declared.
        expected: usize,
    },
    /// Example index outside the group.
    #[error("example {idx} out of range for group of {len}")]
    OutOfRange {
        /// Requested example.
        idx: usize,
        /// Group length.
        len: usize,
    },
    /// Stored index map is inconsistent with the embeddings.
    #[error(transparent)]
    Model(#[from] ModelError),
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Store-level manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version.
    pub version: u32,
    /// Groups keyed by name.
    pub groups: BTreeMap<String, GroupManifest>,
}

/// Description of one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupManifest {
    /// Number of examples `N`.
    pub num_examples: usize,
    /// Window length `L`.
    pub seq_len: usize,
    /// Position-to-token map.
    pub index: Option<IndexEntry>,
    /// Embedding chunks in write order.
    pub chunks: Vec<ChunkEntry>,
}

/// Stored index map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexEntry {
    /// `idx_var`, `[N, L]`, written as contiguous row ranges.
    Variable {
        /// Row ranges in write order.
        parts: Vec<IndexPart>,
    },
    /// `idx_fix` in slice form, `[start, end]`.
    Slice {
        /// Relative file path.
        file: String,
    },
    /// `idx_fix` as an explicit `[L]` map.
    Gather {
        /// Relative file path.
        file: String,
    },
}

/// Rows `[start, end)` of a variable index map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPart {
    /// First example (inclusive).
    pub start: usize,
    /// Last example (exclusive).
    pub end: usize,
    /// Relative file path.
    pub file: String,
}

/// One `emb_<start>_<end>` chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// First example (inclusive).
    pub start: usize,
    /// Last example (exclusive).
    pub end: usize,
    /// Tokens per example `T`.
    pub tokens: usize,
    /// Embedding width `d`.
    pub dim: usize,
    /// Relative file path.
    pub file: String,
}

impl ChunkEntry {
    /// Dataset name, `emb_<start>_<end>`.
    pub fn key(&self) -> String {
        chunk_key(self.start, self.end)
    }

    /// Example range covered.
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Dataset name of an embedding chunk.
pub fn chunk_key(start: usize, end: usize) -> String {
    format!("emb_{start}_{end}")
}

/// Path of the temporary directory a writer for `path` builds under.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Tensor name of the variable index map.
pub const VARIABLE_INDEX: &str = "idx_var";
/// Tensor name of the fixed index map.
pub const FIXED_INDEX: &str = "idx_fix";

fn tensor_error(path: &Path) -> impl FnOnce(SafeTensorError) -> StoreError + '_ {
    move |e| StoreError::Tensor {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn write_tensor(
    path: &Path,
    name: &str,
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: &[u8],
) -> Result<(), StoreError> {
    let view = TensorView::new(dtype, shape, bytes).map_err(tensor_error(path))?;
    let encoded = safetensors::serialize([(name, view)], None).map_err(tensor_error(path))?;
    fs::write(path, encoded).map_err(io_error(path))
}

fn read_tensor<T: AnyBitPattern + NoUninit>(
    path: &Path,
    name: &str,
    dtype: Dtype,
) -> Result<(Vec<usize>, Vec<T>), StoreError> {
    let bytes = fs::read(path).map_err(io_error(path))?;
    let tensors = SafeTensors::deserialize(&bytes).map_err(tensor_error(path))?;
    let view = tensors.tensor(name).map_err(tensor_error(path))?;
    if view.dtype() != dtype {
        return Err(StoreError::Tensor {
            path: path.to_path_buf(),
            reason: format!("tensor '{name}' is {:?}, expected {dtype:?}", view.dtype()),
        });
    }
    // The data offset inside the file buffer need not be aligned for `T`.
    Ok((view.shape().to_vec(), bytemuck::pod_collect_to_vec(view.data())))
}

pub(crate) fn write_f32_tensor(
    path: &Path,
    name: &str,
    shape: Vec<usize>,
    values: &[f32],
) -> Result<(), StoreError> {
    write_tensor(path, name, Dtype::F32, shape, bytemuck::cast_slice(values))
}

pub(crate) fn write_u32_tensor(
    path: &Path,
    name: &str,
    shape: Vec<usize>,
    values: &[u32],
) -> Result<(), StoreError> {
    write_tensor(path, name, Dtype::U32, shape, bytemuck::cast_slice(values))
}

pub(crate) fn read_f32_tensor(path: &Path, name: &str) -> Result<(Vec<usize>, Vec<f32>), StoreError> {
    read_tensor(path, name, Dtype::F32)
}

pub(crate) fn read_u32_tensor(path: &Path, name: &str) -> Result<(Vec<usize>, Vec<u32>), StoreError> {
    read_tensor(path, name, Dtype::U32)
}
