use std::cell::RefCell;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::{s, Array1, Array2, Array3, Axis};

use super::{
    io_error, read_f32_tensor, read_u32_tensor, GroupManifest, IndexEntry, IndexPart, Manifest,
    StoreError, FIXED_INDEX, MANIFEST_FILE, VARIABLE_INDEX,
};
use crate::model::{gather_positions, FixedIndex, IndexMap};

/// Read-only view of a finished store.
#[derive(Debug, Clone)]
pub struct StoreReader {
    root: PathBuf,
    manifest: Manifest,
}

impl StoreReader {
    /// Open the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        let manifest_path = root.join(MANIFEST_FILE);
        let bytes = fs::read(&manifest_path).map_err(io_error(&manifest_path))?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        Ok(Self { root, manifest })
    }

    /// Store location.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Parsed manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Group names in lexical order.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.manifest.groups.keys().map(String::as_str)
    }

    /// Reader for one group.
    pub fn group(&self, name: &str) -> Result<GroupReader, StoreError> {
        let manifest = self
            .manifest
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownGroup(name.to_string()))?;
        GroupReader::new(self.root.clone(), name.to_string(), manifest)
    }
}

/// Random access to one group's index map and embedding chunks.
///
/// The most recently read chunk and index part are cached, so sequential
/// access reads each file once.
#[derive(Debug)]
pub struct GroupReader {
    root: PathBuf,
    name: String,
    manifest: GroupManifest,
    fixed: Option<FixedIndex>,
    cache: RefCell<Option<(usize, Array3<f32>)>>,
    index_cache: RefCell<Option<(usize, Array2<u32>)>>,
}

impl GroupReader {
    fn new(root: PathBuf, name: String, manifest: GroupManifest) -> Result<Self, StoreError> {
        let fixed = match &manifest.index {
            Some(IndexEntry::Slice { file }) => {
                let (_, values) = read_u32_tensor(&root.join(file), FIXED_INDEX)?;
                match values.as_slice() {
                    &[start, end] => Some(FixedIndex::Slice { start, end }),
                    _ => {
                        return Err(StoreError::Shape {
                            group: name,
                            reason: format!("slice index has {} entries", values.len()),
                        })
                    }
                }
            }
            Some(IndexEntry::Gather { file }) => Some(FixedIndex::Gather(Array1::from(
                read_u32_tensor(&root.join(file), FIXED_INDEX)?.1,
            ))),
            Some(IndexEntry::Variable { .. }) | None => None,
        };
        Ok(Self {
            root,
            name,
            manifest,
            fixed,
            cache: RefCell::new(None),
            index_cache: RefCell::new(None),
        })
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.manifest.num_examples
    }

    /// Returns `true` when the group holds no examples.
    pub fn is_empty(&self) -> bool {
        self.manifest.num_examples == 0
    }

    /// Window length.
    pub fn seq_len(&self) -> usize {
        self.manifest.seq_len
    }

    /// Embedding width, if any chunk was written.
    pub fn embedding_dim(&self) -> Option<usize> {
        self.manifest.chunks.first().map(|c| c.dim)
    }

    /// Example ranges of the chunks in write order.
    pub fn chunk_ranges(&self) -> Vec<Range<usize>> {
        self.manifest.chunks.iter().map(|c| c.range()).collect()
    }

    /// Chunk dataset names (`emb_<start>_<end>`) in write order.
    pub fn chunk_keys(&self) -> Vec<String> {
        self.manifest.chunks.iter().map(|c| c.key()).collect()
    }

    fn check(&self, idx: usize) -> Result<(), StoreError> {
        if idx >= self.len() {
            return Err(StoreError::OutOfRange {
                idx,
                len: self.len(),
            });
        }
        Ok(())
    }

    /// Full index map of the group. Loads all of `idx_var` for variable maps.
    pub fn index_map(&self) -> Result<IndexMap, StoreError> {
        if let Some(fixed) = &self.fixed {
            return Ok(IndexMap::Fixed(fixed.clone()));
        }
        match &self.manifest.index {
            Some(IndexEntry::Variable { parts }) => {
                let mut values = Vec::with_capacity(self.len() * self.seq_len());
                for part in parts {
                    values.extend(self.read_index_part(part)?.iter().copied());
                }
                let shape = (self.len(), self.seq_len());
                let map = Array2::from_shape_vec(shape, values).map_err(|e| StoreError::Shape {
                    group: self.name.clone(),
                    reason: e.to_string(),
                })?;
                Ok(IndexMap::Variable(map))
            }
            _ => Err(StoreError::Shape {
                group: self.name.clone(),
                reason: "no index map stored".to_string(),
            }),
        }
    }

    /// Token index of every position of example `idx`.
    pub fn index_row(&self, idx: usize) -> Result<Vec<u32>, StoreError> {
        self.check(idx)?;
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.positions(self.seq_len()));
        }
        let Some(IndexEntry::Variable { parts }) = &self.manifest.index else {
            return Err(StoreError::Shape {
                group: self.name.clone(),
                reason: "no index map stored".to_string(),
            });
        };
        let part_no = parts.partition_point(|p| p.end <= idx);
        let part = parts.get(part_no).ok_or(StoreError::OutOfRange {
            idx,
            len: self.len(),
        })?;

        let mut cache = self.index_cache.borrow_mut();
        let cached = matches!(&*cache, Some((id, _)) if *id == part_no);
        if !cached {
            *cache = Some((part_no, self.read_index_part(part)?));
        }
        match &*cache {
            Some((_, rows)) => Ok(rows.row(idx - part.start).to_vec()),
            None => Err(StoreError::OutOfRange {
                idx,
                len: self.len(),
            }),
        }
    }

    fn read_index_part(&self, part: &IndexPart) -> Result<Array2<u32>, StoreError> {
        let (shape, values) = read_u32_tensor(&self.root.join(&part.file), VARIABLE_INDEX)?;
        let expected = [part.end - part.start, self.seq_len()];
        if shape != expected {
            return Err(StoreError::Shape {
                group: self.name.clone(),
                reason: format!("index rows {}..{} have shape {shape:?}", part.start, part.end),
            });
        }
        let dims = (expected[0], expected[1]);
        Array2::from_shape_vec(dims, values).map_err(|e| StoreError::Shape {
            group: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Embeddings of chunk number `chunk`, `[batch, T, d]`.
    pub fn read_chunk(&self, chunk: usize) -> Result<Array3<f32>, StoreError> {
        let entry = self
            .manifest
            .chunks
            .get(chunk)
            .ok_or(StoreError::OutOfRange {
                idx: chunk,
                len: self.manifest.chunks.len(),
            })?;
        let key = entry.key();
        let (shape, values) = read_f32_tensor(&self.root.join(&entry.file), &key)?;
        let expected = [entry.end - entry.start, entry.tokens, entry.dim];
        if shape != expected {
            return Err(StoreError::Shape {
                group: self.name.clone(),
                reason: format!("{key} has shape {shape:?}, manifest says {expected:?}"),
            });
        }
        let dims = (expected[0], expected[1], expected[2]);
        Array3::from_shape_vec(dims, values).map_err(|e| StoreError::Shape {
            group: self.name.clone(),
            reason: format!("{key}: {e}"),
        })
    }

    /// Token embeddings `[T, d]` of example `idx`.
    pub fn token_embeddings(&self, idx: usize) -> Result<Array2<f32>, StoreError> {
        self.check(idx)?;
        let chunks = &self.manifest.chunks;
        let chunk = chunks.partition_point(|c| c.end <= idx);
        let entry = chunks.get(chunk).ok_or(StoreError::OutOfRange {
            idx,
            len: self.len(),
        })?;

        let mut cache = self.cache.borrow_mut();
        let cached = matches!(&*cache, Some((id, _)) if *id == chunk);
        if !cached {
            *cache = Some((chunk, self.read_chunk(chunk)?));
        }
        match &*cache {
            Some((_, data)) => Ok(data.index_axis(Axis(0), idx - entry.start).to_owned()),
            None => Err(StoreError::OutOfRange {
                idx,
                len: self.len(),
            }),
        }
    }

    /// Per-position embeddings `[L, d]` of example `idx`, gathered through
    /// the index map.
    pub fn position_embeddings(&self, idx: usize) -> Result<Array2<f32>, StoreError> {
        let tokens = self.token_embeddings(idx)?;
        let positions = self.index_row(idx)?;
        Ok(gather_positions(tokens.view(), &positions)?)
    }

    /// Mean of the per-position embeddings over `positions`.
    pub fn pooled_embedding(
        &self,
        idx: usize,
        positions: Range<usize>,
    ) -> Result<Array1<f32>, StoreError> {
        let per_position = self.position_embeddings(idx)?;
        let end = positions.end.min(per_position.nrows());
        let start = positions.start.min(end);
        let region = per_position.slice(s![start..end, ..]);
        Ok(region
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(per_position.ncols())))
    }
}
