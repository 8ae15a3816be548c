use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{ArrayView2, ArrayView3};
use tracing::{debug, info};

use super::{
    chunk_key, io_error, tmp_path, write_f32_tensor, write_u32_tensor, ChunkEntry, GroupManifest,
    IndexEntry, IndexPart, Manifest, StoreError, FIXED_INDEX, FORMAT_VERSION, MANIFEST_FILE,
    VARIABLE_INDEX,
};
use crate::model::FixedIndex;

#[derive(Debug)]
struct GroupState {
    manifest: GroupManifest,
    next_start: usize,
    next_index_row: usize,
}

/// Single writer of an embedding store.
#[derive(Debug)]
pub struct StoreWriter {
    final_path: PathBuf,
    tmp: PathBuf,
    groups: BTreeMap<String, GroupState>,
}

impl StoreWriter {
    /// Start a store at `path`, building under `<path>.tmp`. A stale
    /// temporary directory from an earlier failed run is discarded.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let final_path = path.as_ref().to_path_buf();
        let tmp = tmp_path(&final_path);
        if tmp.exists() {
            debug!(path = %tmp.display(), "removing stale temporary store");
            fs::remove_dir_all(&tmp).map_err(io_error(&tmp))?;
        }
        fs::create_dir_all(&tmp).map_err(io_error(&tmp))?;
        Ok(Self {
            final_path,
            tmp,
            groups: BTreeMap::new(),
        })
    }

    /// Final location of the store.
    pub fn path(&self) -> &Path {
        &self.final_path
    }

    /// Declare a group of `num_examples` windows of `seq_len` bases.
    pub fn create_group(
        &mut self,
        name: &str,
        num_examples: usize,
        seq_len: usize,
    ) -> Result<(), StoreError> {
        if self.groups.contains_key(name) {
            return Err(StoreError::DuplicateGroup(name.to_string()));
        }
        let dir = self.tmp.join(name);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        self.groups.insert(
            name.to_string(),
            GroupState {
                manifest: GroupManifest {
                    num_examples,
                    seq_len,
                    index: None,
                    chunks: Vec::new(),
                },
                next_start: 0,
                next_index_row: 0,
            },
        );
        Ok(())
    }

    fn group_mut(&mut self, name: &str) -> Result<&mut GroupState, StoreError> {
        self.groups
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownGroup(name.to_string()))
    }

    /// Write the shared `idx_fix` map of a group. Only one write is allowed.
    pub fn write_fixed_index(&mut self, group: &str, index: &FixedIndex) -> Result<(), StoreError> {
        let tmp = self.tmp.clone();
        let state = self.group_mut(group)?;
        if state.manifest.index.is_some() {
            return Err(StoreError::Shape {
                group: group.to_string(),
                reason: "index map already written".to_string(),
            });
        }
        let file = format!("{group}/{FIXED_INDEX}.safetensors");
        let path = tmp.join(&file);
        let entry = match index {
            FixedIndex::Slice { start, end } => {
                write_u32_tensor(&path, FIXED_INDEX, vec![2], &[*start, *end])?;
                IndexEntry::Slice { file }
            }
            FixedIndex::Gather(map) => {
                if map.len() != state.manifest.seq_len {
                    return Err(StoreError::Shape {
                        group: group.to_string(),
                        reason: format!(
                            "fixed index has {} positions, windows have {}",
                            map.len(),
                            state.manifest.seq_len
                        ),
                    });
                }
                let values: Vec<u32> = map.iter().copied().collect();
                write_u32_tensor(&path, FIXED_INDEX, vec![values.len()], &values)?;
                IndexEntry::Gather { file }
            }
        };
        state.manifest.index = Some(entry);
        Ok(())
    }

    /// Append rows `[start, start + rows.nrows())` of `idx_var`.
    pub fn write_variable_index_rows(
        &mut self,
        group: &str,
        start: usize,
        rows: ArrayView2<'_, u32>,
    ) -> Result<(), StoreError> {
        let tmp = self.tmp.clone();
        let state = self.group_mut(group)?;
        if matches!(
            state.manifest.index,
            Some(IndexEntry::Slice { .. } | IndexEntry::Gather { .. })
        ) {
            return Err(StoreError::Shape {
                group: group.to_string(),
                reason: "group already holds a fixed index map".to_string(),
            });
        }
        if start != state.next_index_row {
            return Err(StoreError::NonContiguous {
                group: group.to_string(),
                start,
                expected: state.next_index_row,
            });
        }
        let end = start + rows.nrows();
        if rows.ncols() != state.manifest.seq_len || end > state.manifest.num_examples {
            return Err(StoreError::Shape {
                group: group.to_string(),
                reason: format!(
                    "index rows {start}..{end} of width {} do not fit [{}, {}]",
                    rows.ncols(),
                    state.manifest.num_examples,
                    state.manifest.seq_len
                ),
            });
        }
        let file = format!("{group}/{VARIABLE_INDEX}_{start}_{end}.safetensors");
        let values: Vec<u32> = rows.iter().copied().collect();
        let shape = vec![rows.nrows(), rows.ncols()];
        write_u32_tensor(&tmp.join(&file), VARIABLE_INDEX, shape, &values)?;
        let part = IndexPart { start, end, file };
        match &mut state.manifest.index {
            Some(IndexEntry::Variable { parts }) => parts.push(part),
            _ => state.manifest.index = Some(IndexEntry::Variable { parts: vec![part] }),
        }
        state.next_index_row = end;
        Ok(())
    }

    /// Append token embeddings of examples `[start, start + batch)` as
    /// `emb_<start>_<end>`. Chunks must arrive in order without gaps.
    pub fn append_embeddings(
        &mut self,
        group: &str,
        start: usize,
        embeddings: ArrayView3<'_, f32>,
    ) -> Result<(), StoreError> {
        let tmp = self.tmp.clone();
        let state = self.group_mut(group)?;
        if start != state.next_start {
            return Err(StoreError::NonContiguous {
                group: group.to_string(),
                start,
                expected: state.next_start,
            });
        }
        let (batch, tokens, dim) = embeddings.dim();
        let end = start + batch;
        if batch == 0 || end > state.manifest.num_examples {
            return Err(StoreError::Shape {
                group: group.to_string(),
                reason: format!(
                    "chunk {start}..{end} outside [0, {})",
                    state.manifest.num_examples
                ),
            });
        }
        let key = chunk_key(start, end);
        let file = format!("{group}/{key}.safetensors");
        let values: Vec<f32> = embeddings.iter().copied().collect();
        write_f32_tensor(&tmp.join(&file), &key, vec![batch, tokens, dim], &values)?;
        state.manifest.chunks.push(ChunkEntry {
            start,
            end,
            tokens,
            dim,
            file,
        });
        state.next_start = end;
        Ok(())
    }

    /// Validate coverage, write the manifest and move the store into place.
    /// An existing store at the final path is replaced.
    pub fn finish(self) -> Result<PathBuf, StoreError> {
        let mut groups = BTreeMap::new();
        for (name, state) in self.groups {
            let expected = state.manifest.num_examples;
            if state.next_start != expected {
                return Err(StoreError::Incomplete {
                    group: name,
                    written: state.next_start,
                    expected,
                });
            }
            match state.manifest.index {
                Some(IndexEntry::Variable { .. }) if state.next_index_row != expected => {
                    return Err(StoreError::Incomplete {
                        group: name,
                        written: state.next_index_row,
                        expected,
                    });
                }
                None if expected > 0 => {
                    return Err(StoreError::Shape {
                        group: name,
                        reason: "no index map written".to_string(),
                    });
                }
                _ => {}
            }
            groups.insert(name, state.manifest);
        }

        let manifest = Manifest {
            version: FORMAT_VERSION,
            groups,
        };
        let manifest_path = self.tmp.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&manifest_path, json).map_err(io_error(&manifest_path))?;

        if self.final_path.exists() {
            fs::remove_dir_all(&self.final_path).map_err(io_error(&self.final_path))?;
        }
        fs::rename(&self.tmp, &self.final_path).map_err(io_error(&self.final_path))?;
        info!(
            path = %self.final_path.display(),
            groups = manifest.groups.len(),
            "embedding store finalised"
        );
        Ok(self.final_path)
    }
}
