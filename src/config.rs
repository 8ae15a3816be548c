//! Process configuration.
//!
//! Two environment variables select the working directory (`DART_WORK_DIR`)
//! and an optional cache directory for reference files (`DART_CACHE_DIR`).
//! They are read once into [`BenchConfig`], which is then passed explicitly
//! to every stage.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Environment variable naming the base working directory.
pub const WORK_DIR_VAR: &str = "DART_WORK_DIR";
/// Environment variable naming the reference-file cache directory.
pub const CACHE_DIR_VAR: &str = "DART_CACHE_DIR";

/// Errors raised while preparing configured paths.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Source error.
        source: io::Error,
    },
}

/// Explicit process configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BenchConfig {
    /// Base directory that relative inputs and outputs resolve against.
    pub work_dir: PathBuf,
    /// Optional directory holding cached copies of reference files.
    pub cache_dir: Option<PathBuf>,
}

impl BenchConfig {
    /// Construct explicitly.
    pub fn new(work_dir: impl Into<PathBuf>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            cache_dir,
        }
    }

    /// Read `DART_WORK_DIR` (default: current directory) and `DART_CACHE_DIR`.
    pub fn from_env() -> Self {
        let work_dir = std::env::var_os(WORK_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_default();
        let cache_dir = std::env::var_os(CACHE_DIR_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self {
            work_dir,
            cache_dir,
        }
    }

    /// Resolve `relative` against the working directory. Absolute paths are
    /// returned unchanged.
    pub fn work_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.work_dir.join(relative)
    }

    /// Return the path a stage should read `path` from: a cached copy when a
    /// cache directory is configured, the original otherwise.
    pub fn reference_path(&self, path: &Path) -> Result<PathBuf, ConfigError> {
        match &self.cache_dir {
            Some(cache_dir) => cache_reference(path, cache_dir),
            None => Ok(path.to_path_buf()),
        }
    }
}

/// Copy `src` into `cache_dir` under a name derived from the blake3 hash of
/// its absolute path, unless a copy already exists. A sibling `.fai` index is
/// copied alongside when present. Returns the cached path.
pub fn cache_reference(src: &Path, cache_dir: &Path) -> Result<PathBuf, ConfigError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ConfigError::Io { path, source }
    };

    fs::create_dir_all(cache_dir).map_err(io_err(cache_dir))?;
    let absolute = fs::canonicalize(src).map_err(io_err(src))?;
    let digest = blake3::hash(absolute.to_string_lossy().as_bytes()).to_hex();
    let extension = src
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let cached = cache_dir.join(format!("{digest}{extension}"));
    copy_if_not_exists(&absolute, &cached).map_err(io_err(&cached))?;

    let src_index = PathBuf::from(format!("{}.fai", absolute.display()));
    if src_index.exists() {
        let cached_index = PathBuf::from(format!("{}.fai", cached.display()));
        copy_if_not_exists(&src_index, &cached_index).map_err(io_err(&cached_index))?;
    }
    Ok(cached)
}

fn copy_if_not_exists(src: &Path, dst: &Path) -> io::Result<()> {
    match OpenOptions::new().write(true).create_new(true).open(dst) {
        Ok(mut out) => {
            let mut input = fs::File::open(src)?;
            io::copy(&mut input, &mut out)?;
            debug!(src = %src.display(), dst = %dst.display(), "cached reference file");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

/// Chromosome partition for training, validation and held-out testing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChromSplit {
    /// Training chromosomes.
    pub train: Vec<String>,
    /// Validation chromosomes.
    pub val: Vec<String>,
    /// Held-out test chromosomes.
    pub test: Vec<String>,
}

impl ChromSplit {
    /// Standard human split used by every task.
    pub fn human() -> Self {
        let names = |chroms: &[&str]| chroms.iter().map(|c| c.to_string()).collect();
        Self {
            train: names(&[
                "chr1", "chr2", "chr3", "chr4", "chr7", "chr8", "chr9", "chr11", "chr12", "chr13",
                "chr15", "chr16", "chr17", "chr19", "chrX", "chrY",
            ]),
            val: names(&["chr6", "chr21"]),
            test: names(&["chr5", "chr10", "chr14", "chr18", "chr20", "chr22"]),
        }
    }

    /// Chromosomes of a named partition (`train`, `val` or `test`).
    pub fn partition(&self, mode: &str) -> Option<&[String]> {
        match mode {
            "train" => Some(&self.train),
            "val" => Some(&self.val),
            "test" => Some(&self.test),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_split_is_disjoint() {
        let split = ChromSplit::human();
        for chrom in &split.test {
            assert!(!split.train.contains(chrom));
            assert!(!split.val.contains(chrom));
        }
        assert_eq!(split.partition("val").unwrap(), &["chr6", "chr21"]);
        assert!(split.partition("holdout").is_none());
    }

    #[test]
    fn cache_copies_once_and_includes_index() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("ref.fa");
        fs::write(&src, ">chr1\nACGT\n").unwrap();
        fs::write(dir.path().join("ref.fa.fai"), "chr1\t4\t6\t4\t5\n").unwrap();
        let cache = dir.path().join("cache");

        let cached = cache_reference(&src, &cache).unwrap();
        assert!(cached.extension().is_some_and(|e| e == "fa"));
        assert_eq!(fs::read_to_string(&cached).unwrap(), ">chr1\nACGT\n");
        assert!(PathBuf::from(format!("{}.fai", cached.display())).exists());

        // An existing copy is left untouched.
        fs::write(&src, ">chr1\nTTTT\n").unwrap();
        let again = cache_reference(&src, &cache).unwrap();
        assert_eq!(again, cached);
        assert_eq!(fs::read_to_string(&again).unwrap(), ">chr1\nACGT\n");
    }

    #[test]
    fn reference_path_without_cache_is_identity() {
        let config = BenchConfig::new("/work", None);
        let path = Path::new("/refs/genome.fa");
        assert_eq!(config.reference_path(path).unwrap(), path);
        assert_eq!(config.work_path("task_1"), PathBuf::from("/work/task_1"));
    }
}
