use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use rust_htslib::faidx;
use thiserror::Error;

use super::onehot::{one_hot_encode, Window};

/// Errors raised while reading reference sequence or signal data.
#[derive(Debug, Error)]
pub enum GenomeError {
    /// Chromosome is absent from the reference.
    #[error("unknown chromosome '{0}'")]
    UnknownChromosome(String),
    /// Requested interval has `end < start`.
    #[error("invalid interval {chrom}:{start}-{end}")]
    InvalidInterval {
        /// Chromosome name.
        chrom: String,
        /// Requested start.
        start: i64,
        /// Requested end.
        end: i64,
    },
    /// Malformed reference or index file.
    #[error("malformed {what} at line {line}: {reason}")]
    Malformed {
        /// Kind of file being parsed.
        what: &'static str,
        /// 1-based line number.
        line: usize,
        /// Parser diagnostic.
        reason: String,
    },
    /// Error reported by htslib.
    #[error("htslib error: {0}")]
    Htslib(#[from] rust_htslib::errors::Error),
    /// Underlying I/O failure.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Source error.
        source: std::io::Error,
    },
}

/// Random-access nucleotide provider.
pub trait GenomeSource {
    /// Length of a chromosome in bases.
    fn chrom_len(&self, chrom: &str) -> Result<u64, GenomeError>;

    /// Fetch `[start, end)` as uppercase ASCII. Callers clamp to the
    /// chromosome bounds before calling.
    fn fetch(&self, chrom: &str, start: u64, end: u64) -> Result<Vec<u8>, GenomeError>;
}

/// Intersection of `[start, end)` with `[0, chrom_len)`.
///
/// Returns `None` when the request lies entirely outside the chromosome.
pub fn valid_range(start: i64, end: i64, chrom_len: u64) -> Option<Range<u64>> {
    let lo = start.max(0) as u64;
    let hi = end.max(0) as u64;
    let hi = hi.min(chrom_len);
    (lo < hi).then_some(lo..hi)
}

/// Fetch `[start, end)` padding positions outside the chromosome with `N`.
pub fn fetch_padded(
    genome: &dyn GenomeSource,
    chrom: &str,
    start: i64,
    end: i64,
) -> Result<Vec<u8>, GenomeError> {
    if end < start {
        return Err(GenomeError::InvalidInterval {
            chrom: chrom.to_string(),
            start,
            end,
        });
    }
    let mut sequence = vec![b'N'; (end - start) as usize];
    let chrom_len = genome.chrom_len(chrom)?;
    if let Some(range) = valid_range(start, end, chrom_len) {
        let fetched = genome.fetch(chrom, range.start, range.end)?;
        let offset = (range.start as i64 - start) as usize;
        sequence[offset..offset + fetched.len()].copy_from_slice(&fetched);
    }
    Ok(sequence)
}

/// One-hot window for `[start, end)`; out-of-bounds rows are zero.
pub fn fetch_window(
    genome: &dyn GenomeSource,
    chrom: &str,
    start: i64,
    end: i64,
) -> Result<Window, GenomeError> {
    let sequence = fetch_padded(genome, chrom, start, end)?;
    Ok(one_hot_encode(&sequence))
}

/// Reference held fully in memory, parsed from FASTA text.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGenome {
    chroms: HashMap<String, Vec<u8>>,
}

impl InMemoryGenome {
    /// Create an empty genome.
    pub fn new() -> Self {
        Self {
            chroms: HashMap::new(),
        }
    }

    /// Add (or replace) a chromosome.
    pub fn insert(&mut self, chrom: impl Into<String>, sequence: &[u8]) {
        self.chroms
            .insert(chrom.into(), sequence.to_ascii_uppercase());
    }

    /// Builder-style variant of [`InMemoryGenome::insert`].
    pub fn with_chrom(mut self, chrom: impl Into<String>, sequence: &[u8]) -> Self {
        self.insert(chrom, sequence);
        self
    }

    /// Parse FASTA text. The record name is the first word of the header.
    pub fn from_fasta_str(contents: &str) -> Result<Self, GenomeError> {
        let mut genome = Self::new();
        let mut current: Option<(String, Vec<u8>)> = None;

        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim_end();
            if let Some(header) = line.strip_prefix('>') {
                if let Some((name, seq)) = current.take() {
                    genome.insert(name, &seq);
                }
                let name = header.split_whitespace().next().ok_or_else(|| {
                    GenomeError::Malformed {
                        what: "FASTA",
                        line: line_no + 1,
                        reason: "empty record name".to_string(),
                    }
                })?;
                current = Some((name.to_string(), Vec::new()));
            } else if !line.is_empty() {
                match current.as_mut() {
                    Some((_, seq)) => seq.extend_from_slice(line.as_bytes()),
                    None => {
                        return Err(GenomeError::Malformed {
                            what: "FASTA",
                            line: line_no + 1,
                            reason: "sequence before first header".to_string(),
                        })
                    }
                }
            }
        }

        if let Some((name, seq)) = current {
            genome.insert(name, &seq);
        }
        Ok(genome)
    }

    /// Read and parse a FASTA file.
    pub fn from_fasta_path<P: AsRef<Path>>(path: P) -> Result<Self, GenomeError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| GenomeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_fasta_str(&contents)
    }

    /// Chromosome names in arbitrary order.
    pub fn chrom_names(&self) -> impl Iterator<Item = &str> {
        self.chroms.keys().map(String::as_str)
    }

    /// Full sequence of a chromosome.
    pub fn sequence(&self, chrom: &str) -> Option<&[u8]> {
        self.chroms.get(chrom).map(Vec::as_slice)
    }
}

impl GenomeSource for InMemoryGenome {
    fn chrom_len(&self, chrom: &str) -> Result<u64, GenomeError> {
        self.chroms
            .get(chrom)
            .map(|seq| seq.len() as u64)
            .ok_or_else(|| GenomeError::UnknownChromosome(chrom.to_string()))
    }

    fn fetch(&self, chrom: &str, start: u64, end: u64) -> Result<Vec<u8>, GenomeError> {
        let seq = self
            .chroms
            .get(chrom)
            .ok_or_else(|| GenomeError::UnknownChromosome(chrom.to_string()))?;
        let end = (end as usize).min(seq.len());
        let start = (start as usize).min(end);
        Ok(seq[start..end].to_vec())
    }
}

/// Indexed FASTA accessed through htslib's `faidx`.
///
/// Chromosome lengths come from the `.fai` index, which htslib builds on
/// open when it is missing.
pub struct FaidxGenome {
    reader: faidx::Reader,
    lengths: HashMap<String, u64>,
    path: PathBuf,
}

impl std::fmt::Debug for FaidxGenome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaidxGenome")
            .field("path", &self.path)
            .field("chroms", &self.lengths.len())
            .finish()
    }
}

impl FaidxGenome {
    /// Open an indexed FASTA file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GenomeError> {
        let path = path.as_ref().to_path_buf();
        let reader = faidx::Reader::from_path(&path)?;
        let fai_path = PathBuf::from(format!("{}.fai", path.display()));
        let lengths = read_fai_lengths(&fai_path)?;
        Ok(Self {
            reader,
            lengths,
            path,
        })
    }

    /// Path of the FASTA file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_fai_lengths(path: &Path) -> Result<HashMap<String, u64>, GenomeError> {
    let contents = fs::read_to_string(path).map_err(|source| GenomeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut lengths = HashMap::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let (Some(name), Some(len)) = (fields.next(), fields.next()) else {
            return Err(GenomeError::Malformed {
                what: "FASTA index",
                line: line_no + 1,
                reason: "expected at least two columns".to_string(),
            });
        };
        let len: u64 = len.parse().map_err(|_| GenomeError::Malformed {
            what: "FASTA index",
            line: line_no + 1,
            reason: format!("invalid length '{len}'"),
        })?;
        lengths.insert(name.to_string(), len);
    }
    Ok(lengths)
}

impl GenomeSource for FaidxGenome {
    fn chrom_len(&self, chrom: &str) -> Result<u64, GenomeError> {
        self.lengths
            .get(chrom)
            .copied()
            .ok_or_else(|| GenomeError::UnknownChromosome(chrom.to_string()))
    }

    fn fetch(&self, chrom: &str, start: u64, end: u64) -> Result<Vec<u8>, GenomeError> {
        let end = end.min(self.chrom_len(chrom)?);
        if start >= end {
            return Ok(Vec::new());
        }
        // faidx coordinates are 0-based with an inclusive end.
        let seq = self
            .reader
            .fetch_seq_string(chrom, start as usize, (end - 1) as usize)?;
        Ok(seq.into_bytes().to_ascii_uppercase())
    }
}
