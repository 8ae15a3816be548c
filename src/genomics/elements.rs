use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised while loading tab-separated tables.
#[derive(Debug, Error)]
pub enum TableError {
    /// Required column is absent from the header.
    #[error("missing required column '{0}'")]
    MissingColumn(String),
    /// Table has no header row.
    #[error("table is empty (no header row)")]
    Empty,
    /// Row has a different number of fields than the header.
    #[error("line {line}: expected {expected} fields, found {found}")]
    RaggedRow {
        /// 1-based line number.
        line: usize,
        /// Header width.
        expected: usize,
        /// Fields found on the line.
        found: usize,
    },
    /// Field could not be parsed into the requested type.
    #[error("line {line}: column '{column}' has invalid value '{value}'")]
    InvalidValue {
        /// 1-based line number.
        line: usize,
        /// Column name.
        column: String,
        /// Raw field.
        value: String,
    },
    /// Underlying I/O failure.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Path being read.
        path: PathBuf,
        /// Source error.
        source: std::io::Error,
    },
}

/// Raw tab-separated table with a header row. No quoting.
#[derive(Debug, Clone)]
pub struct TsvTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TsvTable {
    /// Parse TSV text.
    pub fn parse(contents: &str) -> Result<Self, TableError> {
        let mut lines = contents.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let (_, header_line) = lines.next().ok_or(TableError::Empty)?;
        let header: Vec<String> = header_line.split('\t').map(|s| s.trim().to_string()).collect();

        let mut rows = Vec::new();
        for (line_no, line) in lines {
            let fields: Vec<String> = line.split('\t').map(str::to_string).collect();
            if fields.len() != header.len() {
                return Err(TableError::RaggedRow {
                    line: line_no + 1,
                    expected: header.len(),
                    found: fields.len(),
                });
            }
            rows.push(fields);
        }
        Ok(Self { header, rows })
    }

    /// Read and parse a TSV file.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, TableError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| TableError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Column names.
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Number of data rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` when the table has no data rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column.
    pub fn column_index(&self, name: &str) -> Result<usize, TableError> {
        self.header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))
    }

    /// Raw field of row `row` in column `name`.
    pub fn field(&self, row: usize, name: &str) -> Result<&str, TableError> {
        let col = self.column_index(name)?;
        Ok(self.rows[row][col].as_str())
    }

    /// Parse a field into `T`.
    pub fn parse_field<T: FromStr>(&self, row: usize, name: &str) -> Result<T, TableError> {
        let raw = self.field(row, name)?;
        raw.trim().parse().map_err(|_| TableError::InvalidValue {
            // +2: header row plus 1-based numbering
            line: row + 2,
            column: name.to_string(),
            value: raw.to_string(),
        })
    }
}

/// Genomic interval row of an elements table.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    /// Row index in the unfiltered table.
    pub idx_orig: usize,
    /// Chromosome name.
    pub chrom: Arc<str>,
    /// Window start (0-based, inclusive).
    pub start: u64,
    /// Window end (exclusive).
    pub end: u64,
    fields: Arc<[String]>,
}

impl Element {
    /// Window length.
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    /// Returns `true` for zero-length windows.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Elements table: required `chr, input_start, input_end` columns plus any
/// task-specific extras, optionally filtered to a chromosome subset.
#[derive(Debug, Clone)]
pub struct ElementsTable {
    columns: Arc<HashMap<String, usize>>,
    elements: Vec<Element>,
}

impl ElementsTable {
    /// Required columns.
    pub const REQUIRED: [&'static str; 3] = ["chr", "input_start", "input_end"];

    /// Build from a raw table, keeping rows on `chroms` when given.
    pub fn from_tsv(table: &TsvTable, chroms: Option<&[String]>) -> Result<Self, TableError> {
        for col in Self::REQUIRED {
            table.column_index(col)?;
        }
        let keep: Option<HashSet<&str>> =
            chroms.map(|c| c.iter().map(String::as_str).collect());

        let columns: HashMap<String, usize> = table
            .header()
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut elements = Vec::new();
        for row in 0..table.len() {
            let chrom = table.field(row, "chr")?;
            if let Some(keep) = &keep {
                if !keep.contains(chrom) {
                    continue;
                }
            }
            let start: u64 = table.parse_field(row, "input_start")?;
            let end: u64 = table.parse_field(row, "input_end")?;
            if end < start {
                return Err(TableError::InvalidValue {
                    line: row + 2,
                    column: "input_end".to_string(),
                    value: end.to_string(),
                });
            }
            elements.push(Element {
                idx_orig: row,
                chrom: Arc::from(chrom),
                start,
                end,
                fields: Arc::from(table.rows[row].clone().into_boxed_slice()),
            });
        }

        Ok(Self {
            columns: Arc::new(columns),
            elements,
        })
    }

    /// Load a TSV file, optionally filtering to `chroms`.
    pub fn load<P: AsRef<Path>>(path: P, chroms: Option<&[String]>) -> Result<Self, TableError> {
        let table = TsvTable::read(path)?;
        Self::from_tsv(&table, chroms)
    }

    /// Number of (filtered) elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns `true` when no element survived filtering.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Element at filtered position `idx`.
    pub fn get(&self, idx: usize) -> Option<&Element> {
        self.elements.get(idx)
    }

    /// Iterate elements in table order.
    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter()
    }

    /// Returns `true` when the table has column `name`.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Fail unless every column in `names` is present.
    pub fn require_columns(&self, names: &[&str]) -> Result<(), TableError> {
        for name in names {
            if !self.has_column(name) {
                return Err(TableError::MissingColumn((*name).to_string()));
            }
        }
        Ok(())
    }

    /// Raw field of an element.
    pub fn field<'a>(&self, element: &'a Element, name: &str) -> Result<&'a str, TableError> {
        let col = self
            .columns
            .get(name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))?;
        Ok(element.fields[*col].as_str())
    }

    /// Parse a field of an element into `T`.
    pub fn parse_field<T: FromStr>(&self, element: &Element, name: &str) -> Result<T, TableError> {
        let raw = self.field(element, name)?;
        raw.trim().parse().map_err(|_| TableError::InvalidValue {
            line: element.idx_orig + 2,
            column: name.to_string(),
            value: raw.to_string(),
        })
    }
}

/// Mapping from class label to class index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassMap {
    classes: BTreeMap<String, usize>,
}

impl ClassMap {
    /// Assign indices `0..n` to `labels` in the given order.
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let classes = labels
            .into_iter()
            .enumerate()
            .map(|(idx, label)| (label.into(), idx))
            .collect();
        Self { classes }
    }

    /// Number of classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns `true` when no classes are defined.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Index of `label`.
    pub fn index(&self, label: &str) -> Option<usize> {
        self.classes.get(label).copied()
    }

    /// `(label, index)` pairs ordered by index.
    pub fn iter(&self) -> Vec<(&str, usize)> {
        let mut pairs: Vec<(&str, usize)> =
            self.classes.iter().map(|(k, &v)| (k.as_str(), v)).collect();
        pairs.sort_by_key(|&(_, idx)| idx);
        pairs
    }
}
