use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::reference::{valid_range, GenomeError};

/// Numeric value-per-base provider (bigWig-like).
pub trait SignalTrack {
    /// Values for `[start, end)`; uncovered bases may be `NaN`.
    fn values(&self, chrom: &str, start: u64, end: u64) -> Result<Vec<f32>, GenomeError>;
}

/// Signal for `[start, end)` with positions outside `[0, chrom_len)` and
/// `NaN` values replaced by zero.
pub fn signal_window(
    track: &dyn SignalTrack,
    chrom: &str,
    start: i64,
    end: i64,
    chrom_len: u64,
) -> Result<Vec<f32>, GenomeError> {
    if end < start {
        return Err(GenomeError::InvalidInterval {
            chrom: chrom.to_string(),
            start,
            end,
        });
    }
    let mut signal = vec![0.0f32; (end - start) as usize];
    if let Some(range) = valid_range(start, end, chrom_len) {
        let values = track.values(chrom, range.start, range.end)?;
        let offset = (range.start as i64 - start) as usize;
        for (slot, value) in signal[offset..].iter_mut().zip(values) {
            *slot = if value.is_nan() { 0.0 } else { value };
        }
    }
    Ok(signal)
}

/// In-memory track parsed from bedGraph (`chrom start end value`).
#[derive(Debug, Clone, Default)]
pub struct BedGraphTrack {
    intervals: HashMap<String, Vec<(u64, u64, f32)>>,
}

impl BedGraphTrack {
    /// Create an empty track.
    pub fn new() -> Self {
        Self {
            intervals: HashMap::new(),
        }
    }

    /// Add a constant-valued interval.
    pub fn push(&mut self, chrom: impl Into<String>, start: u64, end: u64, value: f32) {
        let entries = self.intervals.entry(chrom.into()).or_default();
        entries.push((start, end, value));
        entries.sort_by_key(|&(s, _, _)| s);
    }

    /// Parse bedGraph text. `track`, `browser` and `#` lines are skipped.
    pub fn from_bedgraph_str(contents: &str) -> Result<Self, GenomeError> {
        let mut track = Self::new();
        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with("track")
                || line.starts_with("browser")
            {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(GenomeError::Malformed {
                    what: "bedGraph",
                    line: line_no + 1,
                    reason: format!("expected 4 columns, found {}", fields.len()),
                });
            }
            let parse_err = |reason: String| GenomeError::Malformed {
                what: "bedGraph",
                line: line_no + 1,
                reason,
            };
            let start: u64 = fields[1]
                .parse()
                .map_err(|_| parse_err(format!("invalid start '{}'", fields[1])))?;
            let end: u64 = fields[2]
                .parse()
                .map_err(|_| parse_err(format!("invalid end '{}'", fields[2])))?;
            let value: f32 = fields[3]
                .parse()
                .map_err(|_| parse_err(format!("invalid value '{}'", fields[3])))?;
            track
                .intervals
                .entry(fields[0].to_string())
                .or_default()
                .push((start, end, value));
        }
        for entries in track.intervals.values_mut() {
            entries.sort_by_key(|&(s, _, _)| s);
        }
        Ok(track)
    }

    /// Read a bedGraph file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, GenomeError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| GenomeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bedgraph_str(&contents)
    }
}

impl SignalTrack for BedGraphTrack {
    fn values(&self, chrom: &str, start: u64, end: u64) -> Result<Vec<f32>, GenomeError> {
        let mut values = vec![f32::NAN; end.saturating_sub(start) as usize];
        let Some(entries) = self.intervals.get(chrom) else {
            return Ok(values);
        };
        // Intervals are sorted by start; skip everything ending before `start`.
        let first = entries.partition_point(|&(s, _, _)| s < start);
        let first = first.saturating_sub(1);
        for &(s, e, value) in &entries[first..] {
            if s >= end {
                break;
            }
            let lo = s.max(start);
            let hi = e.min(end);
            for pos in lo..hi {
                values[(pos - start) as usize] = value;
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncovered_bases_are_nan_and_window_zeroes_them() {
        let track = BedGraphTrack::from_bedgraph_str("track type=bedGraph\nchr1\t2\t4\t1.5\n")
            .unwrap();
        let raw = track.values("chr1", 0, 5).unwrap();
        assert!(raw[0].is_nan());
        assert_eq!(raw[2], 1.5);

        let window = signal_window(&track, "chr1", -1, 5, 100).unwrap();
        assert_eq!(window, vec![0.0, 0.0, 0.0, 1.5, 1.5, 0.0]);
    }

    #[test]
    fn out_of_bounds_positions_are_zero() {
        let mut track = BedGraphTrack::new();
        track.push("chr1", 0, 10, 2.0);
        let window = signal_window(&track, "chr1", 8, 12, 10).unwrap();
        assert_eq!(window, vec![2.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn rejects_short_lines() {
        assert!(BedGraphTrack::from_bedgraph_str("chr1\t0\t5\n").is_err());
    }
}
