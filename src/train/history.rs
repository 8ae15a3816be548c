use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{io_error, TrainError};

/// Name of the per-run training log.
pub const LOG_FILE: &str = "train.log";

/// One epoch of a training log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    /// Epoch number.
    pub epoch: usize,
    /// Validation loss.
    pub val_loss: f64,
    /// Remaining columns in header order.
    pub metrics: Vec<(String, f64)>,
}

/// Tab-separated training log: a header row, then one row per epoch.
#[derive(Debug)]
pub struct TrainLog {
    path: PathBuf,
}

impl TrainLog {
    /// Start a fresh log with `epoch`, `val_loss` and `columns` as header.
    pub fn create(path: &Path, columns: &[&str]) -> Result<Self, TrainError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let mut file = File::create(path).map_err(io_error(path))?;
        let mut header = vec!["epoch", "val_loss"];
        header.extend_from_slice(columns);
        writeln!(file, "{}", header.join("\t")).map_err(io_error(path))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Continue an existing log without touching its header.
    pub fn append_to(path: &Path) -> Result<Self, TrainError> {
        if !path.exists() {
            return Err(TrainError::NotFound(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Log location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one epoch row.
    pub fn write_row(&mut self, epoch: usize, val_loss: f64, metrics: &[f64]) -> Result<(), TrainError> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(io_error(&self.path))?;
        let mut fields = vec![epoch.to_string(), val_loss.to_string()];
        fields.extend(metrics.iter().map(f64::to_string));
        writeln!(file, "{}", fields.join("\t")).map_err(io_error(&self.path))
    }
}

/// Parse a training log.
pub fn read_train_log(path: &Path) -> Result<Vec<LogRow>, TrainError> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    let malformed = |reason: String| TrainError::Log {
        path: path.to_path_buf(),
        reason,
    };
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| malformed("empty log".to_string()))?
        .split('\t')
        .collect();
    if header.get(..2) != Some(&["epoch", "val_loss"][..]) {
        return Err(malformed(format!("unexpected header {header:?}")));
    }

    lines
        .enumerate()
        .map(|(row, line)| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != header.len() {
                return Err(malformed(format!(
                    "row {} has {} fields, header has {}",
                    row + 1,
                    fields.len(),
                    header.len()
                )));
            }
            let number = |i: usize| {
                fields[i]
                    .parse::<f64>()
                    .map_err(|e| malformed(format!("row {}: {}: {e}", row + 1, header[i])))
            };
            let epoch = fields[0]
                .parse::<usize>()
                .map_err(|e| malformed(format!("row {}: epoch: {e}", row + 1)))?;
            let val_loss = number(1)?;
            let metrics = (2..fields.len())
                .map(|i| Ok((header[i].to_string(), number(i)?)))
                .collect::<Result<_, TrainError>>()?;
            Ok(LogRow {
                epoch,
                val_loss,
                metrics,
            })
        })
        .collect()
}

/// Epoch with the lowest validation loss; the earliest wins ties.
pub fn best_epoch(path: &Path) -> Result<usize, TrainError> {
    let rows = read_train_log(path)?;
    rows.iter()
        .fold(None::<&LogRow>, |best, row| match best {
            Some(b) if b.val_loss <= row.val_loss || row.val_loss.is_nan() => Some(b),
            _ => Some(row),
        })
        .map(|row| row.epoch)
        .ok_or_else(|| TrainError::Log {
            path: path.to_path_buf(),
            reason: "no epochs logged".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_epoch_is_first_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        let mut log = TrainLog::create(&path, &["val_acc"]).unwrap();
        for (epoch, loss) in [0.9, 0.4, 0.6, 0.4].into_iter().enumerate() {
            log.write_row(epoch, loss, &[0.5]).unwrap();
        }
        assert_eq!(best_epoch(&path).unwrap(), 1);

        let rows = read_train_log(&path).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2].metrics, vec![("val_acc".to_string(), 0.5)]);
    }

    #[test]
    fn header_only_log_has_no_best_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        TrainLog::create(&path, &[]).unwrap();
        assert!(matches!(best_epoch(&path), Err(TrainError::Log { .. })));
    }

    #[test]
    fn appending_keeps_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        TrainLog::create(&path, &[]).unwrap().write_row(0, 1.0, &[]).unwrap();
        TrainLog::append_to(&path).unwrap().write_row(1, 0.5, &[]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "epoch\tval_loss\n0\t1\n1\t0.5\n");
    }
}
