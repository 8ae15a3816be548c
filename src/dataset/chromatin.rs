use std::sync::Arc;

use super::{Dataset, DatasetError, Example, Target};
use crate::genomics::{fetch_window, signal_window, ElementsTable, GenomeSource, SignalTrack, Window};

/// Sequence window with the signal track over its cropped interior.
#[derive(Debug, Clone, PartialEq)]
pub struct ChromatinWindow {
    /// One-hot window over `[input_start, input_end)`.
    pub seq: Window,
    /// Per-base signal over `[input_start + crop, input_end - crop)`.
    pub signal: Vec<f32>,
    /// Row index of the element in the unfiltered table.
    pub idx_orig: usize,
}

impl ChromatinWindow {
    /// Total signal, the regression target.
    pub fn counts(&self) -> f32 {
        self.signal.iter().sum()
    }
}

impl From<ChromatinWindow> for Example<Window> {
    fn from(window: ChromatinWindow) -> Self {
        let counts = window.counts();
        Example::new(window.seq, Target::Counts(counts))
    }
}

/// Windows and signal tracks for chromatin-activity regression.
///
/// With a downsampling ratio `r`, epoch `e` sees rows `e % r, e % r + r, …`
/// of the loaded table, so `r` consecutive epochs cover every row once.
#[derive(Clone)]
pub struct ChromatinDataset {
    genome: Arc<dyn GenomeSource>,
    track: Arc<dyn SignalTrack>,
    elements: ElementsTable,
    crop: u64,
    downsample_ratio: Option<usize>,
    active: Vec<usize>,
}

impl std::fmt::Debug for ChromatinDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromatinDataset")
            .field("elements", &self.elements.len())
            .field("active", &self.active.len())
            .field("crop", &self.crop)
            .field("downsample_ratio", &self.downsample_ratio)
            .finish()
    }
}

impl ChromatinDataset {
    /// Fails when a window is shorter than twice `crop` or the ratio is zero.
    pub fn new(
        genome: Arc<dyn GenomeSource>,
        track: Arc<dyn SignalTrack>,
        elements: ElementsTable,
        crop: u64,
        downsample_ratio: Option<usize>,
    ) -> Result<Self, DatasetError> {
        if downsample_ratio == Some(0) {
            return Err(DatasetError::InvalidConfig(
                "downsample ratio must be positive".to_string(),
            ));
        }
        if let Some(short) = elements.iter().find(|e| (e.len() as u64) < 2 * crop) {
            return Err(DatasetError::InvalidConfig(format!(
                "element {}:{}-{} is shorter than twice the crop of {crop}",
                short.chrom, short.start, short.end
            )));
        }
        let active = (0..elements.len()).collect();
        Ok(Self {
            genome,
            track,
            elements,
            crop,
            downsample_ratio,
            active,
        })
    }

    /// Underlying (filtered) table.
    pub fn elements(&self) -> &ElementsTable {
        &self.elements
    }

    /// Table rows visible in the current epoch.
    pub fn active_rows(&self) -> &[usize] {
        &self.active
    }
}

impl Dataset for ChromatinDataset {
    type Item = ChromatinWindow;

    fn len(&self) -> usize {
        self.active.len()
    }

    fn get(&self, idx: usize) -> Result<ChromatinWindow, DatasetError> {
        let element = self
            .active
            .get(idx)
            .and_then(|&row| self.elements.get(row))
            .ok_or(DatasetError::IndexOutOfRange { idx, len: self.len() })?;
        let genome = self.genome.as_ref();
        let (start, end) = (element.start as i64, element.end as i64);
        let crop = self.crop as i64;

        let seq = fetch_window(genome, &element.chrom, start, end)?;
        let chrom_len = genome.chrom_len(&element.chrom)?;
        let signal = signal_window(
            self.track.as_ref(),
            &element.chrom,
            start + crop,
            end - crop,
            chrom_len,
        )?;
        Ok(ChromatinWindow {
            seq,
            signal,
            idx_orig: element.idx_orig,
        })
    }

    fn set_epoch(&mut self, epoch: usize) {
        if let Some(ratio) = self.downsample_ratio {
            self.active = (epoch % ratio..self.elements.len()).step_by(ratio).collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genomics::{BedGraphTrack, InMemoryGenome, TsvTable};
    use std::collections::HashSet;

    fn elements(n: usize) -> ElementsTable {
        let mut text = String::from("chr\tinput_start\tinput_end\n");
        for i in 0..n {
            text.push_str(&format!("chr1\t{}\t{}\n", i, i + 6));
        }
        ElementsTable::from_tsv(&TsvTable::parse(&text).unwrap(), None).unwrap()
    }

    fn dataset(n: usize, ratio: Option<usize>) -> ChromatinDataset {
        let genome = InMemoryGenome::new().with_chrom("chr1", b"ACGTACGTACGTACGTACGT");
        let mut track = BedGraphTrack::new();
        track.push("chr1", 0, 20, 1.0);
        ChromatinDataset::new(Arc::new(genome), Arc::new(track), elements(n), 1, ratio).unwrap()
    }

    #[test]
    fn signal_is_cropped_and_summed() {
        let item = dataset(3, None).get(0).unwrap();
        assert_eq!(item.seq.nrows(), 6);
        assert_eq!(item.signal.len(), 4);
        let example: Example<Window> = item.into();
        assert_eq!(example.target, Target::Counts(4.0));
    }

    #[test]
    fn downsampling_covers_every_row_once_per_period() {
        let mut data = dataset(10, Some(3));
        let mut seen = HashSet::new();
        let mut total = 0;
        for epoch in 0..3 {
            data.set_epoch(epoch);
            total += data.len();
            seen.extend(data.active_rows().iter().copied());
        }
        assert_eq!(total, 10);
        assert_eq!(seen.len(), 10);

        data.set_epoch(4);
        assert_eq!(data.active_rows(), &[1, 4, 7]);
    }

    #[test]
    fn zero_ratio_is_rejected() {
        let genome = InMemoryGenome::new().with_chrom("chr1", b"ACGT");
        let result = ChromatinDataset::new(
            Arc::new(genome),
            Arc::new(BedGraphTrack::new()),
            elements(0),
            0,
            Some(0),
        );
        assert!(matches!(result, Err(DatasetError::InvalidConfig(_))));
    }
}
