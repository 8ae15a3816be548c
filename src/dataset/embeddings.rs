use std::ops::Range;

use ndarray::{s, Array2};

use super::{Dataset, DatasetError, Example, Target};
use crate::genomics::ElementsTable;
use crate::store::GroupReader;

/// Part of each window handed to the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    /// Every position.
    Full,
    /// Drop `n` positions from each end.
    Crop(usize),
    /// Explicit per-example position ranges.
    Ranges(Vec<Range<usize>>),
}

impl Region {
    /// Element sub-regions from `elem_start`/`elem_end` columns, relative to
    /// each window's `input_start`.
    pub fn from_element_columns(elements: &ElementsTable) -> Result<Self, DatasetError> {
        elements.require_columns(&["elem_start", "elem_end"])?;
        let ranges = elements
            .iter()
            .map(|element| -> Result<Range<usize>, DatasetError> {
                let elem_start: u64 = elements.parse_field(element, "elem_start")?;
                let elem_end: u64 = elements.parse_field(element, "elem_end")?;
                let lo = elem_start.saturating_sub(element.start) as usize;
                let hi = elem_end.saturating_sub(element.start) as usize;
                Ok(lo.min(element.len())..hi.min(element.len()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Region::Ranges(ranges))
    }

    fn range(&self, idx: usize, seq_len: usize) -> Range<usize> {
        match self {
            Region::Full => 0..seq_len,
            Region::Crop(n) => {
                let lo = (*n).min(seq_len);
                lo..seq_len.saturating_sub(*n).max(lo)
            }
            Region::Ranges(ranges) => ranges.get(idx).cloned().unwrap_or(0..seq_len),
        }
    }
}

/// Supervision attached to stored embeddings.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetSource {
    /// Same target for every example.
    Constant(Target),
    /// Class index per example.
    Classes(Vec<usize>),
    /// Total counts per example.
    Counts(Vec<f32>),
}

impl TargetSource {
    fn target(&self, idx: usize) -> Option<Target> {
        match self {
            TargetSource::Constant(target) => Some(*target),
            TargetSource::Classes(classes) => classes.get(idx).map(|&c| Target::Class(c)),
            TargetSource::Counts(counts) => counts.get(idx).map(|&c| Target::Counts(c)),
        }
    }

    fn len(&self) -> Option<usize> {
        match self {
            TargetSource::Constant(_) => None,
            TargetSource::Classes(classes) => Some(classes.len()),
            TargetSource::Counts(counts) => Some(counts.len()),
        }
    }
}

/// Per-position embeddings of a store group, cut to a region and paired
/// with targets. Input to probing heads.
#[derive(Debug)]
pub struct EmbeddingsDataset {
    group: GroupReader,
    region: Region,
    targets: TargetSource,
}

impl EmbeddingsDataset {
    /// Fails when the targets or region ranges disagree with the group size.
    pub fn new(
        group: GroupReader,
        region: Region,
        targets: TargetSource,
    ) -> Result<Self, DatasetError> {
        let n = group.len();
        let mismatch = |what: &str, found: usize| {
            DatasetError::InvalidConfig(format!(
                "{what} has {found} entries but group '{}' has {n}",
                group.name()
            ))
        };
        if let Some(found) = targets.len().filter(|&found| found != n) {
            return Err(mismatch("target list", found));
        }
        if let Region::Ranges(ranges) = &region {
            if ranges.len() != n {
                return Err(mismatch("region list", ranges.len()));
            }
        }
        Ok(Self {
            group,
            region,
            targets,
        })
    }

    /// Underlying group.
    pub fn group(&self) -> &GroupReader {
        &self.group
    }
}

impl Dataset for EmbeddingsDataset {
    type Item = Example<Array2<f32>>;

    fn len(&self) -> usize {
        self.group.len()
    }

    fn get(&self, idx: usize) -> Result<Example<Array2<f32>>, DatasetError> {
        let target = self
            .targets
            .target(idx)
            .ok_or(DatasetError::IndexOutOfRange { idx, len: self.len() })?;
        let positions = self.group.position_embeddings(idx)?;
        let range = self.region.range(idx, positions.nrows());
        let input = positions.slice(s![range, ..]).to_owned();
        Ok(Example::new(input, target))
    }
}
