use ndarray::{Array1, Array2, ArrayView2, Axis};

use super::{IndexLayout, ModelError};

/// Index map shared by every example of a store group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixedIndex {
    /// Position `p` maps to token `start + p`; stored as `[start, end]`.
    Slice {
        /// Token of position 0.
        start: u32,
        /// One past the token of the last position.
        end: u32,
    },
    /// Explicit token index per position.
    Gather(Array1<u32>),
}

impl FixedIndex {
    /// Fixed map for `layout` and windows of `seq_len` bases. `None` for the
    /// variable layout.
    pub fn for_layout(layout: IndexLayout, seq_len: usize) -> Option<Self> {
        match layout {
            IndexLayout::Variable => None,
            IndexLayout::Slice => Some(FixedIndex::Slice {
                start: 0,
                end: seq_len as u32,
            }),
            IndexLayout::Kmer { k } => Some(FixedIndex::Gather(kmer_indices(seq_len, k))),
        }
    }

    /// Token index of every position of a `seq_len` window.
    pub fn positions(&self, seq_len: usize) -> Vec<u32> {
        match self {
            FixedIndex::Slice { start, .. } => (0..seq_len as u32).map(|p| start + p).collect(),
            FixedIndex::Gather(map) => map.iter().copied().take(seq_len).collect(),
        }
    }
}

/// Position-to-token map of a batch or store group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexMap {
    /// One row per example, `[N, L]`.
    Variable(Array2<u32>),
    /// One map for every example.
    Fixed(FixedIndex),
}

impl IndexMap {
    /// Token index of every position for example `row`.
    pub fn row(&self, row: usize, seq_len: usize) -> Option<Vec<u32>> {
        match self {
            IndexMap::Variable(map) => (row < map.nrows()).then(|| map.row(row).to_vec()),
            IndexMap::Fixed(fixed) => Some(fixed.positions(seq_len)),
        }
    }
}

/// Variable map: positions `[s, e)` of example `i` get token index `j` for
/// the `j`-th offset `(s, e)`; untouched positions stay 0.
pub fn offsets_to_indices(offsets: &[Vec<(usize, usize)>], seq_len: usize) -> Array2<u32> {
    let mut gather = Array2::zeros((offsets.len(), seq_len));
    for (i, spans) in offsets.iter().enumerate() {
        for (j, &(start, end)) in spans.iter().enumerate() {
            let end = end.min(seq_len);
            for pos in start.min(end)..end {
                gather[[i, pos]] = j as u32;
            }
        }
    }
    gather
}

/// Fixed k-mer map after a leading CLS token: positions `[k·i, k·i + k)` get
/// `i + 1`; the `L mod k` tail positions get `L/k + 1, L/k + 2, …`.
pub fn kmer_indices(seq_len: usize, k: usize) -> Array1<u32> {
    let k = k.max(1);
    let blocks = seq_len / k;
    let mut map = Array1::zeros(seq_len);
    for pos in 0..blocks * k {
        map[pos] = (pos / k + 1) as u32;
    }
    for (offset, pos) in (blocks * k..seq_len).enumerate() {
        map[pos] = (blocks + 1 + offset) as u32;
    }
    map
}

/// Per-position embeddings `[L, d]` gathered from token embeddings `[T, d]`.
pub fn gather_positions(
    tokens: ArrayView2<'_, f32>,
    positions: &[u32],
) -> Result<Array2<f32>, ModelError> {
    let num_tokens = tokens.nrows();
    if let Some(&bad) = positions.iter().find(|&&t| t as usize >= num_tokens) {
        return Err(ModelError::Shape {
            expected: format!("token index < {num_tokens}"),
            found: bad.to_string(),
        });
    }
    let rows: Vec<usize> = positions.iter().map(|&t| t as usize).collect();
    Ok(tokens.select(Axis(0), &rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn offsets_fill_spans_and_leave_gaps_zero() {
        let offsets = vec![vec![(0, 0), (0, 3), (3, 5)], vec![(0, 0), (1, 2)]];
        let map = offsets_to_indices(&offsets, 6);
        assert_eq!(map, array![[1, 1, 1, 2, 2, 0], [0, 1, 0, 0, 0, 0]]);
    }

    #[test]
    fn slice_positions_are_identity() {
        let fixed = FixedIndex::for_layout(IndexLayout::Slice, 4).unwrap();
        assert_eq!(fixed, FixedIndex::Slice { start: 0, end: 4 });
        assert_eq!(fixed.positions(4), vec![0, 1, 2, 3]);
        assert!(FixedIndex::for_layout(IndexLayout::Variable, 4).is_none());
    }

    #[test]
    fn gather_selects_rows() {
        let tokens = array![[0.0f32, 0.5], [1.0, 1.5], [2.0, 2.5]];
        let out = gather_positions(tokens.view(), &[2, 2, 0]).unwrap();
        assert_eq!(out, array![[2.0, 2.5], [2.0, 2.5], [0.0, 0.5]]);
        assert!(gather_positions(tokens.view(), &[3]).is_err());
    }
}
