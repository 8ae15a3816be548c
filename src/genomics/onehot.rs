use ndarray::{Array2, ArrayView2};

/// Number of canonical nucleotides (A, C, G, T).
pub const NUM_BASES: usize = 4;

/// Column order of a one-hot window.
pub const ALPHABET: [u8; NUM_BASES] = [b'A', b'C', b'G', b'T'];

/// One-hot nucleotide window: `positions × 4` indicator matrix in `A,C,G,T`
/// column order. Ambiguous and out-of-bounds positions are all-zero rows.
pub type Window = Array2<u8>;

/// Column index of a base in the one-hot alphabet.
pub fn base_index(base: u8) -> Option<usize> {
    match base {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' | b'U' | b'u' => Some(3),
        _ => None,
    }
}

/// Encode ASCII bases into a one-hot window.
///
/// Anything outside `ACGTU` (case-insensitive) becomes an all-zero row.
pub fn one_hot_encode(sequence: &[u8]) -> Window {
    let mut window = Array2::zeros((sequence.len(), NUM_BASES));
    for (pos, &base) in sequence.iter().enumerate() {
        if let Some(col) = base_index(base) {
            window[[pos, col]] = 1;
        }
    }
    window
}

/// Decode a one-hot window back to uppercase ASCII; zero rows decode to `N`.
pub fn onehot_to_chars(window: ArrayView2<'_, u8>) -> Vec<u8> {
    window
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .position(|&v| v != 0)
                .map(|col| ALPHABET[col])
                .unwrap_or(b'N')
        })
        .collect()
}

/// Returns `true` when every entry of the window is zero.
pub fn is_blank(window: ArrayView2<'_, u8>) -> bool {
    window.iter().all(|&v| v == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_and_decode_roundtrip() {
        let seq = b"ACGTacgt";
        let window = one_hot_encode(seq);
        assert_eq!(window.dim(), (8, 4));
        assert_eq!(onehot_to_chars(window.view()), b"ACGTACGT");
    }

    #[test]
    fn ambiguous_bases_are_zero_rows() {
        let window = one_hot_encode(b"ANx");
        assert_eq!(window.row(0).to_vec(), vec![1, 0, 0, 0]);
        assert!(window.row(1).iter().all(|&v| v == 0));
        assert!(window.row(2).iter().all(|&v| v == 0));
        assert_eq!(onehot_to_chars(window.view()), b"ANN");
    }

    #[test]
    fn blank_detection() {
        assert!(is_blank(one_hot_encode(b"NNNN").view()));
        assert!(!is_blank(one_hot_encode(b"NNGN").view()));
    }
}
