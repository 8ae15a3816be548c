//! Dinucleotide-preserving shuffle (Altschul & Erickson).
//!
//! Controls for paired-control and footprint tasks must keep the dinucleotide
//! composition of the original sequence. The shuffle picks a random Eulerian
//! path through the dinucleotide multigraph: a random arborescence of "last
//! exit" edges rooted at the final base, then random order for every other
//! edge.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Deterministic RNG for example `idx` under a global `seed`.
pub fn example_rng(seed: u64, idx: usize) -> StdRng {
    StdRng::seed_from_u64(seed ^ (idx as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Shuffle `sequence` while preserving every dinucleotide count as well as
/// the first and last base. Input is uppercased first.
pub fn dinucleotide_shuffle<R: Rng + ?Sized>(sequence: &[u8], rng: &mut R) -> Vec<u8> {
    let seq = sequence.to_ascii_uppercase();
    if seq.len() <= 2 {
        return seq;
    }

    let mut edges: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
    for pair in seq.windows(2) {
        edges.entry(pair[0]).or_default().push(pair[1]);
    }

    let first = seq[0];
    let last = seq[seq.len() - 1];
    let last_exits = choose_last_exits(&edges, last, rng);

    // Shuffle each edge list, then move the chosen last exit to the end.
    for (vertex, targets) in edges.iter_mut() {
        targets.shuffle(rng);
        if let Some(&exit) = last_exits.get(vertex) {
            if let Some(pos) = targets.iter().position(|&t| t == exit) {
                let chosen = targets.remove(pos);
                targets.push(chosen);
            }
        }
    }

    let mut cursors: BTreeMap<u8, usize> = BTreeMap::new();
    let mut out = Vec::with_capacity(seq.len());
    out.push(first);
    let mut vertex = first;
    for _ in 1..seq.len() {
        let cursor = cursors.entry(vertex).or_insert(0);
        let next = edges[&vertex][*cursor];
        *cursor += 1;
        out.push(next);
        vertex = next;
    }
    out
}

/// For every vertex other than `last`, choose one outgoing edge so that the
/// chosen edges form a tree directed at `last`. Returns the target base of
/// each chosen edge, keyed by vertex.
fn choose_last_exits<R: Rng + ?Sized>(
    edges: &BTreeMap<u8, Vec<u8>>,
    last: u8,
    rng: &mut R,
) -> BTreeMap<u8, u8> {
    loop {
        let mut exits = BTreeMap::new();
        for (&vertex, targets) in edges {
            if vertex == last || targets.is_empty() {
                continue;
            }
            exits.insert(vertex, targets[rng.gen_range(0..targets.len())]);
        }

        let reaches_last = exits.keys().all(|&start| {
            let mut vertex = start;
            for _ in 0..=exits.len() {
                if vertex == last {
                    return true;
                }
                match exits.get(&vertex) {
                    Some(&next) => vertex = next,
                    None => return false,
                }
            }
            vertex == last
        });

        if reaches_last {
            return exits;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn dinucleotide_counts(seq: &[u8]) -> HashMap<(u8, u8), usize> {
        let mut counts = HashMap::new();
        for pair in seq.windows(2) {
            *counts.entry((pair[0], pair[1])).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn preserves_dinucleotides_and_ends() {
        let seq = b"ACGTTGCAAGGCTTACGATCGATCGGGATTACA";
        for seed in 0..20 {
            let mut rng = example_rng(seed, 3);
            let shuffled = dinucleotide_shuffle(seq, &mut rng);
            assert_eq!(shuffled.len(), seq.len());
            assert_eq!(shuffled[0], seq[0]);
            assert_eq!(shuffled[seq.len() - 1], seq[seq.len() - 1]);
            assert_eq!(dinucleotide_counts(&shuffled), dinucleotide_counts(seq));
        }
    }

    #[test]
    fn deterministic_for_fixed_seed() {
        let seq = b"ACGTACGGTCAGTTACGATGCA";
        let a = dinucleotide_shuffle(seq, &mut example_rng(7, 1));
        let b = dinucleotide_shuffle(seq, &mut example_rng(7, 1));
        assert_eq!(a, b);
    }

    #[test]
    fn short_sequences_are_returned_unchanged() {
        let mut rng = example_rng(0, 0);
        assert_eq!(dinucleotide_shuffle(b"ac", &mut rng), b"AC");
        assert_eq!(dinucleotide_shuffle(b"", &mut rng), b"");
    }
}
