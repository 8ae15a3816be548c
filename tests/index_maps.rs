use dnalm_bench::dataset::batch_ranges;
use dnalm_bench::model::{
    gather_positions, kmer_indices, offsets_to_indices, FixedIndex, KmerTokenizer, Tokenizer,
};
use dnalm_bench::IndexLayout;
use ndarray::Array2;
use proptest::prelude::*;
use test_case::test_case;

fn nucleotides(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(
        prop_oneof![Just(b'A'), Just(b'C'), Just(b'G'), Just(b'T')],
        0..max_len,
    )
}

#[test_case(4, &[1, 2, 3, 4] ; "shorter than one block")]
#[test_case(6, &[1, 1, 1, 1, 1, 1] ; "exactly one block")]
#[test_case(12, &[1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2] ; "two blocks")]
#[test_case(20, &[1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 4, 5] ; "two base tail")]
#[test_case(
    23,
    &[1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 4, 5, 6, 7, 8] ;
    "five base tail"
)]
fn six_mer_map_after_cls(seq_len: usize, expected: &[u32]) {
    let map = kmer_indices(seq_len, 6);
    assert_eq!(map.to_vec(), expected);

    let fixed = FixedIndex::for_layout(IndexLayout::Kmer { k: 6 }, seq_len)
        .expect("k-mer layout has a fixed map");
    assert_eq!(fixed.positions(seq_len), expected);
}

#[test]
fn variable_layout_has_no_fixed_map() {
    assert!(FixedIndex::for_layout(IndexLayout::Variable, 10).is_none());
    assert_eq!(
        FixedIndex::for_layout(IndexLayout::Slice, 3).map(|f| f.positions(3)),
        Some(vec![0, 1, 2])
    );
}

proptest! {
    #[test]
    fn kmer_tokenizer_offsets_agree_with_fixed_map(
        sequence in nucleotides(64),
        k in 1usize..8,
    ) {
        let (ids, offsets) = KmerTokenizer::new(k, true).encode(&sequence);
        let from_offsets = offsets_to_indices(&[offsets], sequence.len());
        let fixed = kmer_indices(sequence.len(), k);

        prop_assert_eq!(from_offsets.row(0).to_vec(), fixed.to_vec());
        prop_assert!(fixed.iter().all(|&t| (t as usize) < ids.len()), "index past last token");
    }

    #[test]
    fn every_position_points_at_its_covering_token(
        token_lens in proptest::collection::vec(1usize..5, 1..20),
    ) {
        // CLS first, then contiguous spans.
        let mut offsets = vec![(0, 0)];
        let mut pos = 0;
        for len in &token_lens {
            offsets.push((pos, pos + len));
            pos += len;
        }
        let seq_len = pos;
        let map = offsets_to_indices(&[offsets.clone()], seq_len);

        for (p, &token) in map.row(0).iter().enumerate() {
            let (start, end) = offsets[token as usize];
            prop_assert!(start <= p && p < end, "position {} mapped to span {:?}", p, (start, end));
        }
        let row = map.row(0).to_vec();
        prop_assert!(row.windows(2).all(|w| w[0] <= w[1]), "map not monotonic");

        // Gathering from per-token rows recovers each position's token id.
        let tokens = Array2::from_shape_fn((offsets.len(), 1), |(t, _)| t as f32);
        let positions = map.row(0).to_vec();
        let gathered = gather_positions(tokens.view(), &positions).expect("indices are in range");
        prop_assert_eq!(gathered.nrows(), seq_len);
        for (row, &token) in gathered.column(0).iter().zip(&positions) {
            prop_assert_eq!(*row, token as f32);
        }
    }

    #[test]
    fn batch_ranges_cover_rows_once(len in 0usize..500, batch_size in 1usize..64) {
        let ranges: Vec<_> = batch_ranges(len, batch_size).collect();
        let mut next = 0;
        for range in &ranges {
            prop_assert_eq!(range.start, next);
            prop_assert!(range.end > range.start && range.len() <= batch_size);
            next = range.end;
        }
        prop_assert_eq!(next, len);
    }
}

#[test]
fn gather_rejects_indices_past_the_last_token() {
    let tokens = Array2::<f32>::zeros((3, 2));
    assert!(gather_positions(tokens.view(), &[0, 1, 3]).is_err());
}
