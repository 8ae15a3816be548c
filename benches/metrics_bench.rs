//! Index-map construction and ranking metrics at benchmark scale.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dnalm_bench::evaluate::{average_precision, counts_spearman, roc_auc};
use dnalm_bench::model::{kmer_indices, offsets_to_indices, KmerTokenizer, Tokenizer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_sequence(rng: &mut StdRng, len: usize) -> Vec<u8> {
    (0..len).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect()
}

fn bench_index_maps(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut group = c.benchmark_group("index_maps");
    for &len in &[500usize, 2_114] {
        let batch: Vec<Vec<u8>> = (0..64).map(|_| random_sequence(&mut rng, len)).collect();
        let tokenizer = KmerTokenizer::new(6, true);
        let offsets: Vec<_> = batch.iter().map(|s| tokenizer.encode(s).1).collect();

        group.bench_with_input(BenchmarkId::new("offsets_to_indices", len), &offsets, |b, o| {
            b.iter(|| offsets_to_indices(black_box(o), len))
        });
        group.bench_with_input(BenchmarkId::new("kmer_indices", len), &len, |b, &l| {
            b.iter(|| kmer_indices(black_box(l), 6))
        });
    }
    group.finish();
}

fn bench_ranking_metrics(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let n = 50_000;
    let labels: Vec<bool> = (0..n).map(|_| rng.gen_bool(0.3)).collect();
    let scores: Vec<f64> = labels
        .iter()
        .map(|&l| rng.gen::<f64>() + if l { 0.5 } else { 0.0 })
        .collect();
    let preds: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0..8.0)).collect();
    let counts: Vec<f32> = preds.iter().map(|p| p.exp() + rng.gen_range(0.0..10.0)).collect();

    c.bench_function("roc_auc_50k", |b| {
        b.iter(|| roc_auc(black_box(&labels), black_box(&scores)))
    });
    c.bench_function("average_precision_50k", |b| {
        b.iter(|| average_precision(black_box(&labels), black_box(&scores)))
    });
    c.bench_function("counts_spearman_50k", |b| {
        b.iter(|| counts_spearman(black_box(&preds), black_box(&counts)))
    });
}

criterion_group!(benches, bench_index_maps, bench_ranking_metrics);
criterion_main!(benches);
