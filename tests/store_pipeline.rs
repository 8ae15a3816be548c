use std::path::Path;
use std::sync::Arc;

use dnalm_bench::dataset::{ElementWindowDataset, PairedControlDataset};
use dnalm_bench::genomics::{ElementsTable, GenomeSource, InMemoryGenome, TsvTable};
use dnalm_bench::store::{tmp_path, StoreError, MANIFEST_FILE};
use dnalm_bench::{
    Dataset, EmbeddingExtractor, IndexMap, KmerEmbedder, ModelFamily, OneHotBaseline, StoreReader,
    StoreWriter,
};
use ndarray::{Array3, Axis};

const CHR1: &[u8] = b"ACGTTGCAACGGTACCATGCAGTCGATCGGATCCATGACT";

fn genome() -> Arc<dyn GenomeSource> {
    Arc::new(InMemoryGenome::new().with_chrom("chr1", CHR1))
}

fn elements() -> ElementsTable {
    let tsv = "chr\tinput_start\tinput_end\n\
               chr1\t0\t10\n\
               chr1\t5\t15\n\
               chr1\t10\t20\n\
               chr1\t20\t30\n\
               chr1\t25\t35\n";
    let table = TsvTable::parse(tsv).expect("table parses");
    ElementsTable::from_tsv(&table, None).expect("elements load")
}

#[test]
fn one_hot_store_reproduces_windows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out = dir.path().join("onehot");
    let dataset = ElementWindowDataset::new(genome(), elements());

    let summary = EmbeddingExtractor::new(OneHotBaseline, 2)
        .extract(&dataset, &out)
        .expect("extraction succeeds");
    assert_eq!(summary.examples, 5);
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.groups, vec!["seq".to_string()]);
    assert!(out.join(MANIFEST_FILE).exists());
    assert!(!tmp_path(&out).exists(), "temporary directory left behind");

    let store = StoreReader::open(&out).expect("store opens");
    let group = store.group("seq").expect("seq group");
    assert_eq!(group.len(), 5);
    assert_eq!(group.seq_len(), 10);
    assert_eq!(group.embedding_dim(), Some(4));
    assert_eq!(group.chunk_ranges(), vec![0..2, 2..4, 4..5]);
    assert_eq!(
        group.chunk_keys(),
        vec!["emb_0_2".to_string(), "emb_2_4".to_string(), "emb_4_5".to_string()]
    );

    for idx in 0..dataset.len() {
        let window = dataset.get(idx).expect("window builds");
        let positions = group.position_embeddings(idx).expect("positions read");
        assert_eq!(positions, window.mapv(f32::from), "example {idx}");
    }
}

#[test]
fn paired_controls_keep_base_composition() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out = dir.path().join("paired");
    let dataset = PairedControlDataset::new(genome(), elements(), 7);

    let summary = EmbeddingExtractor::new(OneHotBaseline, 4)
        .extract(&dataset, &out)
        .expect("extraction succeeds");
    assert_eq!(summary.groups, vec!["seq".to_string(), "ctrl".to_string()]);

    let store = StoreReader::open(&out).expect("store opens");
    let seq = store.group("seq").expect("seq group");
    let ctrl = store.group("ctrl").expect("ctrl group");
    for idx in 0..dataset.len() {
        let a = seq.position_embeddings(idx).expect("seq read");
        let b = ctrl.position_embeddings(idx).expect("ctrl read");
        assert_eq!(a.sum_axis(Axis(0)), b.sum_axis(Axis(0)), "example {idx}");
    }
}

#[test]
fn variable_layout_stores_one_index_row_per_example() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out = dir.path().join("bpe");
    let model = KmerEmbedder::variable(ModelFamily::Dnabert2, 3, 8, 0).expect("model builds");
    let dataset = ElementWindowDataset::new(genome(), elements());
    EmbeddingExtractor::new(model, 3)
        .extract(&dataset, &out)
        .expect("extraction succeeds");

    let group = StoreReader::open(&out)
        .and_then(|store| store.group("seq"))
        .expect("seq group");
    match group.index_map().expect("index map reads") {
        IndexMap::Variable(rows) => assert_eq!(rows.dim(), (5, 10)),
        other => panic!("expected a variable index map, found {other:?}"),
    }
    for idx in 0..5 {
        let positions = group.position_embeddings(idx).expect("positions read");
        assert_eq!(positions.dim(), (10, 8));
    }
}

fn partial_writer(path: &Path) -> StoreWriter {
    let mut writer = StoreWriter::create(path).expect("writer starts");
    writer.create_group("seq", 4, 3).expect("group declared");
    writer
        .append_embeddings("seq", 0, Array3::<f32>::zeros((2, 3, 2)).view())
        .expect("first chunk");
    writer
}

#[test]
fn interrupted_writer_leaves_no_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out = dir.path().join("crashed");

    drop(partial_writer(&out));
    assert!(!out.exists(), "dropped writer published a store");

    let err = partial_writer(&out).finish().expect_err("incomplete store");
    assert!(matches!(
        err,
        StoreError::Incomplete {
            written: 2,
            expected: 4,
            ..
        }
    ));
    assert!(!out.exists(), "incomplete store was published");
}

#[test]
fn chunks_must_be_contiguous() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut writer = partial_writer(&dir.path().join("gap"));
    let err = writer
        .append_embeddings("seq", 3, Array3::<f32>::zeros((1, 3, 2)).view())
        .expect_err("gap rejected");
    assert!(matches!(
        err,
        StoreError::NonContiguous {
            start: 3,
            expected: 2,
            ..
        }
    ));
}
