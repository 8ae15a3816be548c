use std::fs;
use std::path::Path;
use std::sync::Arc;

use dnalm_bench::dataset::{Concat, EmbeddingsDataset, PairedControlDataset, Region, TargetSource};
use dnalm_bench::evaluate::evaluate_binary;
use dnalm_bench::genomics::{ElementsTable, GenomeSource, InMemoryGenome, TsvTable};
use dnalm_bench::train::{
    best_epoch, checkpoint_path, optimizer_path, read_train_log, ConvProbeConfig, StateDict,
    TrainError, TrainerState, Validation, LOG_FILE,
};
use dnalm_bench::{
    ConvProbe, EmbeddingExtractor, Objective, OneHotBaseline, StoreReader, Target, Trainable,
    Trainer, TrainerConfig,
};

const CHR1: &[u8] = b"AAAAACCCCCGGGGGTTTTTACACACGTGTGTAAAACCCCAATTTTGGGGCATGCATGCA";

fn paired_store(dir: &Path, name: &str, rows: &[(u64, u64)], seed: u64) -> StoreReader {
    let genome: Arc<dyn GenomeSource> = Arc::new(InMemoryGenome::new().with_chrom("chr1", CHR1));
    let mut tsv = String::from("chr\tinput_start\tinput_end\n");
    for (start, end) in rows {
        tsv.push_str(&format!("chr1\t{start}\t{end}\n"));
    }
    let table = TsvTable::parse(&tsv).expect("table parses");
    let elements = ElementsTable::from_tsv(&table, None).expect("elements load");
    let out = dir.join(name);
    EmbeddingExtractor::new(OneHotBaseline, 3)
        .extract(&PairedControlDataset::new(genome, elements, seed), &out)
        .expect("extraction succeeds");
    StoreReader::open(&out).expect("store opens")
}

fn labeled(store: &StoreReader) -> Concat<EmbeddingsDataset, EmbeddingsDataset> {
    let group = |name: &str, class: usize| {
        let reader = store.group(name).expect("group exists");
        EmbeddingsDataset::new(reader, Region::Full, TargetSource::Constant(Target::Class(class)))
            .expect("dataset builds")
    };
    Concat::new(group("seq", 1), group("ctrl", 0))
}

fn probe() -> ConvProbe {
    ConvProbe::new(ConvProbeConfig {
        input_dim: 4,
        hidden: 4,
        kernel: 3,
        output_dim: 2,
        seed: 11,
        memory_budget: None,
    })
}

fn config(dir: &Path, epochs: usize) -> TrainerConfig {
    TrainerConfig {
        epochs,
        batch_size: 4,
        lr: 1e-2,
        ..TrainerConfig::new(dir, Objective::CrossEntropy)
    }
}

#[test]
fn extracted_embeddings_train_and_resume() {
    let dir = tempfile::tempdir().expect("tempdir");
    let windows = [(0, 12), (6, 18), (12, 24), (20, 32), (30, 42), (40, 52)];
    let train_store = paired_store(dir.path(), "train", &windows, 1);
    let val_store = paired_store(dir.path(), "val", &windows[..4], 2);
    let mut train = labeled(&train_store);
    let val = labeled(&val_store);
    let run = dir.path().join("run");

    let mut trainer = Trainer::new(probe(), config(&run, 3)).expect("trainer builds");
    let summaries = trainer
        .fit(&mut train, Validation::new(&val))
        .expect("training succeeds");
    assert_eq!(trainer.state(), TrainerState::Done);
    assert_eq!(summaries.iter().map(|s| s.epoch).collect::<Vec<_>>(), vec![0, 1, 2]);
    for epoch in 0..3 {
        assert!(checkpoint_path(&run, epoch).exists(), "model checkpoint {epoch}");
        assert!(optimizer_path(&run, epoch).exists(), "optimizer checkpoint {epoch}");
    }

    let log = fs::read_to_string(run.join(LOG_FILE)).expect("log exists");
    assert_eq!(
        log.lines().next(),
        Some("epoch\tval_loss\tval_acc\tval_auroc\tval_auprc\tval_mcc")
    );
    let best = best_epoch(&run.join(LOG_FILE)).expect("best epoch");
    assert!(best < 3);

    // A checkpoint restores the exact model it was written from.
    let trained = trainer.into_model();
    let bytes = fs::read(checkpoint_path(&run, 2)).expect("checkpoint readable");
    let state: StateDict = serde_json::from_slice(&bytes).expect("checkpoint parses");
    let mut restored = probe();
    restored.load_state_dict(&state).expect("state fits");
    assert_eq!(
        evaluate_binary(&trained, &val, 4).expect("evaluation"),
        evaluate_binary(&restored, &val, 4).expect("evaluation")
    );

    let mut resumed = Trainer::new(probe(), config(&run, 5)).expect("trainer builds");
    resumed.resume(2).expect("resume succeeds");
    assert_eq!(resumed.start_epoch(), 3);
    let more = resumed
        .fit(&mut train, Validation::new(&val))
        .expect("training continues");
    assert_eq!(more.iter().map(|s| s.epoch).collect::<Vec<_>>(), vec![3, 4]);

    let rows = read_train_log(&run.join(LOG_FILE)).expect("log parses");
    assert_eq!(rows.iter().map(|r| r.epoch).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    let log = fs::read_to_string(run.join(LOG_FILE)).expect("log exists");
    assert_eq!(log.lines().filter(|l| l.starts_with("epoch")).count(), 1);
}

#[test]
fn resume_requires_a_model_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut trainer = Trainer::new(probe(), config(dir.path(), 2)).expect("trainer builds");
    let err = trainer.resume(7).expect_err("no checkpoint");
    assert!(matches!(err, TrainError::NotFound(path) if path == checkpoint_path(dir.path(), 7)));
}

#[test]
fn missing_optimizer_state_is_not_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = serde_json::to_vec(&probe().state_dict()).expect("state serializes");
    fs::write(checkpoint_path(dir.path(), 0), state).expect("checkpoint written");

    let mut trainer = Trainer::new(probe(), config(dir.path(), 2)).expect("trainer builds");
    trainer.resume(0).expect("resume tolerates a missing optimizer file");
    assert_eq!(trainer.start_epoch(), 1);
}

#[test]
fn best_epoch_of_an_empty_log_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(LOG_FILE);
    fs::write(&path, "epoch\tval_loss\n").expect("log written");
    assert!(matches!(best_epoch(&path), Err(TrainError::Log { .. })));
}
