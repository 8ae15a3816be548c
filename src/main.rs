use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ndarray::Array2;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dnalm_bench::dataset::{
    BoxedDataset, ChromatinDataset, Concat, ElementWindowDataset, EmbeddingsDataset,
    FootprintingDataset, PairedControlDataset, PeaksDataset, Region, Target, TargetSource,
    VariantDataset,
};
use dnalm_bench::evaluate::{
    embedding_scores, evaluate_binary, evaluate_chromatin, evaluate_classifier,
    probed_count_differences, write_pair_likelihoods, write_variant_scores, LikelihoodEvaluator,
};
use dnalm_bench::genomics::{
    onehot_to_chars, BedGraphTrack, ClassMap, ElementsTable, FaidxGenome, GenomeSource,
};
use dnalm_bench::model::{KmerEmbedder, MarkovLikelihood, ModelFamily, OneHotBaseline};
use dnalm_bench::train::{
    best_epoch, checkpoint_path, ConvProbe, ConvProbeConfig, LoraConfig, LoraKmerModel,
    Objective, StateDict, Trainable, Trainer, TrainerConfig, Validation, LOG_FILE,
};
use dnalm_bench::{
    BenchConfig, ChromSplit, Dataset, EmbeddingExtractor, Example, SequenceModel, StoreReader,
};

/// File next to the checkpoints describing the probe shape.
const PROBE_CONFIG_FILE: &str = "probe.json";

#[derive(Parser, Debug)]
#[command(
    name = "dnalm-bench",
    about = "Embedding extraction, probing and evaluation for DNA language models"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum DatasetKind {
    /// Element windows from an elements table.
    Elements,
    /// Element windows with dinucleotide-shuffled controls.
    PairedControl,
    /// Allele windows of a variants table.
    Variants,
    /// Raw sequences with shuffled controls.
    Footprints,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ProbeTask {
    /// Log1p count regression from a `counts` column.
    Counts,
    /// Multi-class classification from a `label` column.
    Classes,
    /// Element versus shuffled control (`seq` / `ctrl` groups).
    Paired,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract token embeddings of a dataset into a store.
    Extract {
        /// Kind of input table.
        #[arg(long, value_enum, default_value_t = DatasetKind::Elements)]
        kind: DatasetKind,
        /// Elements, variants or sequence table (TSV).
        #[arg(long)]
        table: PathBuf,
        /// Indexed reference FASTA (not needed for footprints).
        #[arg(long)]
        genome: Option<PathBuf>,
        /// Chromosome partition to keep (`train`, `val`, `test`).
        #[arg(long)]
        split: Option<String>,
        /// Model family.
        #[arg(long, default_value = "sequence-baseline")]
        model: String,
        /// Embedding width of k-mer embedders.
        #[arg(long, default_value_t = 64)]
        dim: usize,
        /// Block size of variable-offset embedders.
        #[arg(long, default_value_t = 3)]
        k: usize,
        /// Seed for embedders and controls.
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Variant window length.
        #[arg(long, default_value_t = 500)]
        window: u64,
        /// Examples per batch.
        #[arg(long, default_value_t = 64)]
        batch_size: usize,
        /// Warn when tokenizer offsets disagree with a fixed index map.
        #[arg(long)]
        verify_fixed: bool,
        /// Output store directory.
        #[arg(long)]
        out: PathBuf,
    },
    /// Train a convolutional probe on stored embeddings.
    TrainProbe {
        /// Probing task.
        #[arg(long, value_enum)]
        task: ProbeTask,
        /// Training store.
        #[arg(long)]
        train_store: PathBuf,
        /// Validation store.
        #[arg(long)]
        val_store: PathBuf,
        /// Training elements table (counts and classes tasks).
        #[arg(long)]
        train_table: Option<PathBuf>,
        /// Validation elements table (counts and classes tasks).
        #[arg(long)]
        val_table: Option<PathBuf>,
        /// Class labels in index order (classes task).
        #[arg(long, value_delimiter = ',')]
        classes: Vec<String>,
        /// Positions cropped from each window end.
        #[arg(long, default_value_t = 0)]
        crop: usize,
        /// Convolution channels.
        #[arg(long, default_value_t = 32)]
        hidden: usize,
        /// Kernel width.
        #[arg(long, default_value_t = 5)]
        kernel: usize,
        /// Activation memory budget in bytes.
        #[arg(long)]
        memory_budget: Option<usize>,
        #[command(flatten)]
        schedule: Schedule,
        /// Continue after this epoch's checkpoint.
        #[arg(long)]
        resume_from: Option<usize>,
        /// Output directory for the log and checkpoints.
        #[arg(long)]
        out: PathBuf,
    },
    /// Evaluate a trained probe on test stores.
    EvalProbe {
        /// Probing task.
        #[arg(long, value_enum)]
        task: ProbeTask,
        /// Probe training directory.
        #[arg(long)]
        probe_dir: PathBuf,
        /// Epoch to load (default: lowest validation loss).
        #[arg(long)]
        epoch: Option<usize>,
        /// Test store (peaks for counts).
        #[arg(long)]
        store: PathBuf,
        /// Test elements table (peaks for counts).
        #[arg(long)]
        table: Option<PathBuf>,
        /// IDR peak store and table (counts task).
        #[arg(long, num_args = 2, value_names = ["STORE", "TABLE"])]
        idr: Vec<PathBuf>,
        /// Negative region store and table (counts task).
        #[arg(long, num_args = 2, value_names = ["STORE", "TABLE"])]
        neg: Vec<PathBuf>,
        /// Class labels in index order (classes task).
        #[arg(long, value_delimiter = ',')]
        classes: Vec<String>,
        /// Positions cropped from each window end.
        #[arg(long, default_value_t = 0)]
        crop: usize,
        /// Examples per batch.
        #[arg(long, default_value_t = 64)]
        batch_size: usize,
        /// Metrics report (JSON).
        #[arg(long)]
        out: PathBuf,
    },
    /// Fine-tune a low-rank adapted k-mer model end to end.
    Finetune {
        /// Counts (with a bedGraph track) or classes (with a `label` column).
        #[arg(long, value_enum)]
        task: ProbeTask,
        /// Indexed reference FASTA.
        #[arg(long)]
        genome: PathBuf,
        /// Elements table.
        #[arg(long)]
        table: PathBuf,
        /// Signal track (counts task).
        #[arg(long)]
        bedgraph: Option<PathBuf>,
        /// Class labels in index order (classes task).
        #[arg(long, value_delimiter = ',')]
        classes: Vec<String>,
        /// Bases cropped from each end of the signal window (counts task).
        #[arg(long, default_value_t = 0)]
        crop: u64,
        /// Keep every n-th training row per epoch (counts task).
        #[arg(long)]
        downsample: Option<usize>,
        /// Frozen embedding width.
        #[arg(long, default_value_t = 32)]
        dim: usize,
        /// Adapter rank.
        #[arg(long, default_value_t = 4)]
        rank: usize,
        /// Adapter scale numerator.
        #[arg(long, default_value_t = 8.0)]
        alpha: f32,
        /// Head convolution channels.
        #[arg(long, default_value_t = 32)]
        hidden: usize,
        /// Head kernel width.
        #[arg(long, default_value_t = 5)]
        kernel: usize,
        /// Activation memory budget in bytes.
        #[arg(long)]
        memory_budget: Option<usize>,
        #[command(flatten)]
        schedule: Schedule,
        /// Continue after this epoch's checkpoint.
        #[arg(long)]
        resume_from: Option<usize>,
        /// Output directory for the log and checkpoints.
        #[arg(long)]
        out: PathBuf,
    },
    /// Zero-shot likelihoods of footprints or variant alleles.
    Likelihoods {
        /// Footprints or variants.
        #[arg(long, value_enum)]
        kind: DatasetKind,
        /// Sequence or variants table.
        #[arg(long)]
        table: PathBuf,
        /// Indexed reference FASTA (variants).
        #[arg(long)]
        genome: Option<PathBuf>,
        /// Chromosome partition (variants).
        #[arg(long)]
        split: Option<String>,
        /// Variant window length.
        #[arg(long, default_value_t = 500)]
        window: u64,
        /// Markov background order.
        #[arg(long, default_value_t = 3)]
        order: usize,
        /// Control shuffle seed (footprints).
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Output TSV.
        #[arg(long)]
        out: PathBuf,
    },
    /// Embedding-distance (and optionally probed) scores of variants.
    VariantScores {
        /// Store with `allele1` and `allele2` groups.
        #[arg(long)]
        store: PathBuf,
        /// Variants table the store was extracted from.
        #[arg(long)]
        table: PathBuf,
        /// Indexed reference FASTA.
        #[arg(long)]
        genome: PathBuf,
        /// Chromosome partition used during extraction.
        #[arg(long)]
        split: Option<String>,
        /// Variant window length used during extraction.
        #[arg(long, default_value_t = 500)]
        window: u64,
        /// Counts probe directory for predicted allele differences.
        #[arg(long)]
        probe_dir: Option<PathBuf>,
        /// Examples per batch.
        #[arg(long, default_value_t = 64)]
        batch_size: usize,
        /// Output TSV.
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the epoch with the lowest validation loss.
    BestCheckpoint {
        /// Training directory holding `train.log`.
        dir: PathBuf,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct Schedule {
    /// Total epochs.
    #[arg(long, default_value_t = 10)]
    epochs: usize,
    /// Examples per batch.
    #[arg(long, default_value_t = 64)]
    batch_size: usize,
    /// Batches per optimizer step.
    #[arg(long, default_value_t = 1)]
    accumulate: usize,
    /// Learning rate.
    #[arg(long, default_value_t = 1e-3)]
    lr: f32,
    /// Decoupled weight decay.
    #[arg(long, default_value_t = 0.01)]
    weight_decay: f32,
    /// Shuffle seed.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl Schedule {
    fn trainer_config(&self, out_dir: PathBuf, objective: Objective) -> TrainerConfig {
        TrainerConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            accumulate: self.accumulate,
            lr: self.lr,
            weight_decay: self.weight_decay,
            seed: self.seed,
            ..TrainerConfig::new(out_dir, objective)
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = BenchConfig::from_env();

    match cli.command {
        Commands::Extract {
            kind,
            table,
            genome,
            split,
            model,
            dim,
            k,
            seed,
            window,
            batch_size,
            verify_fixed,
            out,
        } => {
            let family: ModelFamily = model.parse()?;
            let request = ExtractRequest {
                kind,
                table: config.work_path(table),
                genome: genome.map(|g| config.work_path(g)),
                chroms: split_chroms(split.as_deref())?,
                seed,
                window,
                out: config.work_path(out),
            };
            match family {
                ModelFamily::SequenceBaseline => {
                    run_extract(&config, OneHotBaseline, batch_size, verify_fixed, &request)?
                }
                ModelFamily::NucleotideTransformer => run_extract(
                    &config,
                    KmerEmbedder::nucleotide_transformer(dim, seed),
                    batch_size,
                    verify_fixed,
                    &request,
                )?,
                ModelFamily::Dnabert2 | ModelFamily::MistralDna | ModelFamily::GenaLm => {
                    run_extract(
                        &config,
                        KmerEmbedder::variable(family, k, dim, seed)?,
                        batch_size,
                        verify_fixed,
                        &request,
                    )?
                }
                ModelFamily::HyenaDna | ModelFamily::Caduceus => {
                    bail!("no built-in embedder for {family}")
                }
            }
        }
        Commands::TrainProbe {
            task,
            train_store,
            val_store,
            train_table,
            val_table,
            classes,
            crop,
            hidden,
            kernel,
            memory_budget,
            schedule,
            resume_from,
            out,
        } => {
            let region = Region::Crop(crop);
            let load = |store: &Path, table: Option<PathBuf>| {
                let table = table.map(|t| config.work_path(t));
                probe_dataset(task, &config.work_path(store), table, &classes, &region)
            };
            let mut train = load(&train_store, train_table)?;
            let val = load(&val_store, val_table)?;
            let input_dim = store_embedding_dim(&config.work_path(&train_store))?;
            let probe_config = ConvProbeConfig {
                input_dim,
                hidden,
                kernel,
                output_dim: task_outputs(task, &classes)?,
                seed: schedule.seed,
                memory_budget,
            };
            let out = config.work_path(out);
            fs::create_dir_all(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            let probe_json = serde_json::to_vec_pretty(&probe_config)?;
            fs::write(out.join(PROBE_CONFIG_FILE), probe_json)
                .with_context(|| format!("failed to write probe config in {}", out.display()))?;

            let probe = ConvProbe::new(probe_config);
            info!(parameters = probe.parameter_count(), "training probe");
            let trainer_config = schedule.trainer_config(out, task_objective(task));
            run_training(probe, trainer_config, resume_from, &mut train, &*val)?;
        }
        Commands::EvalProbe {
            task,
            probe_dir,
            epoch,
            store,
            table,
            idr,
            neg,
            classes,
            crop,
            batch_size,
            out,
        } => {
            let probe_dir = config.work_path(probe_dir);
            let probe = load_probe(&probe_dir, epoch)?;
            let region = Region::Crop(crop);
            let load = |store: &Path, table: Option<PathBuf>| {
                let table = table.map(|t| config.work_path(t));
                probe_dataset(task, &config.work_path(store), table, &classes, &region)
            };
            let test = load(&store, table)?;
            let report = match task {
                ProbeTask::Counts => {
                    let [idr_store, idr_table] = pair_arg("--idr", &idr)?;
                    let [neg_store, neg_table] = pair_arg("--neg", &neg)?;
                    let idr = load(idr_store, Some(idr_table.clone()))?;
                    let neg = load(neg_store, Some(neg_table.clone()))?;
                    evaluate_chromatin(&probe, &*test, &*idr, &*neg, batch_size)?
                }
                ProbeTask::Classes => evaluate_classifier(&probe, &*test, &classes, batch_size)?,
                ProbeTask::Paired => evaluate_binary(&probe, &*test, batch_size)?,
            };
            let out = config.work_path(out);
            report.write_json(&out)?;
            println!("{}", report.to_json()?);
        }
        Commands::Finetune {
            task,
            genome,
            table,
            bedgraph,
            classes,
            crop,
            downsample,
            dim,
            rank,
            alpha,
            hidden,
            kernel,
            memory_budget,
            schedule,
            resume_from,
            out,
        } => {
            let genome = open_genome(&config, &config.work_path(genome))?;
            let table = config.work_path(table);
            let split = ChromSplit::human();
            let load = |mode: &str| {
                ElementsTable::load(&table, split.partition(mode))
                    .with_context(|| format!("failed to load {mode} rows of {}", table.display()))
            };
            let (train_elements, val_elements) = (load("train")?, load("val")?);
            let model = LoraKmerModel::new(LoraConfig {
                embedding_dim: dim,
                rank,
                alpha,
                seed: schedule.seed,
                hidden,
                kernel,
                output_dim: task_outputs(task, &classes)?,
                memory_budget,
            });
            info!(parameters = model.parameter_count(), "fine-tuning adapter and head");
            let trainer_config =
                schedule.trainer_config(config.work_path(out), task_objective(task));
            match task {
                ProbeTask::Counts => {
                    let path =
                        bedgraph.ok_or_else(|| anyhow!("--bedgraph is required for counts"))?;
                    let track = Arc::new(BedGraphTrack::from_path(config.work_path(path))?);
                    let mut train = ChromatinDataset::new(
                        genome.clone(),
                        track.clone(),
                        train_elements,
                        crop,
                        downsample,
                    )?;
                    let val = ChromatinDataset::new(genome, track, val_elements, crop, None)?;
                    run_training(model, trainer_config, resume_from, &mut train, &val)?;
                }
                ProbeTask::Classes => {
                    let class_map = ClassMap::from_labels(classes.iter().cloned());
                    let mut train =
                        PeaksDataset::new(genome.clone(), train_elements, class_map.clone())?;
                    let val = PeaksDataset::new(genome, val_elements, class_map)?;
                    run_training(model, trainer_config, resume_from, &mut train, &val)?;
                }
                ProbeTask::Paired => bail!("fine-tuning supports the counts and classes tasks"),
            }
        }
        Commands::Likelihoods {
            kind,
            table,
            genome,
            split,
            window,
            order,
            seed,
            out,
        } => {
            let table = config.work_path(table);
            let out = config.work_path(out);
            match kind {
                DatasetKind::Footprints => {
                    let data = FootprintingDataset::load(&table, seed)?;
                    let sequences: Vec<&[u8]> =
                        (0..data.len()).filter_map(|i| data.sequence(i)).collect();
                    let model = MarkovLikelihood::fit(&sequences, order);
                    let scores = LikelihoodEvaluator::new(model, 64).score(&data)?;
                    write_pair_likelihoods(&out, ["seq", "ctrl"], &scores)?;
                }
                DatasetKind::Variants => {
                    let genome_path =
                        genome.ok_or_else(|| anyhow!("--genome is required for variants"))?;
                    let genome = open_genome(&config, &config.work_path(genome_path))?;
                    let chroms = split_chroms(split.as_deref())?;
                    let data = VariantDataset::load(genome, &table, chroms.as_deref(), window)?;
                    let mut references = Vec::with_capacity(data.len());
                    for idx in 0..data.len() {
                        references.push(onehot_to_chars(data.get(idx)?.allele1.view()));
                    }
                    let model = MarkovLikelihood::fit(&references, order);
                    let scores = LikelihoodEvaluator::new(model, 64).score(&data)?;
                    write_pair_likelihoods(&out, ["allele1", "allele2"], &scores)?;
                }
                other => bail!("likelihoods support footprints and variants, not {other:?}"),
            }
            info!(path = %out.display(), "likelihoods written");
        }
        Commands::VariantScores {
            store,
            table,
            genome,
            split,
            window,
            probe_dir,
            batch_size,
            out,
        } => {
            let genome = open_genome(&config, &config.work_path(genome))?;
            let chroms = split_chroms(split.as_deref())?;
            let table = config.work_path(table);
            let variants = VariantDataset::load(genome, &table, chroms.as_deref(), window)?;
            let store = StoreReader::open(config.work_path(store))?;
            let allele1 = store.group("allele1")?;
            let allele2 = store.group("allele2")?;
            let scores = embedding_scores(&allele1, &allele2)?;
            let counts = match probe_dir {
                Some(dir) => {
                    let probe = load_probe(&config.work_path(dir), None)?;
                    Some(probed_count_differences(&probe, &allele1, &allele2, batch_size)?)
                }
                None => None,
            };
            let out = config.work_path(out);
            write_variant_scores(&out, variants.variants(), &scores, counts.as_deref())?;
            info!(path = %out.display(), variants = scores.len(), "variant scores written");
        }
        Commands::BestCheckpoint { dir } => {
            let log = config.work_path(dir).join(LOG_FILE);
            let epoch =
                best_epoch(&log).with_context(|| format!("failed to read {}", log.display()))?;
            println!("{epoch}");
        }
    }

    Ok(())
}

struct ExtractRequest {
    kind: DatasetKind,
    table: PathBuf,
    genome: Option<PathBuf>,
    chroms: Option<Vec<String>>,
    seed: u64,
    window: u64,
    out: PathBuf,
}

fn run_extract<M: SequenceModel>(
    config: &BenchConfig,
    model: M,
    batch_size: usize,
    verify_fixed: bool,
    request: &ExtractRequest,
) -> Result<()> {
    let extractor = EmbeddingExtractor::new(model, batch_size).verify_fixed(verify_fixed);
    let chroms = request.chroms.as_deref();
    let genome = || -> Result<Arc<dyn GenomeSource>> {
        let path = request
            .genome
            .as_ref()
            .ok_or_else(|| anyhow!("--genome is required for {:?}", request.kind))?;
        open_genome(config, path)
    };
    let summary = match request.kind {
        DatasetKind::Elements => {
            let elements = ElementsTable::load(&request.table, chroms)?;
            extractor.extract(&ElementWindowDataset::new(genome()?, elements), &request.out)?
        }
        DatasetKind::PairedControl => {
            let elements = ElementsTable::load(&request.table, chroms)?;
            let data = PairedControlDataset::new(genome()?, elements, request.seed);
            extractor.extract(&data, &request.out)?
        }
        DatasetKind::Variants => {
            let data = VariantDataset::load(genome()?, &request.table, chroms, request.window)?;
            extractor.extract(&data, &request.out)?
        }
        DatasetKind::Footprints => {
            let data = FootprintingDataset::load(&request.table, request.seed)?;
            extractor.extract(&data, &request.out)?
        }
    };
    info!(
        path = %summary.path.display(),
        examples = summary.examples,
        groups = ?summary.groups,
        index_mismatches = summary.index_mismatches,
        "extraction finished"
    );
    Ok(())
}

fn open_genome(config: &BenchConfig, path: &Path) -> Result<Arc<dyn GenomeSource>> {
    let path = config
        .reference_path(path)
        .with_context(|| format!("failed to cache reference {}", path.display()))?;
    let genome = FaidxGenome::open(&path)
        .with_context(|| format!("failed to open reference {}", path.display()))?;
    Ok(Arc::new(genome))
}

fn split_chroms(split: Option<&str>) -> Result<Option<Vec<String>>> {
    match split {
        None => Ok(None),
        Some(mode) => ChromSplit::human()
            .partition(mode)
            .map(|chroms| Some(chroms.to_vec()))
            .ok_or_else(|| anyhow!("unknown split '{mode}' (expected train, val or test)")),
    }
}

fn task_objective(task: ProbeTask) -> Objective {
    match task {
        ProbeTask::Counts => Objective::Log1pMse,
        ProbeTask::Classes | ProbeTask::Paired => Objective::CrossEntropy,
    }
}

fn task_outputs(task: ProbeTask, classes: &[String]) -> Result<usize> {
    match task {
        ProbeTask::Counts => Ok(1),
        ProbeTask::Paired => Ok(2),
        ProbeTask::Classes if classes.len() >= 2 => Ok(classes.len()),
        ProbeTask::Classes => bail!("--classes needs at least two labels"),
    }
}

fn pair_arg<'a>(flag: &str, values: &'a [PathBuf]) -> Result<[&'a PathBuf; 2]> {
    match values {
        [store, table] => Ok([store, table]),
        _ => bail!("{flag} STORE TABLE is required for the counts task"),
    }
}

fn store_embedding_dim(path: &Path) -> Result<usize> {
    let store = StoreReader::open(path)?;
    let group = store.group("seq")?;
    group
        .embedding_dim()
        .ok_or_else(|| anyhow!("store {} holds no embeddings", path.display()))
}

/// Embedding dataset of one store for a probing task. Counts and classes
/// read targets from the elements table the store was extracted from; the
/// paired task labels `seq` as class 1 and `ctrl` as class 0.
fn probe_dataset(
    task: ProbeTask,
    store: &Path,
    table: Option<PathBuf>,
    classes: &[String],
    region: &Region,
) -> Result<BoxedDataset<Example<Array2<f32>>>> {
    let reader = StoreReader::open(store)
        .with_context(|| format!("failed to open store {}", store.display()))?;
    let group = |name: &str| reader.group(name).with_context(|| format!("missing group '{name}'"));
    if task == ProbeTask::Paired {
        let labeled = |name: &str, class: usize| -> Result<EmbeddingsDataset> {
            let targets = TargetSource::Constant(Target::Class(class));
            Ok(EmbeddingsDataset::new(group(name)?, region.clone(), targets)?)
        };
        let seq = labeled("seq", 1)?;
        let ctrl = labeled("ctrl", 0)?;
        return Ok(Box::new(Concat::new(seq, ctrl)));
    }

    let table = table.ok_or_else(|| anyhow!("an elements table is required for {task:?}"))?;
    let elements = ElementsTable::load(&table, None)
        .with_context(|| format!("failed to load elements {}", table.display()))?;
    let targets = match task {
        ProbeTask::Counts => TargetSource::Counts(
            elements
                .iter()
                .map(|e| elements.parse_field::<f32>(e, "counts"))
                .collect::<Result<_, _>>()?,
        ),
        _ => {
            let class_map = ClassMap::from_labels(classes.iter().cloned());
            let labels = elements
                .iter()
                .map(|e| {
                    let label = elements.field(e, PeaksDataset::LABEL_COLUMN)?;
                    class_map
                        .index(label)
                        .ok_or_else(|| anyhow!("unknown class label '{label}'"))
                })
                .collect::<Result<_>>()?;
            TargetSource::Classes(labels)
        }
    };
    Ok(Box::new(EmbeddingsDataset::new(group("seq")?, region.clone(), targets)?))
}

fn run_training<M, T, V>(
    model: M,
    config: TrainerConfig,
    resume_from: Option<usize>,
    train: &mut T,
    val: &V,
) -> Result<()>
where
    M: Trainable,
    T: Dataset,
    T::Item: Into<Example<M::Input>>,
    V: Dataset + ?Sized,
    V::Item: Into<Example<M::Input>>,
{
    let out_dir = config.out_dir.clone();
    let mut trainer = Trainer::new(model, config)?;
    if let Some(epoch) = resume_from {
        trainer.resume(epoch).with_context(|| {
            format!("failed to resume from epoch {epoch} in {}", out_dir.display())
        })?;
    }
    let summaries = trainer.fit(train, Validation::new(val))?;
    if let Some(last) = summaries.last() {
        info!(epoch = last.epoch, val_loss = last.val_loss, "training finished");
    }
    let best = best_epoch(&out_dir.join(LOG_FILE))?;
    println!("{}", checkpoint_path(&out_dir, best).display());
    Ok(())
}

fn load_probe(dir: &Path, epoch: Option<usize>) -> Result<ConvProbe> {
    let config_path = dir.join(PROBE_CONFIG_FILE);
    let bytes = fs::read(&config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let probe_config: ConvProbeConfig = serde_json::from_slice(&bytes)?;
    let epoch = match epoch {
        Some(epoch) => epoch,
        None => best_epoch(&dir.join(LOG_FILE))?,
    };
    let path = checkpoint_path(dir, epoch);
    let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let state: StateDict = serde_json::from_slice(&bytes)?;
    let mut probe = ConvProbe::new(probe_config);
    probe.load_state_dict(&state)?;
    info!(epoch, path = %path.display(), "loaded probe checkpoint");
    Ok(probe)
}
