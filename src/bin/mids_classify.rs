use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use log::info;

use dajin_allele::config::{parse_thread_count, AlphabetSpec, Contamination, EarlyStopping, InputPrecision, RunConfig};
use dajin_allele::errors::exit_with_error;
use dajin_allele::pipeline::AllelePipeline;

/// Classify MIDS-encoded reads into alleles and flag abnormal ones.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Options {
    /// Tab-separated seqID, MIDS sequence, barcodeID (optionally gzipped)
    input_path: PathBuf,

    /// `P` for point-mutation runs; any other non-empty value otherwise
    mutation_type: String,

    /// Worker threads for the novelty detector (default 1)
    #[clap(allow_hyphen_values = true)]
    thread_count: Option<String>,

    /// Prediction table to write
    #[clap(short, long, value_parser)]
    output: Option<PathBuf>,

    /// Alphabet symbols, or `observed` to collect them from the input
    #[clap(long, value_parser)]
    alphabet: Option<String>,

    /// Seed for the split and epoch shuffling
    #[clap(long, value_parser)]
    seed: Option<u64>,

    #[clap(long, default_value_t = 20, value_parser)]
    epochs: usize,

    #[clap(long, default_value_t = 32, value_parser)]
    batch_size: usize,

    /// Stop once validation loss has not improved for this many epochs
    #[clap(long, value_parser)]
    early_stopping: Option<usize>,

    /// Real reads classified per chunk
    #[clap(long, default_value_t = 1000, value_parser)]
    chunk_size: usize,

    /// Keep chunked inference input in single precision
    #[clap(long, action)]
    full_precision: bool,

    /// Neighbours for the local outlier factor
    #[clap(long, default_value_t = 20, value_parser)]
    neighbors: usize,

    /// `auto` or an expected outlier fraction in (0, 0.5]
    #[clap(long, default_value = "auto", value_parser)]
    contamination: String,

    /// Log accuracy on the held-out simulated reads
    #[clap(long, action)]
    evaluate_holdout: bool,

    /// Save trained weights (safetensors)
    #[clap(long, value_parser)]
    save_model: Option<PathBuf>,

    /// Write a JSON run summary
    #[clap(long, value_parser)]
    summary: Option<PathBuf>,
}

fn build_config(opts: Options) -> Result<RunConfig> {
    // mutation type first: nothing is read before it is known to be valid
    let threads = parse_thread_count(opts.thread_count.as_deref());
    let mut config = RunConfig::new(opts.input_path, &opts.mutation_type, threads)?;

    if let Some(output) = opts.output {
        config.output_path = output;
    }
    if let Some(alphabet) = opts.alphabet {
        config.alphabet = AlphabetSpec::parse(&alphabet);
    }
    config.seed = opts.seed;
    config.evaluate_holdout = opts.evaluate_holdout;
    config.training.epochs = opts.epochs;
    config.training.batch_size = opts.batch_size;
    config.training.early_stopping = opts.early_stopping.map(|patience| EarlyStopping {
        patience,
        min_delta: 0.0,
    });
    config.inference.chunk_size = opts.chunk_size;
    if opts.full_precision {
        config.inference.precision = InputPrecision::Full;
    }
    config.novelty.n_neighbors = opts.neighbors;
    config.novelty.contamination = Contamination::parse(&opts.contamination)?;
    config.model_path = opts.save_model;
    config.summary_path = opts.summary;
    Ok(config)
}

fn run(opts: Options) -> Result<()> {
    let config = build_config(opts)?;
    info!(
        "mids_classify: mutation type {}, {} thread(s)",
        config.mutation_type, config.novelty.threads
    );
    let summary = AllelePipeline::new(config)?.run()?;
    info!(
        "Classified {} real reads ({} abnormal)",
        summary.real_reads, summary.abnormal_reads
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let opts = Options::parse();
    if let Err(err) = run(opts) {
        exit_with_error(&err);
    }
}
