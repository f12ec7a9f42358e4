use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use log::warn;
use serde::Serialize;

use crate::encoding::{Alphabet, MIDS_SYMBOLS};
use crate::errors::PipelineError;

/// Where DAJIN expects the prediction table.
pub const DEFAULT_OUTPUT_PATH: &str = ".DAJIN_temp/data/DAJIN_MIDS_prediction_result.txt";
pub const DEFAULT_THREADS: usize = 1;

/// Experiment mode; point-mutation runs treat wild-type indel classes as abnormal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MutationType {
    PointMutation,
    Other(String),
}

impl MutationType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "" => Err(PipelineError::Configuration("mutation_type is empty".into()).into()),
            "P" => Ok(MutationType::PointMutation),
            other => Ok(MutationType::Other(other.to_string())),
        }
    }

    pub fn is_point_mutation(&self) -> bool {
        matches!(self, MutationType::PointMutation)
    }
}

impl fmt::Display for MutationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationType::PointMutation => write!(f, "P"),
            MutationType::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Worker count for the neighbour search.
///
/// Missing, empty, non-numeric, zero and negative values all fall back to one
/// thread.
pub fn parse_thread_count(raw: Option<&str>) -> usize {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        warn!("thread_count not given; using {}", DEFAULT_THREADS);
        return DEFAULT_THREADS;
    };
    match raw.parse::<i64>() {
        Ok(n) if n > 0 => n as usize,
        Ok(n) => {
            warn!("thread_count {} is not positive; using {}", n, DEFAULT_THREADS);
            DEFAULT_THREADS
        }
        Err(_) => {
            warn!("thread_count {:?} is not an integer; using {}", raw, DEFAULT_THREADS);
            DEFAULT_THREADS
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AlphabetSpec {
    /// A fixed symbol list, shared by every encode call of the run.
    Fixed(String),
    /// Sorted union of symbols seen anywhere in the input table.
    Observed,
}

impl Default for AlphabetSpec {
    fn default() -> Self {
        AlphabetSpec::Fixed(MIDS_SYMBOLS.to_string())
    }
}

impl AlphabetSpec {
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("observed") {
            AlphabetSpec::Observed
        } else {
            AlphabetSpec::Fixed(raw.to_string())
        }
    }

    pub fn resolve<'a, I>(&self, seqs: I) -> Result<Alphabet>
    where
        I: IntoIterator<Item = &'a str>,
    {
        match self {
            AlphabetSpec::Fixed(symbols) => Alphabet::new(symbols),
            AlphabetSpec::Observed => Alphabet::observed(seqs, MIDS_SYMBOLS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EarlyStopping {
    /// Epochs without improvement tolerated before stopping.
    pub patience: usize,
    pub min_delta: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub validation_split: f64,
    pub learning_rate: f64,
    /// Scale of the L2 activity penalty on the embedding layer.
    pub activity_l2: f32,
    /// Off unless the caller opts in.
    pub early_stopping: Option<EarlyStopping>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 32,
            validation_split: 0.2,
            learning_rate: 1e-3,
            activity_l2: 0.1,
            early_stopping: None,
        }
    }
}

/// Numeric precision of the chunked real-read input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputPrecision {
    Half,
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceConfig {
    pub chunk_size: usize,
    /// Only applies to chunked classification of real reads.
    pub precision: InputPrecision,
    pub embed_batch_size: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            precision: InputPrecision::Half,
            embed_batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Contamination {
    /// Fixed score offset of -1.5.
    Auto,
    /// Expected outlier fraction of the training set, in (0, 0.5].
    Fraction(f64),
}

impl Contamination {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.eq_ignore_ascii_case("auto") {
            return Ok(Contamination::Auto);
        }
        match raw.parse::<f64>() {
            Ok(f) if f > 0.0 && f <= 0.5 => Ok(Contamination::Fraction(f)),
            _ => Err(PipelineError::Configuration(format!(
                "contamination must be 'auto' or a fraction in (0, 0.5], got {:?}",
                raw
            ))
            .into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoveltyConfig {
    pub n_neighbors: usize,
    pub contamination: Contamination,
    pub threads: usize,
}

impl Default for NoveltyConfig {
    fn default() -> Self {
        Self {
            n_neighbors: 20,
            contamination: Contamination::Auto,
            threads: DEFAULT_THREADS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub mutation_type: MutationType,
    pub alphabet: AlphabetSpec,
    pub test_fraction: f64,
    /// Seeds the train/held-out split and epoch shuffling; drawn at random when absent.
    pub seed: Option<u64>,
    pub evaluate_holdout: bool,
    pub training: TrainingConfig,
    pub inference: InferenceConfig,
    pub novelty: NoveltyConfig,
    pub model_path: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
}

impl RunConfig {
    /// Validates the mutation type before anything touches the filesystem.
    pub fn new(input_path: PathBuf, mutation_type: &str, threads: usize) -> Result<Self> {
        let mutation_type = MutationType::parse(mutation_type)?;
        Ok(Self {
            input_path,
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            mutation_type,
            alphabet: AlphabetSpec::default(),
            test_fraction: 0.2,
            seed: None,
            evaluate_holdout: false,
            training: TrainingConfig::default(),
            inference: InferenceConfig::default(),
            novelty: NoveltyConfig {
                threads: threads.max(1),
                ..NoveltyConfig::default()
            },
            model_path: None,
            summary_path: None,
        })
    }

    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, what: &str| -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(PipelineError::Configuration(what.to_string()).into())
            }
        };
        check(
            self.test_fraction > 0.0 && self.test_fraction < 1.0,
            "test fraction must be in (0, 1)",
        )?;
        check(
            (0.0..1.0).contains(&self.training.validation_split),
            "validation split must be in [0, 1)",
        )?;
        check(self.training.epochs > 0, "epochs must be positive")?;
        check(self.training.batch_size > 0, "batch size must be positive")?;
        check(self.inference.chunk_size > 0, "chunk size must be positive")?;
        check(
            self.inference.embed_batch_size > 0,
            "embedding batch size must be positive",
        )?;
        check(self.novelty.n_neighbors > 0, "n_neighbors must be positive")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_type() {
        assert!(MutationType::parse("P").unwrap().is_point_mutation());
        assert_eq!(
            MutationType::parse("S").unwrap(),
            MutationType::Other("S".into())
        );
        let err = MutationType::parse("").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_thread_count_fallback() {
        assert_eq!(parse_thread_count(Some("8")), 8);
        assert_eq!(parse_thread_count(None), 1);
        assert_eq!(parse_thread_count(Some("")), 1);
        assert_eq!(parse_thread_count(Some("0")), 1);
        assert_eq!(parse_thread_count(Some("-4")), 1);
        assert_eq!(parse_thread_count(Some("four")), 1);
    }

    #[test]
    fn test_contamination() {
        assert_eq!(Contamination::parse("auto").unwrap(), Contamination::Auto);
        assert_eq!(
            Contamination::parse("0.1").unwrap(),
            Contamination::Fraction(0.1)
        );
        assert!(Contamination::parse("0.9").is_err());
        assert!(Contamination::parse("lots").is_err());
    }

    #[test]
    fn test_defaults_match_reference_run() {
        let config = RunConfig::new(PathBuf::from("mids.txt"), "N", 0).unwrap();
        assert_eq!(config.novelty.threads, 1);
        assert_eq!(config.novelty.n_neighbors, 20);
        assert_eq!(config.training.epochs, 20);
        assert_eq!(config.training.batch_size, 32);
        assert!(config.training.early_stopping.is_none());
        assert_eq!(config.inference.chunk_size, 1000);
        assert_eq!(config.inference.precision, InputPrecision::Half);
        assert_eq!(config.output_path, PathBuf::from(DEFAULT_OUTPUT_PATH));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_observed_alphabet_includes_marker() {
        let alphabet = AlphabetSpec::parse("observed").resolve(["MMa"]).unwrap();
        assert_eq!(alphabet.symbols(), b"=DIMSa");
    }
}
