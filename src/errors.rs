use thiserror::Error;

/// Exit status for invalid command-line usage (sysexits `EX_USAGE`).
pub const EX_USAGE: i32 = 64;
/// Exit status for malformed input data (sysexits `EX_DATAERR`).
pub const EX_DATAERR: i32 = 65;

/// Failures the allele pipeline reports by kind.
///
/// Library functions return `anyhow::Result`; these variants are attached to
/// the error so callers can `downcast_ref::<PipelineError>()` on them.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("symbol {symbol:?} at position {position} of sequence {sequence} is not in the alphabet")]
    UnknownSymbol {
        sequence: usize,
        position: usize,
        symbol: char,
    },

    #[error("{0} partition is empty")]
    EmptyPartition(&'static str),

    #[error("{classes} classes exceed the prediction index capacity of {capacity}")]
    ClassCountOverflow { classes: usize, capacity: usize },

    #[error("novelty detector needs at least {needed} training embeddings, found {found}")]
    InsufficientTrainingData { needed: usize, found: usize },

    #[error("training diverged at epoch {epoch}: loss is {loss}")]
    TrainingDiverged { epoch: usize, loss: f32 },

    #[error("malformed input at record {record}: {reason}")]
    MalformedInput { record: usize, reason: String },
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Configuration(_) => EX_USAGE,
            PipelineError::MalformedInput { .. } | PipelineError::UnknownSymbol { .. } => {
                EX_DATAERR
            }
            _ => 1,
        }
    }
}

pub fn exit_with_error(err: &anyhow::Error) -> ! {
    eprintln!("Error: {:#}", err);
    let code = err
        .downcast_ref::<PipelineError>()
        .map_or(1, PipelineError::exit_code);
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            PipelineError::Configuration("mutation type is empty".into()).exit_code(),
            EX_USAGE
        );
        assert_eq!(
            PipelineError::MalformedInput {
                record: 3,
                reason: "missing column".into()
            }
            .exit_code(),
            EX_DATAERR
        );
        assert_eq!(PipelineError::EmptyPartition("real").exit_code(), 1);
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = PipelineError::ClassCountOverflow {
            classes: 300,
            capacity: 255,
        }
        .into();
        let err = err.context("splitting simulated reads");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ClassCountOverflow { classes: 300, .. })
        ));
    }
}
