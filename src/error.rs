//! Error types for the detection engine.
//!
//! Component functions return [`DetectorError`]. The [`Pipeline`](crate::pipeline::Pipeline)
//! wraps them in [`PipelineError`] so a caller always knows which stage failed.

use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DetectorError>;

#[derive(Debug, Error)]
pub enum DetectorError {
    /// Inconsistent feature width, non-finite values or malformed labels.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// No usable rows remain.
    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Training produced a NaN or infinite loss. Fatal for the run.
    #[error("training diverged at epoch {epoch}, batch {batch}: loss = {loss}")]
    DivergedTraining { epoch: usize, batch: usize, loss: f64 },

    /// A reconstruction error overflowed or became NaN, usually from extreme
    /// feature values.
    #[error("non-finite score at row {row}: {score}")]
    NonFiniteScore { row: usize, score: f32 },

    #[error("insufficient data: need at least {required} error samples, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DetectorError {
    pub fn invalid_schema(reason: impl Into<String>) -> Self {
        Self::InvalidSchema(reason.into())
    }

    pub fn empty_dataset(reason: impl Into<String>) -> Self {
        Self::EmptyDataset(reason.into())
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// `NonFiniteScore` for the first NaN or infinite entry of `scores`, whose
    /// row numbers start at `offset`.
    pub fn check_finite(scores: &[f32], offset: usize) -> Result<()> {
        match scores.iter().position(|s| !s.is_finite()) {
            Some(i) => Err(Self::NonFiniteScore {
                row: offset + i,
                score: scores[i],
            }),
            None => Ok(()),
        }
    }

    pub fn dimension_mismatch(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}

/// Pipeline phase in which an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configure,
    Prepare,
    Train,
    Score,
    Threshold,
    Evaluate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Configure => "configure",
            Stage::Prepare => "prepare",
            Stage::Train => "train",
            Stage::Score => "score",
            Stage::Threshold => "threshold",
            Stage::Evaluate => "evaluate",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: DetectorError,
}

impl PipelineError {
    pub fn new(stage: Stage, source: DetectorError) -> Self {
        Self { stage, source }
    }
}

/// Attaches a [`Stage`] to a component result.
pub(crate) trait AtStage<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, PipelineError>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, PipelineError> {
        self.map_err(|source| PipelineError::new(stage, source))
    }
}
