pub mod data;
pub mod error;
pub mod evaluation;
pub mod inference;
pub mod model;
pub mod pipeline;
pub mod preprocessing;
pub mod threshold;
pub mod training;

use serde::{Deserialize, Serialize};
use std::path::Path;

pub use error::{DetectorError, PipelineError, Result, Stage};
pub use inference::{AnomalyDetector, Detection, ModelBundle};
pub use pipeline::Pipeline;

use model::{Activation, ModelConfig};
use preprocessing::DataConfig;
use threshold::{ThresholdConfig, ThresholdPolicy};
use training::{LossFn, TrainingConfig};

/// Everything one detection session needs, loadable from a single JSON file.
/// Missing sections fall back to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub threshold: ThresholdConfig,
}

impl Config {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.model.validate()?;
        self.training.validate()?;
        self.threshold.policy.validate()?;
        if self.threshold.policy.requires_labels() && self.data.label_column.is_none() {
            return Err(DetectorError::invalid_config(
                "labeled_optimal threshold needs a label column",
            ));
        }
        Ok(())
    }

    /// Heartbeat waveforms: MAE loss, cutoff one standard deviation above the
    /// mean training error.
    pub fn ecg() -> Self {
        Self {
            data: DataConfig::ecg(),
            training: TrainingConfig {
                epochs: 20,
                batch_size: 512,
                loss_fn: LossFn::Mae,
                ..TrainingConfig::default()
            },
            threshold: ThresholdConfig {
                policy: ThresholdPolicy::MeanStd { k: 1.0 },
                ..ThresholdConfig::default()
            },
            ..Self::default()
        }
    }

    /// Card transactions are z-scored, so the output layer stays linear.
    pub fn credit_card() -> Self {
        Self {
            data: DataConfig::credit_card(),
            model: ModelConfig {
                hidden_dims: vec![16, 8],
                latent_dim: 4,
                activation: Activation::Tanh,
                output_activation: Activation::Linear,
                ..ModelConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"training": {"epochs": 3}, "model": {"latent_dim": 2}}"#)
                .unwrap();
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.batch_size, TrainingConfig::default().batch_size);
        assert_eq!(config.model.latent_dim, 2);
        assert_eq!(config.data, DataConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn patience_key_is_honoured() {
        let config: Config = serde_json::from_str(r#"{"training": {"patience": 2}}"#).unwrap();
        assert_eq!(config.training.early_stopping_patience, 2);
    }

    #[test]
    fn misspelt_keys_are_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{"training": {"patiense": 2}}"#).is_err());
        assert!(serde_json::from_str::<Config>(r#"{"modle": {}}"#).is_err());
        assert!(serde_json::from_str::<Config>(r#"{"data": {"split": 0.3}}"#).is_err());
    }

    #[test]
    fn presets_validate() {
        Config::ecg().validate().unwrap();
        Config::credit_card().validate().unwrap();
    }

    #[test]
    fn labeled_policy_without_labels_is_rejected() {
        let mut config = Config::default();
        config.data.label_column = None;
        config.threshold.policy = ThresholdPolicy::LabeledOptimal {
            metric: threshold::OptimizationMetric::F1,
            grid_points: None,
        };
        assert!(matches!(config.validate(), Err(DetectorError::InvalidConfig(_))));
    }
}
