//! Explicit load -> train -> evaluate phases.
//!
//! Each phase object owns the session state produced so far, so independent
//! sessions never share a model or normalization parameters.

use tracing::info;

use crate::{
    data::Table,
    error::{AtStage, DetectorError, PipelineError, Stage},
    evaluation::{self, EvaluationReport},
    inference::AnomalyDetector,
    model::{AutoEncoder, ModelConfig},
    preprocessing::{self, PreparedData},
    threshold::{self, ErrorReference, ThresholdConfig},
    training::{CancellationToken, StopReason, Trainer, TrainingStats},
    Config,
};

type PipelineResult<T> = std::result::Result<T, PipelineError>;

pub struct Pipeline {
    config: Config,
}

impl Pipeline {
    pub fn new(config: Config) -> PipelineResult<Self> {
        config.validate().at(Stage::Configure)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn prepare(&self, table: &Table) -> PipelineResult<Prepared> {
        let data = preprocessing::prepare(table, &self.config.data).at(Stage::Prepare)?;
        Ok(Prepared {
            config: self.config.clone(),
            data,
        })
    }

    /// Every phase in order, with the configured threshold policy.
    pub fn run(&self, table: &Table, cancel: &CancellationToken) -> PipelineResult<Evaluated> {
        self.prepare(table)?.train(cancel)?.evaluate()
    }
}

pub struct Prepared {
    config: Config,
    data: PreparedData,
}

impl Prepared {
    pub fn data(&self) -> &PreparedData {
        &self.data
    }

    /// Replaces the model settings for this session, e.g. with
    /// [`ModelConfig::sized_for`] once the feature width is known. Checked when
    /// the model is built in [`train`](Self::train).
    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.config.model = model;
        self
    }

    pub fn train(self, cancel: &CancellationToken) -> PipelineResult<Trained> {
        let training = &self.config.training;
        let (train, validation) = self
            .data
            .train
            .split_validation(training.validation_split, training.seed);
        if train.is_empty() {
            return Err(PipelineError::new(
                Stage::Train,
                DetectorError::empty_dataset("validation split left no training rows"),
            ));
        }

        let model = AutoEncoder::new(self.data.feature_dim(), &self.config.model).at(Stage::Train)?;
        info!(
            parameters = model.num_parameters(),
            train = train.rows(),
            validation = validation.rows(),
            "Starting training"
        );
        let result = Trainer::new(training.clone())
            .and_then(|trainer| trainer.fit(model, &train, &validation, cancel))
            .at(Stage::Train)?;

        let training_errors = result.model.score(&self.data.train).at(Stage::Score)?;
        let evaluation_errors = result.model.score(&self.data.evaluation).at(Stage::Score)?;

        Ok(Trained {
            config: self.config,
            data: self.data,
            model: result.model,
            stats: result.stats,
            best_epoch: result.best_epoch,
            stop_reason: result.stop_reason,
            training_errors,
            evaluation_errors,
        })
    }
}

pub struct Trained {
    config: Config,
    data: PreparedData,
    model: AutoEncoder,
    stats: TrainingStats,
    best_epoch: usize,
    stop_reason: StopReason,
    training_errors: Vec<f32>,
    evaluation_errors: Vec<f32>,
}

impl Trained {
    pub fn model(&self) -> &AutoEncoder {
        &self.model
    }

    pub fn data(&self) -> &PreparedData {
        &self.data
    }

    pub fn stats(&self) -> &TrainingStats {
        &self.stats
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    /// Errors on the normal-only training rows.
    pub fn training_errors(&self) -> &[f32] {
        &self.training_errors
    }

    pub fn evaluation_errors(&self) -> &[f32] {
        &self.evaluation_errors
    }

    pub fn select_threshold(&self) -> PipelineResult<f32> {
        self.select_threshold_with(&self.config.threshold)
    }

    /// Labeled policies tune on the evaluation errors and labels; the others read
    /// the distribution named by `config.reference`.
    pub fn select_threshold_with(&self, config: &ThresholdConfig) -> PipelineResult<f32> {
        let result = if config.policy.requires_labels() {
            threshold::select_threshold(
                &self.evaluation_errors,
                self.data.evaluation_labels.as_deref(),
                &config.policy,
            )
        } else {
            let errors = match config.reference {
                ErrorReference::Training => &self.training_errors,
                ErrorReference::Evaluation => &self.evaluation_errors,
            };
            threshold::select_threshold(errors, None, &config.policy)
        };
        result.at(Stage::Threshold)
    }

    pub fn evaluate(self) -> PipelineResult<Evaluated> {
        let threshold = self.select_threshold()?;
        self.evaluate_at(threshold)
    }

    /// Without labels there is no report, only the flags.
    pub fn evaluate_at(self, threshold: f32) -> PipelineResult<Evaluated> {
        let report = match &self.data.evaluation_labels {
            Some(labels) => Some(
                evaluation::evaluate(&self.evaluation_errors, threshold, labels)
                    .at(Stage::Evaluate)?,
            ),
            None => None,
        };
        let flags: Vec<bool> = self
            .evaluation_errors
            .iter()
            .map(|&e| e >= threshold)
            .collect();

        match &report {
            Some(r) => info!(
                threshold,
                precision = r.precision,
                recall = r.recall,
                f1 = r.f1_score,
                auc_roc = r.auc_roc,
                "Evaluation finished"
            ),
            None => info!(
                threshold,
                flagged = flags.iter().filter(|&&f| f).count(),
                "Scored unlabeled evaluation rows"
            ),
        }

        Ok(Evaluated {
            trained: self,
            threshold,
            report,
            flags,
        })
    }
}

pub struct Evaluated {
    trained: Trained,
    threshold: f32,
    report: Option<EvaluationReport>,
    flags: Vec<bool>,
}

impl Evaluated {
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn report(&self) -> Option<&EvaluationReport> {
        self.report.as_ref()
    }

    /// One flag per evaluation row, `true` for anomalous.
    pub fn flags(&self) -> &[bool] {
        &self.flags
    }

    pub fn anomaly_count(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }

    pub fn trained(&self) -> &Trained {
        &self.trained
    }

    pub fn into_detector(self) -> PipelineResult<AnomalyDetector> {
        let norm = self.trained.data.norm;
        AnomalyDetector::new(self.trained.model, norm, self.threshold).at(Stage::Evaluate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::uniform_blobs;
    use crate::threshold::{OptimizationMetric, ThresholdPolicy};
    use crate::training::TrainingConfig;

    fn fast_config() -> Config {
        Config {
            model: ModelConfig {
                hidden_dims: vec![4],
                latent_dim: 2,
                ..ModelConfig::default()
            },
            training: TrainingConfig {
                epochs: 5,
                batch_size: 32,
                learning_rate: 1e-2,
                ..TrainingConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn phases_chain() {
        let table = uniform_blobs(200, 20, 6, 1);
        let pipeline = Pipeline::new(fast_config()).unwrap();
        let prepared = pipeline.prepare(&table).unwrap();
        assert_eq!(prepared.data().summary.train_rows, 160);

        let trained = prepared.train(&CancellationToken::new()).unwrap();
        assert_eq!(trained.training_errors().len(), 160);
        assert_eq!(trained.evaluation_errors().len(), 44);
        assert!(trained.evaluation_errors().iter().all(|&e| e >= 0.0));

        let evaluated = trained.evaluate().unwrap();
        assert_eq!(evaluated.flags().len(), 44);
        let report = evaluated.report().unwrap();
        assert_eq!(report.confusion.total(), 44);
    }

    #[test]
    fn labeled_policy_uses_evaluation_labels() {
        let table = uniform_blobs(100, 20, 6, 2);
        let config = Config {
            threshold: ThresholdConfig {
                policy: ThresholdPolicy::LabeledOptimal {
                    metric: OptimizationMetric::F1,
                    grid_points: None,
                },
                ..ThresholdConfig::default()
            },
            ..fast_config()
        };
        let evaluated = Pipeline::new(config)
            .unwrap()
            .run(&table, &CancellationToken::new())
            .unwrap();
        // anomalies sit far outside the normal range, so the tuned cutoff separates them
        assert_eq!(evaluated.report().unwrap().f1_score, 1.0);
    }

    #[test]
    fn unlabeled_run_has_flags_but_no_report() {
        let mut table = uniform_blobs(100, 0, 6, 3);
        table.columns.pop();
        for row in &mut table.rows {
            row.pop();
        }
        let mut config = fast_config();
        config.data.label_column = None;

        let evaluated = Pipeline::new(config)
            .unwrap()
            .run(&table, &CancellationToken::new())
            .unwrap();
        assert!(evaluated.report().is_none());
        assert_eq!(evaluated.flags().len(), 20);
    }

    #[test]
    fn errors_name_their_stage() {
        let mut bad = fast_config();
        bad.training.epochs = 0;
        let err = Pipeline::new(bad).err().unwrap();
        assert_eq!(err.stage, Stage::Configure);

        let pipeline = Pipeline::new(fast_config()).unwrap();
        let ragged = Table::new(vec!["a".into(), "label".into()], vec![vec![1.0]]);
        let err = pipeline.prepare(&ragged).err().unwrap();
        assert_eq!(err.stage, Stage::Prepare);
        assert!(matches!(err.source, DetectorError::InvalidSchema(_)));

        let mut labeled = fast_config();
        labeled.data.label_column = None;
        labeled.threshold.policy = ThresholdPolicy::LabeledOptimal {
            metric: OptimizationMetric::F1,
            grid_points: None,
        };
        let err = Pipeline::new(labeled).err().unwrap();
        assert_eq!(err.stage, Stage::Configure);

        let mut config = fast_config();
        config.data.label_column = None;
        let mut table = uniform_blobs(60, 0, 6, 4);
        table.columns.pop();
        for row in &mut table.rows {
            row.pop();
        }
        let trained = Pipeline::new(config)
            .unwrap()
            .prepare(&table)
            .unwrap()
            .train(&CancellationToken::new())
            .unwrap();
        let err = trained
            .select_threshold_with(&ThresholdConfig {
                policy: ThresholdPolicy::LabeledOptimal {
                    metric: OptimizationMetric::F1,
                    grid_points: None,
                },
                ..ThresholdConfig::default()
            })
            .unwrap_err();
        assert_eq!(err.stage, Stage::Threshold);
    }

    #[test]
    fn default_config_trains_on_narrow_table_once_sized() {
        let table = uniform_blobs(100, 10, 8, 7);
        let config = Config {
            training: fast_config().training,
            ..Config::default()
        };
        let prepared = Pipeline::new(config).unwrap().prepare(&table).unwrap();
        let dim = prepared.data().feature_dim();
        let trained = prepared
            .with_model(ModelConfig::sized_for(dim))
            .train(&CancellationToken::new())
            .unwrap();
        assert_eq!(trained.model().config().hidden_dims, vec![4]);
    }

    #[test]
    fn extreme_evaluation_rows_fail_at_scoring() {
        let mut table = uniform_blobs(200, 20, 6, 6);
        for row in table.rows.iter_mut().filter(|r| r[6] == 1.0) {
            for (j, v) in row[..6].iter_mut().enumerate() {
                *v = if j % 2 == 0 { 3e38 } else { -3e38 };
            }
        }
        let mut config = fast_config();
        config.model.activation = crate::model::Activation::Linear;
        config.model.output_activation = crate::model::Activation::Linear;

        let err = Pipeline::new(config)
            .unwrap()
            .run(&table, &CancellationToken::new())
            .err()
            .unwrap();
        assert_eq!(err.stage, Stage::Score);
        assert!(matches!(err.source, DetectorError::NonFiniteScore { .. }));
    }

    #[test]
    fn detector_from_session_scores_raw_rows() {
        let table = uniform_blobs(100, 10, 6, 5);
        let evaluated = Pipeline::new(fast_config())
            .unwrap()
            .run(&table, &CancellationToken::new())
            .unwrap();
        let detector = evaluated.into_detector().unwrap();
        let far = detector.detect(&[9.0; 6]).unwrap();
        assert!(far.is_anomaly);
    }
}
