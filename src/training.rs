use candle_core::{Tensor, Var};
use candle_nn::{
    optim::{AdamW, ParamsAdamW},
    Optimizer, SGD,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, info, warn};

use crate::{
    data::FeatureMatrix,
    error::{DetectorError, Result},
    model::AutoEncoder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    AdamW,
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossFn {
    Mse,
    Mae,
}

impl LossFn {
    fn compute(self, reconstruction: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            LossFn::Mse => candle_nn::loss::mse(reconstruction, target),
            LossFn::Mae => (reconstruction - target)?.abs()?.mean_all(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub optimizer: OptimizerKind,
    pub loss_fn: LossFn,
    /// Epochs without validation improvement before stopping. 0 disables early stopping.
    #[serde(alias = "patience")]
    pub early_stopping_patience: usize,
    pub min_delta: f64,
    /// Fraction of the normal-only training rows held out for validation loss.
    pub validation_split: f32,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 64,
            learning_rate: 1e-3,
            weight_decay: 1e-5,
            optimizer: OptimizerKind::AdamW,
            loss_fn: LossFn::Mse,
            early_stopping_patience: 10,
            min_delta: 0.0,
            validation_split: 0.1,
            seed: 21,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(DetectorError::invalid_config("epochs must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(DetectorError::invalid_config("batch_size must be > 0"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(DetectorError::invalid_config(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_decay >= 0.0) || !(self.min_delta >= 0.0) {
            return Err(DetectorError::invalid_config(
                "weight_decay and min_delta must be non-negative",
            ));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(DetectorError::invalid_config(format!(
                "validation_split must be in [0, 1), got {}",
                self.validation_split
            )));
        }
        Ok(())
    }
}

/// Shared flag a driver can flip from another thread to stop training between epochs.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    EarlyStopped,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochLoss {
    /// 1-based.
    pub epoch: usize,
    pub train_loss: f64,
    pub validation_loss: f64,
    pub best_validation_loss: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    pub history: Vec<EpochLoss>,
}

impl TrainingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_epoch(&mut self, epoch: usize, train_loss: f64, validation_loss: f64, best: f64) {
        self.history.push(EpochLoss {
            epoch,
            train_loss,
            validation_loss,
            best_validation_loss: best,
        });
    }

    pub fn train_losses(&self) -> Vec<f64> {
        self.history.iter().map(|e| e.train_loss).collect()
    }

    pub fn validation_losses(&self) -> Vec<f64> {
        self.history.iter().map(|e| e.validation_loss).collect()
    }

    pub fn best_validation_losses(&self) -> Vec<f64> {
        self.history.iter().map(|e| e.best_validation_loss).collect()
    }
}

pub struct TrainingResult {
    /// Carries the best-validation weights, not necessarily the last epoch's.
    pub model: AutoEncoder,
    pub stats: TrainingStats,
    /// Number of epochs that ran to completion.
    pub stopped_epoch: usize,
    /// 1-based epoch whose weights were kept; 0 if no epoch completed.
    pub best_epoch: usize,
    pub best_validation_loss: f64,
    pub stop_reason: StopReason,
}

enum OptimizerState {
    AdamW(AdamW),
    Sgd(SGD),
}

impl OptimizerState {
    fn new(config: &TrainingConfig, vars: Vec<Var>) -> Result<Self> {
        Ok(match config.optimizer {
            OptimizerKind::AdamW => {
                let params = ParamsAdamW {
                    lr: config.learning_rate,
                    weight_decay: config.weight_decay,
                    ..Default::default()
                };
                OptimizerState::AdamW(AdamW::new(vars, params)?)
            }
            OptimizerKind::Sgd => OptimizerState::Sgd(SGD::new(vars, config.learning_rate)?),
        })
    }

    fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        match self {
            OptimizerState::AdamW(opt) => opt.backward_step(loss),
            OptimizerState::Sgd(opt) => opt.backward_step(loss),
        }
    }
}

pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Fits `model` on normal-only `train` rows, monitoring loss on `validation`.
    /// An empty `validation` matrix falls back to monitoring the training loss.
    pub fn fit(
        &self,
        model: AutoEncoder,
        train: &FeatureMatrix,
        validation: &FeatureMatrix,
        cancel: &CancellationToken,
    ) -> Result<TrainingResult> {
        self.fit_with_progress(model, train, validation, cancel, |_| {})
    }

    /// [`fit`](Self::fit), calling `on_epoch` after every completed epoch.
    pub fn fit_with_progress<F>(
        &self,
        model: AutoEncoder,
        train: &FeatureMatrix,
        validation: &FeatureMatrix,
        cancel: &CancellationToken,
        mut on_epoch: F,
    ) -> Result<TrainingResult>
    where
        F: FnMut(&EpochLoss),
    {
        if train.is_empty() {
            return Err(DetectorError::empty_dataset("no training rows"));
        }
        for m in [train, validation] {
            if m.cols() != model.input_dim() {
                return Err(DetectorError::dimension_mismatch(
                    "training data",
                    model.input_dim(),
                    m.cols(),
                ));
            }
        }

        let device = model.device().clone();
        let train_tensor = train.to_tensor(&device)?;
        let val_tensor = if validation.is_empty() {
            warn!("validation split is empty, early stopping will monitor the training loss");
            None
        } else {
            Some(validation.to_tensor(&device)?)
        };

        let mut optimizer = OptimizerState::new(&self.config, model.vars())?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut order: Vec<u32> = (0..train.rows() as u32).collect();

        let mut best_loss = f64::INFINITY;
        let mut best_epoch = 0;
        let mut best_weights = model.snapshot()?;
        let mut patience_counter = 0;
        let mut stats = TrainingStats::new();
        let mut stop_reason = StopReason::Completed;

        for epoch in 0..self.config.epochs {
            if cancel.is_cancelled() {
                info!("Training cancelled after {} epochs", epoch);
                stop_reason = StopReason::Cancelled;
                break;
            }

            order.shuffle(&mut rng);
            let train_loss = self.train_epoch(&model, &train_tensor, &order, &mut optimizer, epoch)?;
            let val_loss = match &val_tensor {
                Some(v) => self.validate(&model, v)?,
                None => train_loss,
            };
            if !val_loss.is_finite() {
                return Err(DetectorError::DivergedTraining {
                    epoch: epoch + 1,
                    batch: 0,
                    loss: val_loss,
                });
            }

            if val_loss < best_loss - self.config.min_delta {
                best_loss = val_loss;
                best_epoch = epoch + 1;
                best_weights = model.snapshot()?;
                patience_counter = 0;
            } else {
                patience_counter += 1;
            }

            stats.add_epoch(epoch + 1, train_loss, val_loss, best_loss);
            if let Some(last) = stats.history.last() {
                on_epoch(last);
            }

            info!(
                "Epoch {}/{}: Train Loss = {:.6}, Val Loss = {:.6}",
                epoch + 1,
                self.config.epochs,
                train_loss,
                val_loss
            );

            if self.config.early_stopping_patience > 0
                && patience_counter >= self.config.early_stopping_patience
            {
                info!("Early stopping triggered at epoch {}", epoch + 1);
                stop_reason = StopReason::EarlyStopped;
                break;
            }
        }

        model.restore(&best_weights)?;
        debug!(best_epoch, best_loss, "restored best weights");

        Ok(TrainingResult {
            model,
            stopped_epoch: stats.history.len(),
            stats,
            best_epoch,
            best_validation_loss: best_loss,
            stop_reason,
        })
    }

    fn train_epoch(
        &self,
        model: &AutoEncoder,
        train: &Tensor,
        order: &[u32],
        optimizer: &mut OptimizerState,
        epoch: usize,
    ) -> Result<f64> {
        let mut epoch_loss = 0.0;

        for (batch_idx, chunk) in order.chunks(self.config.batch_size).enumerate() {
            let idx = Tensor::from_slice(chunk, chunk.len(), train.device())?;
            let batch = train.index_select(&idx, 0)?;

            let reconstructed = model.reconstruct(&batch)?;
            let loss = self.config.loss_fn.compute(&reconstructed, &batch)?;
            let value = loss.to_scalar::<f32>()? as f64;
            if !value.is_finite() {
                return Err(DetectorError::DivergedTraining {
                    epoch: epoch + 1,
                    batch: batch_idx,
                    loss: value,
                });
            }

            optimizer.backward_step(&loss)?;
            epoch_loss += value * chunk.len() as f64;
        }

        Ok(epoch_loss / order.len() as f64)
    }

    fn validate(&self, model: &AutoEncoder, validation: &Tensor) -> Result<f64> {
        let reconstructed = model.reconstruct(validation)?;
        let loss = self.config.loss_fn.compute(&reconstructed, validation)?;
        Ok(loss.to_scalar::<f32>()? as f64)
    }
}

pub fn fit(
    model: AutoEncoder,
    train: &FeatureMatrix,
    validation: &FeatureMatrix,
    config: &TrainingConfig,
    cancel: &CancellationToken,
) -> Result<TrainingResult> {
    Trainer::new(config.clone())?.fit(model, train, validation, cancel)
}
