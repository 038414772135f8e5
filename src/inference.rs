//! Scoring of raw, unnormalized records with a trained model.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{
    data::{FeatureMatrix, Table},
    error::{DetectorError, Result},
    model::{AutoEncoder, ModelState},
    preprocessing::NormParams,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub score: f32,
    pub is_anomaly: bool,
}

/// Serializable form of an [`AnomalyDetector`]. The core treats the bytes as
/// opaque; storing them is up to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub model: ModelState,
    pub norm: NormParams,
    pub threshold: f32,
}

impl ModelBundle {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

pub struct AnomalyDetector {
    model: AutoEncoder,
    norm: NormParams,
    threshold: f32,
}

impl AnomalyDetector {
    pub fn new(model: AutoEncoder, norm: NormParams, threshold: f32) -> Result<Self> {
        if norm.dim() != model.input_dim() {
            return Err(DetectorError::dimension_mismatch(
                "detector normalization",
                model.input_dim(),
                norm.dim(),
            ));
        }
        Ok(Self {
            model,
            norm,
            threshold,
        })
    }

    pub fn from_bundle(bundle: &ModelBundle) -> Result<Self> {
        let model = AutoEncoder::from_state(&bundle.model)?;
        Self::new(model, bundle.norm.clone(), bundle.threshold)
    }

    pub fn to_bundle(&self) -> Result<ModelBundle> {
        Ok(ModelBundle {
            model: self.model.state()?,
            norm: self.norm.clone(),
            threshold: self.threshold,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn model(&self) -> &AutoEncoder {
        &self.model
    }

    pub fn norm(&self) -> &NormParams {
        &self.norm
    }

    /// Normalizes and scores raw feature rows.
    pub fn score_rows(&self, rows: &[Vec<f32>]) -> Result<Vec<f32>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let raw = FeatureMatrix::from_rows(rows)?;
        self.model.score(&self.norm.apply(&raw)?)
    }

    pub fn detect(&self, row: &[f32]) -> Result<Detection> {
        let scores = self.score_rows(&[row.to_vec()])?;
        Ok(self.classify(scores[0]))
    }

    /// Picks the feature columns the detector was fit on out of `table`, by name.
    pub fn detect_table(&self, table: &Table) -> Result<Vec<Detection>> {
        table.validate()?;
        let idx = self
            .norm
            .features
            .iter()
            .map(|name| {
                table.column_index(name).ok_or_else(|| {
                    DetectorError::invalid_schema(format!("feature column '{name}' not found"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let rows: Vec<Vec<f32>> = table
            .rows
            .iter()
            .map(|row| idx.iter().map(|&j| row[j]).collect())
            .collect();
        Ok(self
            .score_rows(&rows)?
            .into_iter()
            .map(|score| self.classify(score))
            .collect())
    }

    fn classify(&self, score: f32) -> Detection {
        Detection {
            score,
            is_anomaly: score >= self.threshold,
        }
    }
}
