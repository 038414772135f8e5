//! Dataset adapter: turns a raw [`Table`] into normalized training and evaluation
//! matrices.
//!
//! Normalization parameters are fit on the normal-only training subset and then
//! applied unchanged to the evaluation subset, so nothing about held-out or
//! anomalous rows leaks into the scaling statistics.

use rand::{rngs::StdRng, seq::index, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::{FeatureMatrix, Table};
use crate::error::{DetectorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationKind {
    /// Per-feature `(x - min) / (max - min)`.
    MinMax,
    /// One min and max over every scaled feature.
    GlobalMinMax,
    /// Per-feature `(x - mean) / std`.
    ZScore,
}

/// Which raw label value marks an anomalous row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelPolarity {
    AnomalyIsOne,
    NormalIsOne,
}

impl LabelPolarity {
    fn is_anomaly(self, raw: f32) -> bool {
        match self {
            LabelPolarity::AnomalyIsOne => raw == 1.0,
            LabelPolarity::NormalIsOne => raw == 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataConfig {
    pub label_column: Option<String>,
    pub split_ratio: f32,
    pub seed: u64,
    pub normalization: NormalizationKind,
    /// Columns to scale; `None` scales every feature column.
    pub scale_columns: Option<Vec<String>>,
    pub drop_columns: Vec<String>,
    pub label_polarity: LabelPolarity,
    /// Minimum anomaly-to-normal ratio after under-sampling normal rows.
    pub undersample_ratio: Option<f32>,
    pub balanced_evaluation: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            label_column: Some("label".to_string()),
            split_ratio: 0.2,
            seed: 21,
            normalization: NormalizationKind::MinMax,
            scale_columns: None,
            drop_columns: Vec::new(),
            label_polarity: LabelPolarity::AnomalyIsOne,
            undersample_ratio: None,
            balanced_evaluation: false,
        }
    }
}

impl DataConfig {
    /// Waveform rows with a trailing `label` column where 1 marks a normal beat.
    pub fn ecg() -> Self {
        Self {
            normalization: NormalizationKind::GlobalMinMax,
            label_polarity: LabelPolarity::NormalIsOne,
            ..Self::default()
        }
    }

    /// Card transactions: drop `Time`, standardize `Amount`, under-sample the
    /// legitimate class.
    pub fn credit_card() -> Self {
        Self {
            label_column: Some("Class".to_string()),
            normalization: NormalizationKind::ZScore,
            scale_columns: Some(vec!["Amount".to_string()]),
            drop_columns: vec!["Time".to_string()],
            undersample_ratio: Some(0.1),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.split_ratio > 0.0 && self.split_ratio < 1.0) {
            return Err(DetectorError::invalid_config(format!(
                "split_ratio must be in (0, 1), got {}",
                self.split_ratio
            )));
        }
        if let Some(ratio) = self.undersample_ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(DetectorError::invalid_config(format!(
                    "undersample_ratio must be in (0, 1], got {ratio}"
                )));
            }
        }
        Ok(())
    }
}

/// Per-feature affine scaling `x' = (x - offset) / scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormParams {
    pub kind: NormalizationKind,
    pub features: Vec<String>,
    pub offsets: Vec<f32>,
    pub scales: Vec<f32>,
}

impl NormParams {
    /// Fits parameters on `train`. Columns with `scaled[j] == false` get the
    /// identity transform; constant columns get `scale = 1`.
    pub fn fit(
        kind: NormalizationKind,
        train: &FeatureMatrix,
        features: Vec<String>,
        scaled: &[bool],
    ) -> Result<Self> {
        let cols = train.cols();
        if features.len() != cols || scaled.len() != cols {
            return Err(DetectorError::dimension_mismatch(
                "normalization fit",
                cols,
                features.len().min(scaled.len()),
            ));
        }
        if train.is_empty() {
            return Err(DetectorError::empty_dataset(
                "cannot fit normalization on zero rows",
            ));
        }

        let mut offsets = vec![0.0f32; cols];
        let mut scales = vec![1.0f32; cols];

        match kind {
            NormalizationKind::MinMax => {
                for j in (0..cols).filter(|&j| scaled[j]) {
                    let (min, max) = column_min_max(train, j);
                    offsets[j] = min;
                    scales[j] = non_zero(max - min);
                }
            }
            NormalizationKind::GlobalMinMax => {
                let mut min = f32::INFINITY;
                let mut max = f32::NEG_INFINITY;
                for j in (0..cols).filter(|&j| scaled[j]) {
                    let (lo, hi) = column_min_max(train, j);
                    min = min.min(lo);
                    max = max.max(hi);
                }
                for j in (0..cols).filter(|&j| scaled[j]) {
                    offsets[j] = min;
                    scales[j] = non_zero(max - min);
                }
            }
            NormalizationKind::ZScore => {
                let n = train.rows() as f64;
                for j in (0..cols).filter(|&j| scaled[j]) {
                    let mean = train.iter_rows().map(|r| r[j] as f64).sum::<f64>() / n;
                    let var = train
                        .iter_rows()
                        .map(|r| (r[j] as f64 - mean).powi(2))
                        .sum::<f64>()
                        / n;
                    offsets[j] = mean as f32;
                    scales[j] = non_zero(var.sqrt() as f32);
                }
            }
        }

        Ok(Self {
            kind,
            features,
            offsets,
            scales,
        })
    }

    pub fn dim(&self) -> usize {
        self.offsets.len()
    }

    pub fn apply(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix> {
        if matrix.cols() != self.dim() {
            return Err(DetectorError::dimension_mismatch(
                "normalization apply",
                self.dim(),
                matrix.cols(),
            ));
        }
        let mut out = matrix.clone();
        for i in 0..out.rows() {
            self.scale_in_place(out.row_mut(i));
        }
        Ok(out)
    }

    pub fn transform_row(&self, row: &[f32]) -> Result<Vec<f32>> {
        if row.len() != self.dim() {
            return Err(DetectorError::dimension_mismatch(
                "normalization apply",
                self.dim(),
                row.len(),
            ));
        }
        let mut out = row.to_vec();
        self.scale_in_place(&mut out);
        Ok(out)
    }

    fn scale_in_place(&self, row: &mut [f32]) {
        for ((v, offset), scale) in row.iter_mut().zip(&self.offsets).zip(&self.scales) {
            *v = (*v - offset) / scale;
        }
    }
}

fn column_min_max(matrix: &FeatureMatrix, j: usize) -> (f32, f32) {
    matrix
        .iter_rows()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), r| {
            (lo.min(r[j]), hi.max(r[j]))
        })
}

fn non_zero(scale: f32) -> f32 {
    if scale.abs() < 1e-12 {
        1.0
    } else {
        scale
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitSummary {
    pub total_rows: usize,
    pub undersampled_away: usize,
    pub train_rows: usize,
    pub evaluation_rows: usize,
    pub evaluation_anomalies: usize,
    /// Anomalous rows outside the evaluation split. Never trained on.
    pub unused_anomalies: usize,
}

#[derive(Debug, Clone)]
pub struct PreparedData {
    pub train: FeatureMatrix,
    pub evaluation: FeatureMatrix,
    /// `true` marks an anomalous row. `None` when the table is unlabeled.
    pub evaluation_labels: Option<Vec<bool>>,
    pub norm: NormParams,
    pub summary: SplitSummary,
}

impl PreparedData {
    pub fn feature_dim(&self) -> usize {
        self.train.cols()
    }
}

pub fn prepare(table: &Table, config: &DataConfig) -> Result<PreparedData> {
    config.validate()?;
    if table.is_empty() {
        return Err(DetectorError::empty_dataset("table has no rows"));
    }
    table.validate()?;

    let label_idx = match &config.label_column {
        Some(name) => Some(table.column_index(name).ok_or_else(|| {
            DetectorError::invalid_schema(format!("label column '{name}' not found"))
        })?),
        None => None,
    };

    for name in &config.drop_columns {
        if table.column_index(name).is_none() {
            return Err(DetectorError::invalid_schema(format!(
                "drop column '{name}' not found"
            )));
        }
    }

    let feature_idx: Vec<usize> = (0..table.columns.len())
        .filter(|&j| Some(j) != label_idx && !config.drop_columns.contains(&table.columns[j]))
        .collect();
    if feature_idx.is_empty() {
        return Err(DetectorError::invalid_schema("no feature columns remain"));
    }
    let feature_names: Vec<String> = feature_idx
        .iter()
        .map(|&j| table.columns[j].clone())
        .collect();

    let scaled: Vec<bool> = match &config.scale_columns {
        Some(names) => {
            for name in names {
                if !feature_names.contains(name) {
                    return Err(DetectorError::invalid_schema(format!(
                        "scale column '{name}' is not a feature column"
                    )));
                }
            }
            feature_names.iter().map(|f| names.contains(f)).collect()
        }
        None => vec![true; feature_names.len()],
    };

    let labels = match label_idx {
        Some(li) => {
            let mut labels = Vec::with_capacity(table.len());
            for (i, row) in table.rows.iter().enumerate() {
                let raw = row[li];
                if raw != 0.0 && raw != 1.0 {
                    return Err(DetectorError::invalid_schema(format!(
                        "row {i} label is {raw}, expected 0 or 1"
                    )));
                }
                labels.push(config.label_polarity.is_anomaly(raw));
            }
            Some(labels)
        }
        None => None,
    };

    let features: Vec<Vec<f32>> = table
        .rows
        .iter()
        .map(|row| feature_idx.iter().map(|&j| row[j]).collect())
        .collect();
    let features = FeatureMatrix::from_rows(&features)?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut summary = SplitSummary {
        total_rows: table.len(),
        ..SplitSummary::default()
    };

    let (train_idx, eval_idx) = match &labels {
        Some(labels) => {
            let mut normal: Vec<usize> = (0..labels.len()).filter(|&i| !labels[i]).collect();
            let anomalous: Vec<usize> = (0..labels.len()).filter(|&i| labels[i]).collect();

            if config.undersample_ratio.is_some() && anomalous.is_empty() {
                warn!("no anomalous rows, skipping under-sampling of normal rows");
            } else if let Some(ratio) = config.undersample_ratio {
                let target = ((anomalous.len() as f32) / ratio).ceil() as usize;
                if normal.len() > target {
                    summary.undersampled_away = normal.len() - target;
                    normal = subsample(&normal, target, &mut rng);
                    debug!(kept = target, dropped = summary.undersampled_away, "under-sampled normal rows");
                }
            }

            let (normal_train, mut normal_eval) = holdout(&normal, config.split_ratio, &mut rng);
            let (anomaly_rest, mut anomaly_eval) =
                holdout(&anomalous, config.split_ratio, &mut rng);

            if config.balanced_evaluation {
                let n = normal_eval.len().min(anomaly_eval.len());
                if n == 0 {
                    warn!("balanced evaluation requested but one class is absent from the evaluation split");
                } else {
                    normal_eval = subsample(&normal_eval, n, &mut rng);
                    anomaly_eval = subsample(&anomaly_eval, n, &mut rng);
                }
            }

            summary.unused_anomalies = anomaly_rest.len();
            summary.evaluation_anomalies = anomaly_eval.len();

            let mut eval_idx = normal_eval;
            eval_idx.extend(anomaly_eval);
            eval_idx.sort_unstable();
            (normal_train, eval_idx)
        }
        None => {
            let all: Vec<usize> = (0..features.rows()).collect();
            holdout(&all, config.split_ratio, &mut rng)
        }
    };

    if train_idx.is_empty() {
        return Err(DetectorError::empty_dataset(
            "no normal rows left for training after the split",
        ));
    }

    let raw_train = features.select_rows(&train_idx);
    let raw_eval = features.select_rows(&eval_idx);

    let norm = NormParams::fit(config.normalization, &raw_train, feature_names, &scaled)?;
    let train = norm.apply(&raw_train)?;
    let evaluation = norm.apply(&raw_eval)?;
    let evaluation_labels = labels.map(|l| eval_idx.iter().map(|&i| l[i]).collect::<Vec<_>>());

    summary.train_rows = train.rows();
    summary.evaluation_rows = evaluation.rows();

    info!(
        train = summary.train_rows,
        evaluation = summary.evaluation_rows,
        evaluation_anomalies = summary.evaluation_anomalies,
        features = train.cols(),
        "prepared dataset"
    );

    Ok(PreparedData {
        train,
        evaluation,
        evaluation_labels,
        norm,
        summary,
    })
}

/// Shuffles `indices` and splits off `ratio` of them. Both halves come back sorted.
fn holdout(indices: &[usize], ratio: f32, rng: &mut StdRng) -> (Vec<usize>, Vec<usize>) {
    let mut shuffled = indices.to_vec();
    shuffled.shuffle(rng);
    let held = ((indices.len() as f32) * ratio).round() as usize;
    let mut rest = shuffled.split_off(held);
    let mut held_out = shuffled;
    rest.sort_unstable();
    held_out.sort_unstable();
    (rest, held_out)
}

fn subsample(indices: &[usize], amount: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut picked: Vec<usize> = index::sample(rng, indices.len(), amount)
        .into_iter()
        .map(|i| indices[i])
        .collect();
    picked.sort_unstable();
    picked
}
