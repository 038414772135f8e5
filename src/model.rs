use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module, VarBuilder, VarMap};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::data::FeatureMatrix;
use crate::error::{DetectorError, Result};

/// Rows scored per forward pass in [`AutoEncoder::score`].
const SCORE_CHUNK_ROWS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Tanh,
    Sigmoid,
    Linear,
}

impl Activation {
    fn apply(self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::Relu => x.relu(),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => candle_nn::ops::sigmoid(x),
            Activation::Linear => Ok(x.clone()),
        }
    }
}

/// How squared per-feature errors collapse into one score per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReduction {
    Mean,
    Sum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Encoder widths between the input and the latent layer, widest first.
    /// The decoder mirrors them.
    pub hidden_dims: Vec<usize>,
    pub latent_dim: usize,
    pub activation: Activation,
    pub output_activation: Activation,
    pub reduction: ErrorReduction,
    pub seed: u64,
    pub use_gpu: bool,
}

/// Hidden widths `[32, 16]` and latent width 8 suit inputs of at least 32
/// features (the ECG rows have 140). Use [`ModelConfig::sized_for`] for
/// narrower tables.
impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![32, 16],
            latent_dim: 8,
            activation: Activation::Relu,
            output_activation: Activation::Sigmoid,
            reduction: ErrorReduction::Mean,
            seed: 21,
            use_gpu: false,
        }
    }
}

impl ModelConfig {
    /// Default settings with widths derived from `input_dim`: latent width
    /// `input_dim / 4` clamped to `1..=8`, then up to two hidden layers halving
    /// from `input_dim / 2` while still wider than the latent layer.
    pub fn sized_for(input_dim: usize) -> Self {
        let latent_dim = (input_dim / 4).clamp(1, 8);
        let mut hidden_dims = Vec::new();
        let mut width = input_dim / 2;
        while width > latent_dim && hidden_dims.len() < 2 {
            hidden_dims.push(width);
            width /= 2;
        }
        Self {
            hidden_dims,
            latent_dim,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.latent_dim == 0 {
            return Err(DetectorError::invalid_config("latent_dim must be > 0"));
        }
        if self.hidden_dims.iter().any(|&w| w == 0) {
            return Err(DetectorError::invalid_config("hidden widths must be > 0"));
        }
        if self.hidden_dims.windows(2).any(|w| w[1] > w[0]) {
            return Err(DetectorError::invalid_config(format!(
                "hidden widths must narrow towards the latent layer, got {:?}",
                self.hidden_dims
            )));
        }
        if let Some(&last) = self.hidden_dims.last() {
            if last < self.latent_dim {
                return Err(DetectorError::invalid_config(format!(
                    "hidden width {last} is narrower than latent_dim {}",
                    self.latent_dim
                )));
            }
        }
        Ok(())
    }

    /// Checks the architecture against a concrete input width.
    pub fn validate_for(&self, input_dim: usize) -> Result<()> {
        self.validate()?;
        if self.latent_dim >= input_dim {
            return Err(DetectorError::invalid_config(format!(
                "latent_dim {} must be smaller than the input width {input_dim}",
                self.latent_dim
            )));
        }
        if let Some(&first) = self.hidden_dims.first() {
            if first > input_dim {
                return Err(DetectorError::invalid_config(format!(
                    "hidden width {first} exceeds the input width {input_dim}"
                )));
            }
        }
        Ok(())
    }

    /// `[input, hidden.., latent]`.
    fn encoder_widths(&self, input_dim: usize) -> Vec<usize> {
        let mut widths = Vec::with_capacity(self.hidden_dims.len() + 2);
        widths.push(input_dim);
        widths.extend_from_slice(&self.hidden_dims);
        widths.push(self.latent_dim);
        widths
    }

    fn device(&self) -> Result<Device> {
        if self.use_gpu {
            Ok(Device::cuda_if_available(0)?)
        } else {
            Ok(Device::Cpu)
        }
    }
}

/// Symmetric dense autoencoder. Weights live in a [`VarMap`] so the trainer can
/// hand them to a candle optimizer.
pub struct AutoEncoder {
    encoder: Vec<Linear>,
    decoder: Vec<Linear>,
    varmap: VarMap,
    config: ModelConfig,
    input_dim: usize,
    device: Device,
}

impl AutoEncoder {
    pub fn new(input_dim: usize, config: &ModelConfig) -> Result<Self> {
        config.validate_for(input_dim)?;
        let device = config.device()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let widths = config.encoder_widths(input_dim);
        let mut encoder = Vec::with_capacity(widths.len() - 1);
        for (i, w) in widths.windows(2).enumerate() {
            encoder.push(candle_nn::linear(w[0], w[1], vb.pp(format!("enc_fc{}", i + 1)))?);
        }

        let mirrored: Vec<usize> = widths.iter().rev().copied().collect();
        let mut decoder = Vec::with_capacity(mirrored.len() - 1);
        for (i, w) in mirrored.windows(2).enumerate() {
            decoder.push(candle_nn::linear(w[0], w[1], vb.pp(format!("dec_fc{}", i + 1)))?);
        }

        let model = Self {
            encoder,
            decoder,
            varmap,
            config: config.clone(),
            input_dim,
            device,
        };
        model.init_weights(config.seed)?;
        Ok(model)
    }

    /// Glorot-uniform weights and zero biases, drawn in weight-name order so the
    /// result only depends on `seed`.
    fn init_weights(&self, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        for (name, var) in self.named_vars()? {
            let dims = var.dims().to_vec();
            let count: usize = dims.iter().product();
            let values: Vec<f32> = if name.ends_with(".bias") {
                vec![0.0; count]
            } else {
                let (fan_out, fan_in) = (dims[0], dims[1]);
                let limit = (6.0 / (fan_in + fan_out) as f64).sqrt() as f32;
                (0..count).map(|_| rng.gen_range(-limit..limit)).collect()
            };
            var.set(&Tensor::from_vec(values, dims, &self.device)?)?;
        }
        Ok(())
    }

    fn named_vars(&self) -> Result<BTreeMap<String, Var>> {
        let data = self.varmap.data().lock().map_err(|e| {
            candle_core::Error::Msg(format!("weight store lock poisoned: {e}"))
        })?;
        Ok(data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let (_, cols) = x.dims2()?;
        if cols != self.input_dim {
            return Err(DetectorError::dimension_mismatch(
                "encode",
                self.input_dim,
                cols,
            ));
        }
        let mut x = x.clone();
        for layer in &self.encoder {
            x = self.config.activation.apply(&layer.forward(&x)?)?;
        }
        Ok(x)
    }

    pub fn decode(&self, z: &Tensor) -> Result<Tensor> {
        let (_, cols) = z.dims2()?;
        if cols != self.config.latent_dim {
            return Err(DetectorError::dimension_mismatch(
                "decode",
                self.config.latent_dim,
                cols,
            ));
        }
        let last = self.decoder.len() - 1;
        let mut x = z.clone();
        for (i, layer) in self.decoder.iter().enumerate() {
            let h = layer.forward(&x)?;
            x = if i == last {
                self.config.output_activation.apply(&h)?
            } else {
                self.config.activation.apply(&h)?
            };
        }
        Ok(x)
    }

    /// `decode(encode(x))`, kept on the autograd graph.
    pub fn reconstruct(&self, x: &Tensor) -> Result<Tensor> {
        let z = self.encode(x)?;
        self.decode(&z)
    }

    pub fn forward(&self, batch: &Tensor) -> Result<(Tensor, Vec<f32>)> {
        let x_hat = self.reconstruct(batch)?;
        let errors = reconstruction_errors(batch, &x_hat, self.config.reduction)?;
        Ok((x_hat, errors))
    }

    pub fn reconstruction_error(&self, batch: &Tensor) -> Result<Vec<f32>> {
        Ok(self.forward(batch)?.1)
    }

    /// Scores every row of `matrix`.
    pub fn score(&self, matrix: &FeatureMatrix) -> Result<Vec<f32>> {
        if matrix.cols() != self.input_dim {
            return Err(DetectorError::dimension_mismatch(
                "score",
                self.input_dim,
                matrix.cols(),
            ));
        }
        if matrix.is_empty() {
            return Ok(Vec::new());
        }
        let all = matrix.to_tensor(&self.device)?;
        let mut scores = Vec::with_capacity(matrix.rows());
        let mut start = 0;
        while start < matrix.rows() {
            let len = SCORE_CHUNK_ROWS.min(matrix.rows() - start);
            let chunk = all.narrow(0, start, len)?;
            let errors = per_row_errors(&chunk, &self.reconstruct(&chunk)?, self.config.reduction)?;
            DetectorError::check_finite(&errors, start)?;
            scores.extend(errors);
            start += len;
        }
        Ok(scores)
    }

    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn num_parameters(&self) -> usize {
        self.vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Deep copy of every weight tensor.
    pub fn snapshot(&self) -> Result<BTreeMap<String, Tensor>> {
        let mut out = BTreeMap::new();
        for (name, var) in self.named_vars()? {
            out.insert(name, var.as_tensor().copy()?);
        }
        Ok(out)
    }

    pub fn restore(&self, snapshot: &BTreeMap<String, Tensor>) -> Result<()> {
        let vars = self.named_vars()?;
        for (name, tensor) in snapshot {
            let var = vars.get(name).ok_or_else(|| {
                DetectorError::invalid_schema(format!("unknown weight '{name}'"))
            })?;
            var.set(tensor)?;
        }
        Ok(())
    }

    pub fn state(&self) -> Result<ModelState> {
        let mut weights = BTreeMap::new();
        for (name, var) in self.named_vars()? {
            weights.insert(
                name,
                WeightTensor {
                    shape: var.dims().to_vec(),
                    values: var.as_tensor().flatten_all()?.to_vec1::<f32>()?,
                },
            );
        }
        Ok(ModelState {
            input_dim: self.input_dim,
            config: self.config.clone(),
            weights,
        })
    }

    pub fn from_state(state: &ModelState) -> Result<Self> {
        let model = Self::new(state.input_dim, &state.config)?;
        let vars = model.named_vars()?;
        if vars.len() != state.weights.len() {
            return Err(DetectorError::invalid_schema(format!(
                "model state holds {} weight tensors, architecture needs {}",
                state.weights.len(),
                vars.len()
            )));
        }
        for (name, weight) in &state.weights {
            let var = vars.get(name).ok_or_else(|| {
                DetectorError::invalid_schema(format!("unknown weight '{name}'"))
            })?;
            let expected: usize = var.dims().iter().product();
            if weight.shape != var.dims() || weight.values.len() != expected {
                return Err(DetectorError::dimension_mismatch(
                    format!("weight '{name}'"),
                    expected,
                    weight.values.len(),
                ));
            }
            var.set(&Tensor::from_slice(
                &weight.values,
                weight.shape.as_slice(),
                &model.device,
            )?)?;
        }
        Ok(model)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.state()?)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_state(&serde_json::from_slice(bytes)?)
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Per-record reconstruction error between `input` and `reconstruction`.
/// Fails with `NonFiniteScore` rather than returning NaN or infinity.
pub fn reconstruction_errors(
    input: &Tensor,
    reconstruction: &Tensor,
    reduction: ErrorReduction,
) -> Result<Vec<f32>> {
    let errors = per_row_errors(input, reconstruction, reduction)?;
    DetectorError::check_finite(&errors, 0)?;
    Ok(errors)
}

fn per_row_errors(
    input: &Tensor,
    reconstruction: &Tensor,
    reduction: ErrorReduction,
) -> Result<Vec<f32>> {
    let (rows, cols) = input.dims2()?;
    let (r_rows, r_cols) = reconstruction.dims2()?;
    if rows != r_rows {
        return Err(DetectorError::dimension_mismatch(
            "reconstruction rows",
            rows,
            r_rows,
        ));
    }
    if cols != r_cols {
        return Err(DetectorError::dimension_mismatch(
            "reconstruction width",
            cols,
            r_cols,
        ));
    }
    let squared = (input - reconstruction)?.sqr()?;
    let per_row = match reduction {
        ErrorReduction::Mean => squared.mean(1)?,
        ErrorReduction::Sum => squared.sum(1)?,
    };
    Ok(per_row.to_vec1::<f32>()?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Architecture plus weights, enough to rebuild an identical [`AutoEncoder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub input_dim: usize,
    pub config: ModelConfig,
    pub weights: BTreeMap<String, WeightTensor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_config() -> ModelConfig {
        ModelConfig {
            hidden_dims: vec![4],
            latent_dim: 2,
            activation: Activation::Linear,
            output_activation: Activation::Linear,
            ..ModelConfig::default()
        }
    }

    fn batch(rows: &[Vec<f32>]) -> Tensor {
        FeatureMatrix::from_rows(rows)
            .unwrap()
            .to_tensor(&Device::Cpu)
            .unwrap()
    }

    #[test]
    fn layer_shapes_mirror() {
        let model = AutoEncoder::new(8, &linear_config()).unwrap();
        let state = model.state().unwrap();
        assert_eq!(state.weights["enc_fc1.weight"].shape, vec![4, 8]);
        assert_eq!(state.weights["enc_fc2.weight"].shape, vec![2, 4]);
        assert_eq!(state.weights["dec_fc1.weight"].shape, vec![4, 2]);
        assert_eq!(state.weights["dec_fc2.weight"].shape, vec![8, 4]);
        assert!(state.weights["dec_fc2.bias"].values.iter().all(|&b| b == 0.0));
        assert_eq!(model.num_parameters(), 8 * 4 + 4 + 4 * 2 + 2 + 2 * 4 + 4 + 4 * 8 + 8);
    }

    #[test]
    fn zero_vector_round_trips_through_linear_model() {
        let model = AutoEncoder::new(8, &linear_config()).unwrap();
        let x = batch(&[vec![0.0; 8]]);

        let z = model.encode(&x).unwrap();
        assert_eq!(z.dims2().unwrap(), (1, 2));
        let x_hat = model.decode(&z).unwrap();
        assert_eq!(x_hat.dims2().unwrap(), (1, 8));

        let errors = model.reconstruction_error(&x).unwrap();
        assert_eq!(errors, vec![0.0]);
    }

    #[test]
    fn errors_are_non_negative_and_zero_on_identity() {
        let x = batch(&[vec![0.1, -2.0, 3.5], vec![1.0, 1.0, 1.0]]);
        assert_eq!(
            reconstruction_errors(&x, &x, ErrorReduction::Mean).unwrap(),
            vec![0.0, 0.0]
        );

        let y = batch(&[vec![0.0, 0.0, 0.0], vec![2.0, 1.0, 1.0]]);
        let mean = reconstruction_errors(&x, &y, ErrorReduction::Mean).unwrap();
        let sum = reconstruction_errors(&x, &y, ErrorReduction::Sum).unwrap();
        assert!(mean.iter().all(|&e| e >= 0.0));
        assert!((sum[1] - 1.0).abs() < 1e-6);
        assert!((mean[1] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn extreme_finite_row_is_an_error_not_nan() {
        let config = ModelConfig {
            hidden_dims: vec![],
            latent_dim: 2,
            ..linear_config()
        };
        let model = AutoEncoder::new(4, &config).unwrap();
        let data = FeatureMatrix::from_rows(&[
            vec![0.1, 0.2, 0.3, 0.4],
            vec![3e38, -3e38, 3e38, -3e38],
        ])
        .unwrap();
        assert!(matches!(
            model.score(&data),
            Err(DetectorError::NonFiniteScore { row: 1, .. })
        ));
        assert!(matches!(
            model.reconstruction_error(&data.to_tensor(&Device::Cpu).unwrap()),
            Err(DetectorError::NonFiniteScore { row: 1, .. })
        ));
    }

    #[test]
    fn rejects_wrong_batch_width() {
        let model = AutoEncoder::new(8, &ModelConfig::default().with_small_dims()).unwrap();
        let x = batch(&[vec![0.5; 5]]);
        assert!(matches!(
            model.forward(&x),
            Err(DetectorError::DimensionMismatch { expected: 8, actual: 5, .. })
        ));
        let z = batch(&[vec![0.5; 3]]);
        assert!(matches!(
            model.decode(&z),
            Err(DetectorError::DimensionMismatch { expected: 2, actual: 3, .. })
        ));
    }

    #[test]
    fn same_seed_same_weights() {
        let a = AutoEncoder::new(8, &linear_config()).unwrap();
        let b = AutoEncoder::new(8, &linear_config()).unwrap();
        assert_eq!(a.state().unwrap(), b.state().unwrap());

        let other = ModelConfig {
            seed: 99,
            ..linear_config()
        };
        let c = AutoEncoder::new(8, &other).unwrap();
        assert_ne!(a.state().unwrap(), c.state().unwrap());
    }

    #[test]
    fn bytes_round_trip_preserves_scores() {
        let model = AutoEncoder::new(6, &ModelConfig::default().with_small_dims()).unwrap();
        let data = FeatureMatrix::from_rows(&[vec![0.2; 6], vec![0.9, 0.1, 0.4, 0.3, 0.8, 0.5]])
            .unwrap();
        let restored = AutoEncoder::from_bytes(&model.to_bytes().unwrap()).unwrap();
        assert_eq!(model.score(&data).unwrap(), restored.score(&data).unwrap());
    }

    #[test]
    fn snapshot_restore() {
        let model = AutoEncoder::new(8, &linear_config()).unwrap();
        let before = model.state().unwrap();
        let snap = model.snapshot().unwrap();
        for var in model.vars() {
            var.set(&var.as_tensor().ones_like().unwrap()).unwrap();
        }
        assert_ne!(model.state().unwrap(), before);
        model.restore(&snap).unwrap();
        assert_eq!(model.state().unwrap(), before);
    }

    #[test]
    fn config_validation() {
        let wide_latent = ModelConfig {
            hidden_dims: vec![],
            latent_dim: 8,
            ..ModelConfig::default()
        };
        assert!(matches!(
            AutoEncoder::new(8, &wide_latent),
            Err(DetectorError::InvalidConfig(_))
        ));

        let widening = ModelConfig {
            hidden_dims: vec![4, 6],
            latent_dim: 2,
            ..ModelConfig::default()
        };
        assert!(widening.validate().is_err());

        let too_wide = ModelConfig {
            hidden_dims: vec![16],
            latent_dim: 2,
            ..ModelConfig::default()
        };
        assert!(too_wide.validate().is_ok());
        assert!(too_wide.validate_for(8).is_err());
    }

    #[test]
    fn sized_for_fits_narrow_and_wide_inputs() {
        for input_dim in 2..200 {
            let config = ModelConfig::sized_for(input_dim);
            assert!(config.validate_for(input_dim).is_ok(), "input width {input_dim}");
        }
        assert_eq!(ModelConfig::sized_for(8).hidden_dims, vec![4]);
        assert_eq!(ModelConfig::sized_for(8).latent_dim, 2);
        assert_eq!(ModelConfig::sized_for(140).hidden_dims, vec![70, 35]);
        assert!(ModelConfig::default().validate_for(8).is_err());
    }

    impl ModelConfig {
        fn with_small_dims(self) -> Self {
            Self {
                hidden_dims: vec![4],
                latent_dim: 2,
                ..self
            }
        }
    }
}
