pub mod synthetic;

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DetectorError, Result};

/// In-memory rectangular table of numeric columns, as handed over by a dataset source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f32>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<f32>>) -> Self {
        Self { columns, rows }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Checks that every row is as wide as the header and holds only finite values.
    pub fn validate(&self) -> Result<()> {
        let width = self.columns.len();
        if width == 0 {
            return Err(DetectorError::invalid_schema("table has no columns"));
        }
        for (i, row) in self.rows.iter().enumerate() {
            if row.len() != width {
                return Err(DetectorError::invalid_schema(format!(
                    "row {i} has {} values, expected {width}",
                    row.len()
                )));
            }
            if let Some(col) = row.iter().position(|v| !v.is_finite()) {
                return Err(DetectorError::invalid_schema(format!(
                    "row {i} column '{}' is not finite",
                    self.columns[col]
                )));
            }
        }
        Ok(())
    }
}

/// Row-major `f32` matrix. All rows share `cols` features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl FeatureMatrix {
    pub fn from_flat(data: Vec<f32>, cols: usize) -> Result<Self> {
        if cols == 0 {
            return Err(DetectorError::invalid_schema("feature width must be > 0"));
        }
        if data.len() % cols != 0 {
            return Err(DetectorError::invalid_schema(format!(
                "buffer length {} is not divisible by feature width {cols}",
                data.len()
            )));
        }
        let rows = data.len() / cols;
        Ok(Self { data, rows, cols })
    }

    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows
            .first()
            .map(Vec::len)
            .ok_or_else(|| DetectorError::empty_dataset("no rows"))?;
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(DetectorError::invalid_schema(format!(
                    "row {i} has {} features, expected {cols}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Self::from_flat(data, cols)
    }

    /// A matrix with no rows but a known width.
    pub fn empty(cols: usize) -> Self {
        Self {
            data: Vec::new(),
            rows: 0,
            cols,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn row(&self, idx: usize) -> &[f32] {
        &self.data[idx * self.cols..(idx + 1) * self.cols]
    }

    pub fn row_mut(&mut self, idx: usize) -> &mut [f32] {
        &mut self.data[idx * self.cols..(idx + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.cols)
    }

    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Self {
            data,
            rows: indices.len(),
            cols: self.cols,
        }
    }

    /// Shuffles row order with `seed` and moves the last `fraction` of rows into a
    /// second matrix. Returns `(remaining, held_out)`.
    pub fn split_validation(&self, fraction: f32, seed: u64) -> (Self, Self) {
        let held_out = ((self.rows as f32) * fraction).floor() as usize;
        if held_out == 0 {
            return (self.clone(), Self::empty(self.cols));
        }
        let mut order: Vec<usize> = (0..self.rows).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let (keep, hold) = order.split_at(self.rows - held_out);
        (self.select_rows(keep), self.select_rows(hold))
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.data, (self.rows, self.cols), device)?)
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        (self.rows + batch_size - 1) / batch_size
    }
}
