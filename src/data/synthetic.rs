//! Seeded synthetic tables for demos and tests.
//!
//! Both generators append a `label` column (0 = normal, 1 = anomalous).

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::f32::consts::PI;

use super::Table;

pub const LABEL_COLUMN: &str = "label";

/// Normal rows uniform in `[0, 1]`, anomalous rows uniform in `[5, 10]`.
pub fn uniform_blobs(normal: usize, anomalous: usize, dim: usize, seed: u64) -> Table {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rows = Vec::with_capacity(normal + anomalous);

    for _ in 0..normal {
        let mut row: Vec<f32> = (0..dim).map(|_| rng.gen_range(0.0..1.0)).collect();
        row.push(0.0);
        rows.push(row);
    }
    for _ in 0..anomalous {
        let mut row: Vec<f32> = (0..dim).map(|_| rng.gen_range(5.0..10.0)).collect();
        row.push(1.0);
        rows.push(row);
    }

    Table::new(feature_columns(dim), rows)
}

/// One period of a sine wave per row with small jitter. Anomalous rows get a
/// flattened segment and a spike, similar to an irregular heartbeat.
pub fn periodic_waveform(normal: usize, anomalous: usize, length: usize, seed: u64) -> Table {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rows = Vec::with_capacity(normal + anomalous);

    for i in 0..normal + anomalous {
        let phase = rng.gen_range(-0.1..0.1);
        let amplitude = rng.gen_range(0.9..1.1);
        let mut row: Vec<f32> = (0..length)
            .map(|t| {
                let x = 2.0 * PI * t as f32 / length as f32 + phase;
                amplitude * x.sin() + rng.gen_range(-0.05..0.05)
            })
            .collect();

        let is_anomaly = i >= normal;
        if is_anomaly && length > 0 {
            let start = rng.gen_range(0..(length / 2).max(1));
            let end = (start + (length / 4).max(1)).min(length);
            for v in &mut row[start..end] {
                *v = 0.0;
            }
            let spike = rng.gen_range(0..length);
            row[spike] += 3.0;
        }

        row.push(if is_anomaly { 1.0 } else { 0.0 });
        rows.push(row);
    }

    Table::new(feature_columns(length), rows)
}

fn feature_columns(dim: usize) -> Vec<String> {
    let mut columns: Vec<String> = (0..dim).map(|i| format!("f{i}")).collect();
    columns.push(LABEL_COLUMN.to_string());
    columns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blobs_have_expected_shape_and_ranges() {
        let table = uniform_blobs(10, 3, 4, 1);
        assert_eq!(table.columns.len(), 5);
        assert_eq!(table.len(), 13);
        table.validate().unwrap();

        for row in &table.rows[..10] {
            assert!(row[..4].iter().all(|v| (0.0..1.0).contains(v)));
            assert_eq!(row[4], 0.0);
        }
        for row in &table.rows[10..] {
            assert!(row[..4].iter().all(|v| (5.0..10.0).contains(v)));
            assert_eq!(row[4], 1.0);
        }
    }

    #[test]
    fn generators_are_seeded() {
        assert_eq!(uniform_blobs(5, 1, 3, 9), uniform_blobs(5, 1, 3, 9));
        assert_eq!(
            periodic_waveform(4, 2, 16, 9),
            periodic_waveform(4, 2, 16, 9)
        );
    }

    #[test]
    fn waveform_labels_anomalies_last() {
        let table = periodic_waveform(6, 2, 32, 3);
        let labels: Vec<f32> = table.rows.iter().map(|r| r[32]).collect();
        assert_eq!(labels, vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
    }
}
