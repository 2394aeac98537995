//! Deterministic synthetic binary-classification data.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::domain::error::{PipelineError, Result};
use crate::domain::inference::InferenceRequest;

/// Feature matrix plus 0/1 labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<u8>,
}

impl Dataset {
    /// Two Gaussian blobs, one per class, with per-feature scales that
    /// differ by an order of magnitude so standardization matters.
    pub fn synthetic(samples: usize, features: usize, seed: u64) -> Result<Self> {
        if samples < 10 || features == 0 {
            return Err(PipelineError::InvalidInput(format!(
                "need at least 10 samples and 1 feature, got {samples}x{features}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let scales: Vec<f64> = (0..features).map(|j| 1.0 + j as f64 * 1.5).collect();

        let mut rows = Vec::with_capacity(samples);
        let mut labels = Vec::with_capacity(samples);
        for i in 0..samples {
            // Roughly 60/40, like most real-world binary targets.
            let label = u8::from(i % 5 < 3);
            let sign = if label == 1 { 1.0 } else { -1.0 };
            let row: Vec<f64> = scales
                .iter()
                .map(|scale| scale * (sign * 0.9 + standard_normal(&mut rng)))
                .collect();
            rows.push(row);
            labels.push(label);
        }

        let mut order: Vec<usize> = (0..samples).collect();
        order.shuffle(&mut rng);
        Ok(Self {
            columns: (0..features).map(|j| format!("feature_{j}")).collect(),
            rows: order.iter().map(|&i| rows[i].clone()).collect(),
            labels: order.iter().map(|&i| labels[i]).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 1).count()
    }

    /// Stratified split: each class contributes `test_fraction` of its rows
    /// to the second half. Returns `(train, test)`.
    pub fn stratified_split(&self, test_fraction: f64, seed: u64) -> Result<(Self, Self)> {
        if !(0.0..1.0).contains(&test_fraction) || test_fraction == 0.0 {
            return Err(PipelineError::InvalidInput(format!(
                "test fraction must be in (0, 1), got {test_fraction}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut train = self.empty_like();
        let mut test = self.empty_like();

        for class in [0u8, 1u8] {
            let mut idx: Vec<usize> = (0..self.len())
                .filter(|&i| self.labels[i] == class)
                .collect();
            idx.shuffle(&mut rng);
            let n_test = (idx.len() as f64 * test_fraction).round() as usize;
            for (k, &i) in idx.iter().enumerate() {
                let target = if k < n_test { &mut test } else { &mut train };
                target.rows.push(self.rows[i].clone());
                target.labels.push(class);
            }
        }

        if train.is_empty() || test.is_empty() {
            return Err(PipelineError::InvalidInput(
                "split left one side empty".to_string(),
            ));
        }
        Ok((train, test))
    }

    /// Features only, in the inference request layout.
    pub fn to_inference_request(&self) -> InferenceRequest {
        InferenceRequest {
            columns: self.columns.clone(),
            data: self.rows.clone(),
        }
    }

    fn empty_like(&self) -> Self {
        Self {
            columns: self.columns.clone(),
            rows: Vec::new(),
            labels: Vec::new(),
        }
    }
}

/// Box-Muller transform.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
