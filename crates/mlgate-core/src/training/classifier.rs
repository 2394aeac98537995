//! Standardized logistic regression, the model the training job ships.
//!
//! The serialized form is the artifact stored in the registry and loaded by
//! the serving process.

use serde::{Deserialize, Serialize};

use crate::domain::error::{PipelineError, Result};
use crate::training::dataset::Dataset;

/// Format tag written into every serialized model.
pub const MODEL_FORMAT: &str = "mlgate.logistic.v1";

/// Gradient-descent settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    pub epochs: usize,
    pub learning_rate: f64,
    pub l2: f64,
    /// Weight classes inversely to their frequency.
    pub balanced: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 400,
            learning_rate: 0.2,
            l2: 1e-3,
            balanced: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticClassifier {
    format: String,
    columns: Vec<String>,
    means: Vec<f64>,
    stds: Vec<f64>,
    weights: Vec<f64>,
    bias: f64,
}

impl LogisticClassifier {
    pub fn fit(data: &Dataset, options: FitOptions) -> Result<Self> {
        if data.is_empty() {
            return Err(PipelineError::InvalidInput(
                "cannot fit on an empty dataset".to_string(),
            ));
        }
        let n = data.len() as f64;
        let d = data.columns.len();

        let means: Vec<f64> = (0..d)
            .map(|j| data.rows.iter().map(|r| r[j]).sum::<f64>() / n)
            .collect();
        let stds: Vec<f64> = (0..d)
            .map(|j| {
                let var = data.rows.iter().map(|r| (r[j] - means[j]).powi(2)).sum::<f64>() / n;
                if var > f64::EPSILON {
                    var.sqrt()
                } else {
                    1.0
                }
            })
            .collect();

        let positives = data.positives() as f64;
        let negatives = n - positives;
        let class_weight = |label: u8| -> f64 {
            if !options.balanced || positives == 0.0 || negatives == 0.0 {
                return 1.0;
            }
            let count = if label == 1 { positives } else { negatives };
            n / (2.0 * count)
        };

        let mut model = Self {
            format: MODEL_FORMAT.to_string(),
            columns: data.columns.clone(),
            means,
            stds,
            weights: vec![0.0; d],
            bias: 0.0,
        };
        let scaled: Vec<Vec<f64>> = data.rows.iter().map(|r| model.standardize(r)).collect();

        for _ in 0..options.epochs {
            let mut grad_w = vec![0.0; d];
            let mut grad_b = 0.0;
            for (x, &label) in scaled.iter().zip(&data.labels) {
                let err = (sigmoid(model.logit(x)) - f64::from(label)) * class_weight(label);
                for (g, xj) in grad_w.iter_mut().zip(x) {
                    *g += err * xj;
                }
                grad_b += err;
            }
            for (w, g) in model.weights.iter_mut().zip(&grad_w) {
                *w -= options.learning_rate * (g / n + options.l2 * *w);
            }
            model.bias -= options.learning_rate * grad_b / n;
        }
        Ok(model)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn feature_count(&self) -> usize {
        self.columns.len()
    }

    /// Positive-class probability per row.
    pub fn predict_proba(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        rows.iter()
            .map(|r| sigmoid(self.logit(&self.standardize(r))))
            .collect()
    }

    /// Probabilities rounded to 4 decimals, as served by `/invocations`.
    pub fn predict(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        self.predict_proba(rows)
            .into_iter()
            .map(|p| (p * 10_000.0).round() / 10_000.0)
            .collect()
    }

    /// Fraction of rows classified correctly at a 0.5 threshold.
    pub fn score(&self, data: &Dataset) -> f64 {
        if data.is_empty() {
            return 0.0;
        }
        let correct = self
            .predict_proba(&data.rows)
            .iter()
            .zip(&data.labels)
            .filter(|(p, label)| u8::from(**p >= 0.5) == **label)
            .count();
        correct as f64 / data.len() as f64
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| PipelineError::Internal(format!("serializing model: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let model: Self = serde_json::from_slice(bytes)
            .map_err(|e| PipelineError::Fatal(format!("artifact is not a model: {e}")))?;
        if model.format != MODEL_FORMAT {
            return Err(PipelineError::Fatal(format!(
                "unsupported model format '{}'",
                model.format
            )));
        }
        let d = model.columns.len();
        if model.means.len() != d || model.stds.len() != d || model.weights.len() != d {
            return Err(PipelineError::Fatal(
                "model parameters do not match its columns".to_string(),
            ));
        }
        Ok(model)
    }

    fn standardize(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(x, (m, s))| (x - m) / s)
            .collect()
    }

    fn logit(&self, scaled: &[f64]) -> f64 {
        self.bias
            + self
                .weights
                .iter()
                .zip(scaled)
                .map(|(w, x)| w * x)
                .sum::<f64>()
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fitted() -> (LogisticClassifier, Dataset) {
        let data = Dataset::synthetic(400, 5, 42).unwrap();
        let (train, test) = data.stratified_split(0.25, 123).unwrap();
        (
            LogisticClassifier::fit(&train, FitOptions::default()).unwrap(),
            test,
        )
    }

    #[test]
    fn separates_synthetic_classes() {
        let (model, test) = fitted();
        assert!(model.score(&test) > 0.85, "accuracy {}", model.score(&test));
    }

    #[test]
    fn predictions_are_rounded_probabilities() {
        let (model, test) = fitted();
        for p in model.predict(&test.rows) {
            assert!((0.0..=1.0).contains(&p));
            assert_eq!(p, (p * 10_000.0).round() / 10_000.0);
        }
    }

    #[test]
    fn serialized_model_predicts_identically() {
        let (model, test) = fitted();
        let loaded = LogisticClassifier::from_bytes(&model.to_bytes().unwrap()).unwrap();
        for (a, b) in loaded
            .predict_proba(&test.rows)
            .iter()
            .zip(model.predict_proba(&test.rows))
        {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn foreign_bytes_are_rejected() {
        assert!(LogisticClassifier::from_bytes(b"not json").is_err());
        let other = br#"{"format":"other","columns":[],"means":[],"stds":[],"weights":[],"bias":0.0}"#;
        assert!(LogisticClassifier::from_bytes(other).is_err());
    }
}
