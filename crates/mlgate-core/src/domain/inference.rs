//! Inference payloads.
//!
//! Requests use the split orientation: column names plus row-major data.
//! The training job writes its held-out test set in exactly this shape, so
//! the file can be posted to `/invocations` unchanged.

use serde::{Deserialize, Serialize};

use crate::domain::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub columns: Vec<String>,
    pub data: Vec<Vec<f64>>,
}

impl InferenceRequest {
    /// Reject ragged rows and non-finite values.
    pub fn validate(&self, expected_features: usize) -> Result<(), PipelineError> {
        if self.columns.len() != expected_features {
            return Err(PipelineError::InvalidInput(format!(
                "expected {expected_features} columns, got {}",
                self.columns.len()
            )));
        }
        for (i, row) in self.data.iter().enumerate() {
            if row.len() != expected_features {
                return Err(PipelineError::InvalidInput(format!(
                    "row {i} has {} values, expected {expected_features}",
                    row.len()
                )));
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(PipelineError::InvalidInput(format!(
                    "row {i} contains a non-finite value"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    /// Positive-class probability per row, rounded to 4 decimals.
    pub predictions: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(rows: Vec<Vec<f64>>) -> InferenceRequest {
        InferenceRequest {
            columns: vec!["x0".into(), "x1".into()],
            data: rows,
        }
    }

    #[test]
    fn accepts_well_formed_rows() {
        assert!(request(vec![vec![0.1, 0.2], vec![1.0, -1.0]])
            .validate(2)
            .is_ok());
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = request(vec![vec![0.1]]).validate(2).unwrap_err();
        assert!(err.to_string().contains("row 0"));
    }

    #[test]
    fn rejects_nan() {
        assert!(request(vec![vec![f64::NAN, 0.0]]).validate(2).is_err());
    }

    #[test]
    fn rejects_column_mismatch() {
        assert!(request(vec![]).validate(3).is_err());
    }
}
