use std::collections::HashMap;
use std::path::Path;

use super::EvaluationError;

pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Path → weight table for one form type.
///
/// Lookup tries the full dotted path first, then the final segment (field
/// name), so a table keyed by field names works whatever the section names
/// turned out to be. Unlisted paths weigh `DEFAULT_WEIGHT`.
#[derive(Debug, Clone, Default)]
pub struct WeightTable {
    weights: HashMap<String, f64>,
}

impl WeightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weight(mut self, path: &str, weight: f64) -> Self {
        self.weights.insert(path.to_string(), weight);
        self
    }

    /// Parse a flat `{"path": weight}` JSON object.
    pub fn from_json_str(json: &str) -> Result<Self, EvaluationError> {
        let weights: HashMap<String, f64> =
            serde_json::from_str(json).map_err(|e| EvaluationError::Parse(e.to_string()))?;
        for (path, weight) in &weights {
            if !(weight.is_finite() && *weight > 0.0) {
                return Err(EvaluationError::InvalidWeight {
                    path: path.clone(),
                    weight: *weight,
                });
            }
        }
        Ok(Self { weights })
    }

    pub fn load(path: &Path) -> Result<Self, EvaluationError> {
        let raw = std::fs::read_to_string(path).map_err(|e| EvaluationError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn weight_for(&self, path: &str) -> f64 {
        if let Some(w) = self.weights.get(path) {
            return *w;
        }
        path.rsplit('.')
            .next()
            .and_then(|field| self.weights.get(field))
            .copied()
            .unwrap_or(DEFAULT_WEIGHT)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlisted_paths_default_to_one() {
        let table = WeightTable::new();
        assert_eq!(table.weight_for("history.smoker"), DEFAULT_WEIGHT);
    }

    #[test]
    fn exact_path_beats_field_name() {
        let table = WeightTable::from_json_str(
            r#"{"allergies": 3.0, "history.allergies": 5.0}"#,
        )
        .unwrap();
        assert_eq!(table.weight_for("history.allergies"), 5.0);
        assert_eq!(table.weight_for("intake.allergies"), 3.0);
        assert_eq!(table.weight_for("intake.phone"), 1.0);
    }

    #[test]
    fn non_positive_weight_rejected() {
        let err = WeightTable::from_json_str(r#"{"a": 0}"#).unwrap_err();
        assert!(matches!(err, EvaluationError::InvalidWeight { .. }));
        assert!(WeightTable::from_json_str(r#"{"a": -2.5}"#).is_err());
    }

    #[test]
    fn malformed_json_rejected() {
        let err = WeightTable::from_json_str("[1, 2]").unwrap_err();
        assert!(matches!(err, EvaluationError::Parse(_)));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        std::fs::write(&path, r#"{"medications.current": 3}"#).unwrap();
        let table = WeightTable::load(&path).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.weight_for("medications.current"), 3.0);
    }
}
