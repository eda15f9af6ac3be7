use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::flatten::flatten_paths;
use super::weights::WeightTable;
use crate::pipeline::llm::{parse_score, sanitize_for_prompt, sanitize_transcript, LlmClient};

/// Overall scores below this recommend human review.
pub const REVIEW_THRESHOLD: f64 = 75.0;

/// Score used when the model's answer has no readable number.
pub const DEFAULT_SCORE: u32 = 50;

pub const MIN_SCORE: u32 = 1;
pub const MAX_SCORE: u32 = 100;

pub const SCORING_SYSTEM_PROMPT: &str = r#"
You are a medical documentation auditor. You compare ONE extracted form value
against the transcript it was taken from.

Score from 1 to 100:
- 100: the value is exactly what the transcript states, complete and correct.
- 60-99: mostly correct, minor omissions or formatting differences.
- 1-59: partly wrong, incomplete, or not supported by the transcript.

Output ONLY JSON: {"score": <integer 1-100>}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// `>= 85` high, `>= 60` medium, otherwise low.
    pub fn from_score(score: f64) -> Self {
        if score >= 85.0 {
            Confidence::High
        } else if score >= 60.0 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredField {
    pub path: String,
    pub extracted_value: String,
    pub weight: f64,
    pub score: u32,
    pub confidence: Confidence,
    pub weighted_score: f64,
}

impl ScoredField {
    pub fn new(path: &str, extracted_value: &str, weight: f64, score: u32) -> Self {
        Self {
            path: path.to_string(),
            extracted_value: extracted_value.to_string(),
            weight,
            score,
            confidence: Confidence::from_score(score as f64),
            weighted_score: weight * score as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub overall_score: f64,
    pub confidence: Confidence,
    pub review_recommended: bool,
    pub per_field: Vec<ScoredField>,
}

/// Weighted mean over scored (populated) fields only.
///
/// With nothing scored the overall score is 0 and review is recommended.
pub fn aggregate(per_field: Vec<ScoredField>) -> EvaluationReport {
    let weight_sum: f64 = per_field.iter().map(|f| f.weight).sum();
    let weighted_sum: f64 = per_field.iter().map(|f| f.weighted_score).sum();

    let overall_score = if weight_sum > 0.0 {
        weighted_sum / weight_sum
    } else {
        0.0
    };

    EvaluationReport {
        overall_score,
        confidence: Confidence::from_score(overall_score),
        review_recommended: overall_score < REVIEW_THRESHOLD,
        per_field,
    }
}

/// Model-backed field scorer.
pub struct QualityEvaluator {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl QualityEvaluator {
    pub fn new(llm: Arc<dyn LlmClient>, model: &str) -> Self {
        Self {
            llm,
            model: model.to_string(),
        }
    }

    /// Score every populated path of `filled` against `transcript`.
    pub fn evaluate(&self, filled: &Value, transcript: &str, weights: &WeightTable) -> EvaluationReport {
        let fields = flatten_paths(filled);
        let _span = tracing::info_span!("evaluate", fields = fields.len()).entered();
        let transcript = sanitize_transcript(transcript);

        let scored: Vec<ScoredField> = fields
            .iter()
            .map(|field| {
                let score = self.score_field(&field.path, &field.value, &transcript);
                ScoredField::new(&field.path, &field.value, weights.weight_for(&field.path), score)
            })
            .collect();

        let report = aggregate(scored);
        tracing::info!(
            overall_score = report.overall_score,
            review_recommended = report.review_recommended,
            "Evaluation complete"
        );
        report
    }

    /// One 1–100 score. Unreadable answers and failed calls score
    /// `DEFAULT_SCORE`.
    pub fn score_field(&self, path: &str, value: &str, transcript: &str) -> u32 {
        let prompt = format!(
            "Field: {path}\nExtracted value: {value}\n\n<transcript>\n{transcript}\n</transcript>\n\n\
             How accurate and complete is the extracted value?",
            value = sanitize_for_prompt(value, "extracted_value"),
        );

        let raw = match self.llm.generate(&self.model, &prompt, SCORING_SYSTEM_PROMPT) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path, error = %e, "Scoring call failed, using default score");
                return DEFAULT_SCORE;
            }
        };

        match parse_score(&raw) {
            Some(score) => score.clamp(MIN_SCORE as i64, MAX_SCORE as i64) as u32,
            None => {
                tracing::warn!(path, "Score unreadable, using default score");
                DEFAULT_SCORE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::{LlmError, MockLlmClient, ScriptedLlmClient};
    use serde_json::json;

    #[test]
    fn weighted_mean_with_review() {
        let report = aggregate(vec![
            ScoredField::new("a.x", "1", 3.0, 100),
            ScoredField::new("a.y", "2", 1.0, 50),
            ScoredField::new("a.z", "3", 1.0, 0),
        ]);
        assert!((report.overall_score - 70.0).abs() < 1e-9);
        assert!(report.review_recommended);
        assert_eq!(report.confidence, Confidence::Medium);
    }

    #[test]
    fn single_field_above_threshold() {
        let report = aggregate(vec![ScoredField::new("a.x", "v", 1.0, 90)]);
        assert!((report.overall_score - 90.0).abs() < 1e-9);
        assert!(!report.review_recommended);
        assert_eq!(report.confidence, Confidence::High);
    }

    #[test]
    fn nothing_scored_recommends_review() {
        let report = aggregate(Vec::new());
        assert_eq!(report.overall_score, 0.0);
        assert!(report.review_recommended);
    }

    #[test]
    fn confidence_buckets() {
        assert_eq!(Confidence::from_score(85.0), Confidence::High);
        assert_eq!(Confidence::from_score(84.9), Confidence::Medium);
        assert_eq!(Confidence::from_score(60.0), Confidence::Medium);
        assert_eq!(Confidence::from_score(59.9), Confidence::Low);
    }

    #[test]
    fn threshold_is_strict() {
        let report = aggregate(vec![ScoredField::new("a", "v", 1.0, 75)]);
        assert!(!report.review_recommended);
    }

    #[test]
    fn null_fields_excluded_from_evaluation() {
        let llm = Arc::new(ScriptedLlmClient::new(|_, _, _| Ok(r#"{"score": 90}"#.into())));
        let evaluator = QualityEvaluator::new(llm.clone(), "m");
        let filled = json!({"history": {"allergies": "penicillin", "smoker": null, "phone": null}});

        let report = evaluator.evaluate(&filled, "transcript", &WeightTable::new());
        assert_eq!(report.per_field.len(), 1);
        assert_eq!(llm.call_count(), 1);
        assert!((report.overall_score - 90.0).abs() < 1e-9);
        assert!(!report.review_recommended);
    }

    #[test]
    fn weights_applied_from_table() {
        let llm = Arc::new(ScriptedLlmClient::new(|prompt, _, _| {
            let score = if prompt.contains("Field: h.allergies") { 100 } else { 40 };
            Ok(format!(r#"{{"score": {score}}}"#))
        }));
        let evaluator = QualityEvaluator::new(llm, "m");
        let weights = WeightTable::new().with_weight("allergies", 3.0);
        let filled = json!({"h": {"allergies": "latex", "phone": "555-0100"}});

        let report = evaluator.evaluate(&filled, "t", &weights);
        // (3 * 100 + 1 * 40) / 4
        assert!((report.overall_score - 85.0).abs() < 1e-9);
        let allergies = report.per_field.iter().find(|f| f.path == "h.allergies").unwrap();
        assert_eq!(allergies.weight, 3.0);
        assert_eq!(allergies.weighted_score, 300.0);
    }

    #[test]
    fn unreadable_score_defaults_to_fifty() {
        let evaluator = QualityEvaluator::new(Arc::new(MockLlmClient::new("looks fine")), "m");
        assert_eq!(evaluator.score_field("a", "v", "t"), DEFAULT_SCORE);
    }

    #[test]
    fn out_of_range_scores_clamped() {
        let high = QualityEvaluator::new(Arc::new(MockLlmClient::new(r#"{"score": 250}"#)), "m");
        assert_eq!(high.score_field("a", "v", "t"), MAX_SCORE);
        let low = QualityEvaluator::new(Arc::new(MockLlmClient::new("Score: 0")), "m");
        assert_eq!(low.score_field("a", "v", "t"), MIN_SCORE);
    }

    #[test]
    fn failed_call_defaults_to_fifty() {
        let llm = ScriptedLlmClient::new(|_, _, _| Err(LlmError::Connection("x".into())));
        let evaluator = QualityEvaluator::new(Arc::new(llm), "m");
        assert_eq!(evaluator.score_field("a", "v", "t"), DEFAULT_SCORE);
    }

    #[test]
    fn scoring_prompt_keeps_assistant_turns() {
        let llm = Arc::new(ScriptedLlmClient::new(|_, _, _| Ok("90".into())));
        let evaluator = QualityEvaluator::new(llm.clone(), "m");
        let transcript = "Assistant: Any allergies?\nPatient: Penicillin.\nAssistant: Confirmed penicillin allergy.";

        let report = evaluator.evaluate(&json!({"allergies": "penicillin"}), transcript, &WeightTable::default());
        assert_eq!(report.per_field.len(), 1);
        assert!(llm.calls()[0].prompt.contains("Assistant: Confirmed penicillin allergy."));
    }
}
