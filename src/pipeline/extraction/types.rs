use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::pipeline::sections::Section;

/// Values models use to say "no answer" instead of returning null.
const PLACEHOLDER_VALUES: &[&str] = &[
    "",
    "null",
    "n/a",
    "unknown",
    "not mentioned",
    "not provided",
    "not stated",
    "not specified",
    "not available",
    "not applicable",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Date,
    Boolean,
    Choice,
    Number,
}

impl FieldType {
    /// Map the type names models tend to emit onto the fixed set.
    /// Unrecognized names become `Text`.
    pub fn from_model_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "date" | "datetime" | "date_time" => FieldType::Date,
            "boolean" | "bool" | "checkbox" | "yes_no" | "yesno" => FieldType::Boolean,
            "choice" | "select" | "radio" | "enum" | "multiselect" | "multi_select"
            | "multiple_choice" | "dropdown" => FieldType::Choice,
            "number" | "numeric" | "integer" | "int" | "float" | "decimal" => FieldType::Number,
            _ => FieldType::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Date => "date",
            FieldType::Boolean => "boolean",
            FieldType::Choice => "choice",
            FieldType::Number => "number",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default)]
    pub value: Option<Value>,
}

impl FieldDescriptor {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            label: name.to_string(),
            required: false,
            options: Vec::new(),
            value: None,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Named, ordered field list for one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStructure {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

impl FieldStructure {
    /// Build a structure from stage-1 model output.
    ///
    /// Accepts `{"name": .., "fields": [..]}` or a bare field array. Values
    /// are always reset to null. Duplicate names get a numeric suffix, and a
    /// choice without options degrades to text.
    pub fn from_model_json(value: &Value, fallback_name: &str) -> Result<Self, String> {
        let (name, raw_fields) = match value {
            Value::Object(map) => {
                let fields = map
                    .get("fields")
                    .and_then(Value::as_array)
                    .ok_or_else(|| "Structure has no 'fields' array".to_string())?;
                let name = ["name", "section_name", "title"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_str))
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(fallback_name);
                (name.to_string(), fields)
            }
            Value::Array(fields) => (fallback_name.to_string(), fields),
            _ => return Err("Structure is neither an object nor an array".into()),
        };

        let mut fields: Vec<FieldDescriptor> = Vec::with_capacity(raw_fields.len());
        for raw in raw_fields {
            let Some(obj) = raw.as_object() else { continue };
            let Some(base_name) = ["name", "key", "id"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map(str::trim)
                .filter(|s| !s.is_empty())
            else {
                continue;
            };

            let mut name = base_name.to_string();
            let mut suffix = 2;
            while fields.iter().any(|f| f.name == name) {
                name = format!("{base_name}_{suffix}");
                suffix += 1;
            }

            let mut field_type = obj
                .get("type")
                .and_then(Value::as_str)
                .map(FieldType::from_model_name)
                .unwrap_or(FieldType::Text);
            let options: Vec<String> = obj
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| opts.iter().filter_map(scalar_to_string).collect())
                .unwrap_or_default();
            if field_type == FieldType::Choice && options.is_empty() {
                field_type = FieldType::Text;
            }

            let label = obj
                .get("label")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(base_name)
                .to_string();

            fields.push(FieldDescriptor {
                name,
                field_type,
                label,
                required: obj.get("required").and_then(Value::as_bool).unwrap_or(false),
                options: if field_type == FieldType::Choice { options } else { Vec::new() },
                value: None,
            });
        }

        Ok(Self { name, fields })
    }

    pub fn clear_values(&mut self) {
        for field in &mut self.fields {
            field.value = None;
        }
    }

    /// Set values by field name, coerced to each field's type.
    ///
    /// Names not in the structure are ignored; fields absent from `values`
    /// stay null. Returns the number of fields that received a value.
    pub fn apply_values(&mut self, values: &Map<String, Value>) -> usize {
        let mut filled = 0;
        for field in &mut self.fields {
            field.value = values.get(&field.name).and_then(|raw| coerce(field, raw));
            if field.value.is_some() {
                filled += 1;
            }
        }
        filled
    }

    pub fn populated_count(&self) -> usize {
        self.fields.iter().filter(|f| f.value.is_some()).count()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// `(name, type)` pairs, the part of a structure stage 2 may not change.
    pub fn signature(&self) -> Vec<(String, FieldType)> {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type))
            .collect()
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_placeholder(s: &str) -> bool {
    let lower = s.trim().to_lowercase();
    PLACEHOLDER_VALUES.contains(&lower.as_str())
}

fn coerce(field: &FieldDescriptor, raw: &Value) -> Option<Value> {
    if let Value::String(s) = raw {
        if is_placeholder(s) {
            return None;
        }
    }

    match field.field_type {
        FieldType::Text | FieldType::Date => match raw {
            Value::Null => None,
            Value::Array(items) => {
                let kept: Vec<Value> = items
                    .iter()
                    .filter_map(scalar_to_string)
                    .filter(|s| !is_placeholder(s))
                    .map(Value::String)
                    .collect();
                (!kept.is_empty()).then_some(Value::Array(kept))
            }
            Value::Object(_) => Some(Value::String(raw.to_string())),
            other => scalar_to_string(other).map(Value::String),
        },
        FieldType::Boolean => match raw {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(1) => Some(Value::Bool(true)),
                Some(0) => Some(Value::Bool(false)),
                _ => None,
            },
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "yes" | "y" | "true" | "checked" | "x" => Some(Value::Bool(true)),
                "no" | "n" | "false" | "unchecked" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        FieldType::Number => match raw {
            Value::Number(n) => Some(Value::Number(n.clone())),
            Value::String(s) => parse_number(s),
            _ => None,
        },
        FieldType::Choice => match raw {
            Value::Array(items) => {
                let matched: Vec<Value> = items
                    .iter()
                    .filter_map(scalar_to_string)
                    .filter_map(|s| match_option(&field.options, &s))
                    .map(Value::String)
                    .collect();
                (!matched.is_empty()).then_some(Value::Array(matched))
            }
            other => scalar_to_string(other)
                .and_then(|s| match_option(&field.options, &s))
                .map(Value::String),
        },
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
    if let Ok(i) = cleaned.parse::<i64>() {
        return Some(Value::from(i));
    }
    cleaned
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

fn match_option(options: &[String], candidate: &str) -> Option<String> {
    let wanted = candidate.trim().to_lowercase();
    options
        .iter()
        .find(|o| o.to_lowercase() == wanted)
        .cloned()
}

// ═══════════════════════════════════════════════════════════
// Section results
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionStatus {
    Success,
    Failed,
}

/// Outcome of one kernel run. Immutable once returned by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionResult {
    pub section_id: usize,
    pub chunk_indices: Vec<usize>,
    pub status: SectionStatus,
    pub structure: Option<FieldStructure>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl SectionResult {
    pub fn success(section: &Section, structure: FieldStructure, duration_ms: u64) -> Self {
        Self {
            section_id: section.id,
            chunk_indices: section.chunk_indices.clone(),
            status: SectionStatus::Success,
            structure: Some(structure),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(section: &Section, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            section_id: section.id,
            chunk_indices: section.chunk_indices.clone(),
            status: SectionStatus::Failed,
            structure: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SectionStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intake_structure() -> FieldStructure {
        FieldStructure {
            name: "history".into(),
            fields: vec![
                FieldDescriptor::new("smoker", FieldType::Boolean),
                FieldDescriptor::new("weight_kg", FieldType::Number),
                FieldDescriptor::new("blood_type", FieldType::Choice)
                    .with_options(&["A", "B", "AB", "O"]),
                FieldDescriptor::new("allergies", FieldType::Text),
                FieldDescriptor::new("dob", FieldType::Date),
            ],
        }
    }

    #[test]
    fn descriptor_serializes_type_key_and_null_value() {
        let field = FieldDescriptor::new("dob", FieldType::Date).required();
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["type"], "date");
        assert!(json["value"].is_null());
        assert!(json.get("options").is_none());
    }

    #[test]
    fn model_json_is_parsed_leniently() {
        let raw = json!({
            "section_name": "Medical History",
            "fields": [
                {"name": "smoker", "type": "checkbox", "label": "Do you smoke?"},
                {"name": "smoker", "type": "text"},
                {"name": "blood_type", "type": "select", "options": ["A", "B", "O"]},
                {"name": "pain_level", "type": "radio"},
                {"name": "visits", "type": "integer", "value": 3},
                {"type": "text"},
                "garbage"
            ]
        });
        let structure = FieldStructure::from_model_json(&raw, "section_0").unwrap();

        assert_eq!(structure.name, "Medical History");
        let names: Vec<_> = structure.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["smoker", "smoker_2", "blood_type", "pain_level", "visits"]);
        assert_eq!(structure.fields[0].field_type, FieldType::Boolean);
        assert_eq!(structure.fields[0].label, "Do you smoke?");
        assert_eq!(structure.fields[2].options.len(), 3);
        assert_eq!(structure.fields[3].field_type, FieldType::Text);
        assert_eq!(structure.fields[4].field_type, FieldType::Number);
        assert!(structure.fields.iter().all(|f| f.value.is_none()));
    }

    #[test]
    fn bare_array_uses_fallback_name() {
        let raw = json!([{"name": "phone", "type": "phone_number"}]);
        let structure = FieldStructure::from_model_json(&raw, "section_3").unwrap();
        assert_eq!(structure.name, "section_3");
        assert_eq!(structure.fields[0].field_type, FieldType::Text);
    }

    #[test]
    fn non_structure_json_rejected() {
        assert!(FieldStructure::from_model_json(&json!({"foo": 1}), "s").is_err());
        assert!(FieldStructure::from_model_json(&json!("text"), "s").is_err());
    }

    #[test]
    fn values_are_coerced_per_type() {
        let mut s = intake_structure();
        let values = json!({
            "smoker": "No",
            "weight_kg": "72.5",
            "blood_type": "ab",
            "allergies": ["penicillin", "N/A", "latex"],
            "dob": "1980-04-02",
            "invented_field": "should be ignored"
        });
        let filled = s.apply_values(values.as_object().unwrap());

        assert_eq!(filled, 5);
        assert_eq!(s.field("smoker").unwrap().value, Some(json!(false)));
        assert_eq!(s.field("weight_kg").unwrap().value, Some(json!(72.5)));
        assert_eq!(s.field("blood_type").unwrap().value, Some(json!("AB")));
        assert_eq!(
            s.field("allergies").unwrap().value,
            Some(json!(["penicillin", "latex"]))
        );
        assert!(s.field("invented_field").is_none());
    }

    #[test]
    fn placeholders_and_unknown_options_become_null() {
        let mut s = intake_structure();
        let values = json!({
            "smoker": "unknown",
            "weight_kg": "about seventy",
            "blood_type": "Z",
            "allergies": "Not mentioned",
            "dob": null
        });
        assert_eq!(s.apply_values(values.as_object().unwrap()), 0);
        assert_eq!(s.populated_count(), 0);
    }

    #[test]
    fn apply_values_never_changes_signature() {
        let mut s = intake_structure();
        let before = s.signature();
        s.apply_values(json!({"smoker": true, "extra": 1}).as_object().unwrap());
        assert_eq!(s.signature(), before);
    }

    #[test]
    fn integer_strings_stay_integers() {
        let mut s = intake_structure();
        s.apply_values(json!({"weight_kg": "1,200"}).as_object().unwrap());
        assert_eq!(s.field("weight_kg").unwrap().value, Some(json!(1200)));
    }

    #[test]
    fn section_result_constructors() {
        let section = Section::new(2, vec![4, 5]);
        let ok = SectionResult::success(&section, intake_structure(), 12);
        assert!(ok.is_success());
        assert_eq!(ok.chunk_indices, vec![4, 5]);

        let failed = SectionResult::failed(&section, "timeout", 3);
        assert_eq!(failed.status, SectionStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("timeout"));
        assert!(failed.structure.is_none());
    }
}
