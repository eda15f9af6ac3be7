use serde_json::Value;

/// Separator used when a list value is scored as one string.
pub const LIST_SEPARATOR: &str = "; ";

/// One populated leaf of a filled structure.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatField {
    pub path: String,
    pub value: String,
}

/// Flatten nested JSON into dotted paths, skipping null and empty values.
///
/// `{"demographics": {"name": "Ana", "phones": ["1", "2"]}}` becomes
/// `demographics.name = "Ana"` and `demographics.phones = "1; 2"`.
pub fn flatten_paths(value: &Value) -> Vec<FlatField> {
    let mut out = Vec::new();
    walk("", value, &mut out);
    out
}

fn walk(prefix: &str, value: &Value, out: &mut Vec<FlatField>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                walk(&path, child, out);
            }
        }
        leaf => {
            if prefix.is_empty() {
                return;
            }
            if let Some(text) = leaf_text(leaf) {
                out.push(FlatField {
                    path: prefix.to_string(),
                    value: text,
                });
            }
        }
    }
}

fn leaf_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(_) | Value::Array(_) => Some(item.to_string()),
                    scalar => leaf_text(scalar),
                })
                .collect();
            (!parts.is_empty()).then(|| parts.join(LIST_SEPARATOR))
        }
        Value::Object(_) => None,
    }
}
