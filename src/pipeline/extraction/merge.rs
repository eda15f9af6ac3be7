use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::types::{FieldStructure, SectionResult, SectionStatus};
use super::ExtractionError;
use crate::pipeline::evaluation::EvaluationReport;
use crate::pipeline::sections::{Partition, PartitionStrategy};

/// Per-section line of the run trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionTrace {
    pub section_id: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub chunk_indices: Vec<usize>,
    pub status: SectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub field_count: usize,
    pub populated_fields: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every section succeeded.
    Complete,
    /// Some sections failed.
    Partial,
    /// No section succeeded.
    Failed,
}

/// Merged output of one document run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub run_id: Uuid,
    pub document_key: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub partition_strategy: PartitionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_fallback_reason: Option<String>,
    /// Successful sections only, keyed by section id.
    pub document: BTreeMap<usize, FieldStructure>,
    /// Every section, in section-id order.
    pub trace: Vec<SectionTrace>,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationReport>,
}

impl ExtractionReport {
    /// Merge scheduler output into a report. Failed sections appear in the
    /// trace with their error and are left out of `document`.
    pub fn assemble(
        document_key: &str,
        started_at: DateTime<Utc>,
        partition: &Partition,
        results: BTreeMap<usize, SectionResult>,
    ) -> Self {
        let titles: BTreeMap<usize, Option<String>> = partition
            .sections
            .iter()
            .map(|s| (s.id, s.title.clone()))
            .collect();

        let mut document = BTreeMap::new();
        let mut trace = Vec::with_capacity(results.len());

        for (section_id, result) in results {
            let (field_count, populated_fields) = result
                .structure
                .as_ref()
                .map(|s| (s.fields.len(), s.populated_count()))
                .unwrap_or((0, 0));

            trace.push(SectionTrace {
                section_id,
                title: titles.get(&section_id).cloned().flatten(),
                chunk_indices: result.chunk_indices,
                status: result.status,
                error: result.error,
                duration_ms: result.duration_ms,
                field_count,
                populated_fields,
            });

            if result.status == SectionStatus::Success {
                if let Some(structure) = result.structure {
                    document.insert(section_id, structure);
                }
            }
        }

        let succeeded = trace
            .iter()
            .filter(|t| t.status == SectionStatus::Success)
            .count();
        let failed = trace.len() - succeeded;

        Self {
            run_id: Uuid::new_v4(),
            document_key: document_key.to_string(),
            started_at,
            finished_at: Utc::now(),
            partition_strategy: partition.strategy,
            partition_fallback_reason: partition.fallback_reason.clone(),
            document,
            trace,
            succeeded,
            failed,
            evaluation: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        match (self.succeeded, self.failed) {
            (_, 0) => RunStatus::Complete,
            (0, _) => RunStatus::Failed,
            _ => RunStatus::Partial,
        }
    }

    pub fn review_recommended(&self) -> Option<bool> {
        self.evaluation.as_ref().map(|e| e.review_recommended)
    }

    /// Merged document as nested JSON: `{structure_name: {field: value}}`.
    ///
    /// A key already taken is suffixed with the section id, then with a
    /// counter, so no section overwrites another.
    pub fn document_value(&self) -> Value {
        let mut root = Map::new();
        for (section_id, structure) in &self.document {
            let key = unused_key(&root, structure_key(&structure.name, *section_id), *section_id);
            root.insert(key, structure_values(structure));
        }
        Value::Object(root)
    }

    /// Pretty JSON file, creating parent directories.
    pub fn write_json(&self, path: &Path) -> Result<(), ExtractionError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ExtractionError::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Report written");
        Ok(())
    }
}

fn structure_key(name: &str, section_id: usize) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_').to_string();
    if cleaned.is_empty() {
        format!("section_{section_id}")
    } else {
        cleaned
    }
}

fn unused_key(root: &Map<String, Value>, base: String, section_id: usize) -> String {
    if !root.contains_key(&base) {
        return base;
    }
    let with_id = format!("{base}_{section_id}");
    let mut candidate = with_id.clone();
    let mut n = 2;
    while root.contains_key(&candidate) {
        candidate = format!("{with_id}_{n}");
        n += 1;
    }
    candidate
}

/// `{field_name: value}` for one structure; unfilled fields are null.
pub fn structure_values(structure: &FieldStructure) -> Value {
    Value::Object(
        structure
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.value.clone().unwrap_or(Value::Null)))
            .collect(),
    )
}
