use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Section;
use crate::pipeline::chunks::{render_indexed, Chunk};
use crate::pipeline::grounding::GroundingExtractor;
use crate::pipeline::llm::{normalize_json, sanitize_for_prompt, LlmClient};

pub const PARTITION_SYSTEM_PROMPT: &str = r#"
You are a document layout assistant. You receive the numbered content chunks of
a medical intake form, in reading order. Group the chunk numbers into sections
that are semantically independent of each other, for example patient
demographics, insurance, medical history, current visit, consent and signatures.

RULES:
1. Every chunk number must appear in exactly one section.
2. Do not invent chunk numbers.
3. Keep chunks that describe the same topic together, even if they are not adjacent.
4. Output ONLY JSON, no commentary.

OUTPUT FORMAT:
{"sections": [{"title": "short title", "chunk_indices": [0, 1, 2]}, ...]}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStrategy {
    /// Groups came from the model and passed validation.
    Model,
    /// One section per chunk.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub sections: Vec<Section>,
    pub strategy: PartitionStrategy,
    pub fallback_reason: Option<String>,
}

/// Groups chunk indices into disjoint sections with the model's help.
///
/// Never fails: any service error or invalid grouping yields
/// `fallback_partition`.
pub struct SectionPartitioner {
    llm: Arc<dyn LlmClient>,
    model: String,
    vision_model: String,
    grounding: Option<Arc<GroundingExtractor>>,
}

impl SectionPartitioner {
    pub fn new(llm: Arc<dyn LlmClient>, model: &str) -> Self {
        Self {
            llm,
            model: model.to_string(),
            vision_model: model.to_string(),
            grounding: None,
        }
    }

    /// Attach one grounding crop per chunk to the partition request.
    pub fn with_images(mut self, grounding: Arc<GroundingExtractor>, vision_model: &str) -> Self {
        self.grounding = Some(grounding);
        self.vision_model = vision_model.to_string();
        self
    }

    pub fn partition(&self, chunks: &[Chunk]) -> Vec<Section> {
        self.partition_detailed(chunks).sections
    }

    pub fn partition_detailed(&self, chunks: &[Chunk]) -> Partition {
        let n = chunks.len();
        if n == 0 {
            return Partition {
                sections: Vec::new(),
                strategy: PartitionStrategy::Fallback,
                fallback_reason: Some("document has no chunks".into()),
            };
        }

        let _span = tracing::info_span!("partition", chunk_count = n).entered();

        match self.request_partition(chunks) {
            Ok(sections) => {
                tracing::info!(section_count = sections.len(), "Partition accepted");
                Partition {
                    sections,
                    strategy: PartitionStrategy::Model,
                    fallback_reason: None,
                }
            }
            Err(reason) => {
                tracing::warn!(reason = %reason, "Partition rejected, one section per chunk");
                Partition {
                    sections: fallback_partition(n),
                    strategy: PartitionStrategy::Fallback,
                    fallback_reason: Some(reason),
                }
            }
        }
    }

    fn request_partition(&self, chunks: &[Chunk]) -> Result<Vec<Section>, String> {
        let refs: Vec<&Chunk> = chunks.iter().collect();
        let listing = render_indexed(&refs, |t| sanitize_for_prompt(t, "chunk"));
        let prompt = format!(
            "The form has {n} chunks, numbered 0 to {last}.\n\n<chunks>\n{listing}\n</chunks>\n\n\
             Group every chunk number into independent sections.",
            n = chunks.len(),
            last = chunks.len() - 1,
        );

        let images = match &self.grounding {
            Some(grounding) => grounding.crops_base64(&refs),
            None => Vec::new(),
        };

        let response = if images.is_empty() {
            self.llm.generate(&self.model, &prompt, PARTITION_SYSTEM_PROMPT)
        } else {
            match self.llm.generate_with_images(
                &self.vision_model,
                &prompt,
                PARTITION_SYSTEM_PROMPT,
                &images,
            ) {
                Err(e) if e.is_image_rejection() => {
                    tracing::warn!(
                        model = %self.vision_model,
                        error = %e,
                        "Model rejected images, partitioning from text"
                    );
                    self.llm.generate(&self.model, &prompt, PARTITION_SYSTEM_PROMPT)
                }
                other => other,
            }
        };
        let raw = response.map_err(|e| format!("partition request failed: {e}"))?;

        let value = normalize_json(&raw).map_err(|e| e.to_string())?;
        parse_partition(&value, chunks.len())
    }
}

/// One section per chunk, in index order.
pub fn fallback_partition(chunk_count: usize) -> Vec<Section> {
    (0..chunk_count).map(|i| Section::new(i, vec![i])).collect()
}

/// Validate a model grouping against `0..chunk_count`.
///
/// Accepts `{"sections": [...]}` or a bare array; each group is either an
/// index array or `{"title", "chunk_indices"}`. Duplicate, missing or
/// out-of-range indices reject the whole response. Groups are sorted,
/// empty groups dropped, and sections ordered by their first index.
pub fn parse_partition(value: &Value, chunk_count: usize) -> Result<Vec<Section>, String> {
    let groups = match value {
        Value::Object(map) => map
            .get("sections")
            .or_else(|| map.get("groups"))
            .and_then(Value::as_array)
            .ok_or_else(|| "response has no 'sections' array".to_string())?,
        Value::Array(groups) => groups,
        _ => return Err("response is not a section list".into()),
    };

    let mut seen = vec![false; chunk_count];
    let mut parsed: Vec<(Vec<usize>, Option<String>)> = Vec::with_capacity(groups.len());

    for group in groups {
        let (raw_indices, title) = match group {
            Value::Array(items) => (items, None),
            Value::Object(obj) => {
                let items = ["chunk_indices", "indices", "chunks"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(Value::as_array))
                    .ok_or_else(|| "section object has no index list".to_string())?;
                let title = ["title", "name"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(Value::as_str))
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty());
                (items, title)
            }
            other => return Err(format!("unexpected section entry: {other}")),
        };

        let mut indices = Vec::with_capacity(raw_indices.len());
        for raw in raw_indices {
            let index = as_index(raw).ok_or_else(|| format!("invalid chunk index: {raw}"))?;
            if index >= chunk_count {
                return Err(format!("chunk index {index} out of range (n = {chunk_count})"));
            }
            if seen[index] {
                return Err(format!("chunk index {index} assigned twice"));
            }
            seen[index] = true;
            indices.push(index);
        }

        if !indices.is_empty() {
            indices.sort_unstable();
            parsed.push((indices, title));
        }
    }

    let missing = seen.iter().filter(|s| !**s).count();
    if missing > 0 {
        return Err(format!("{missing} chunk indices not assigned to any section"));
    }

    parsed.sort_by_key(|(indices, _)| indices[0]);
    Ok(parsed
        .into_iter()
        .enumerate()
        .map(|(id, (chunk_indices, title))| Section {
            id,
            chunk_indices,
            title,
        })
        .collect())
}

fn as_index(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|u| usize::try_from(u).ok()),
        Value::String(s) => s.trim().parse::<usize>().ok(),
        _ => None,
    }
}
