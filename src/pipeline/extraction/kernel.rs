use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};

use super::prompt::{
    build_fill_prompt, build_synthesis_prompt, FILL_SYSTEM_PROMPT, SYNTHESIS_SYSTEM_PROMPT,
};
use super::types::{FieldStructure, SectionResult};
use super::ExtractionError;
use crate::pipeline::chunks::{render_indexed, section_key, Chunk, StructureStore};
use crate::pipeline::grounding::GroundingExtractor;
use crate::pipeline::llm::{normalize_json, sanitize_for_prompt, sanitize_transcript, LlmClient, LlmError};
use crate::pipeline::sections::Section;

/// Runs one section to completion. Implemented by `ExtractionKernel`; the
/// scheduler only depends on this trait.
pub trait SectionRunner: Send + Sync {
    fn run(&self, section: &Section, chunks: &[Chunk], transcript: &str) -> SectionResult;
}

#[derive(Debug, Clone)]
pub struct KernelOptions {
    pub model: String,
    /// Model for stage-1 calls that carry grounding images.
    pub vision_model: String,
    pub include_images: bool,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            model: "medgemma:4b".to_string(),
            vision_model: "medgemma:4b".to_string(),
            include_images: true,
        }
    }
}

/// A field structure produced by stage 1 (or loaded from the structure
/// cache). Stage 2 only accepts this type, so it can never be handed a
/// structure that did not come from synthesis.
#[derive(Debug, Clone)]
pub struct SynthesizedStructure(FieldStructure);

impl SynthesizedStructure {
    fn new(mut structure: FieldStructure) -> Self {
        structure.clear_values();
        Self(structure)
    }

    pub fn structure(&self) -> &FieldStructure {
        &self.0
    }

    pub fn into_inner(self) -> FieldStructure {
        self.0
    }
}

struct StructureReuse {
    store: Arc<dyn StructureStore>,
    layout_key: String,
}

/// Synthesize-then-fill extraction for one section.
pub struct ExtractionKernel {
    llm: Arc<dyn LlmClient>,
    options: KernelOptions,
    grounding: Option<Arc<GroundingExtractor>>,
    reuse: Option<StructureReuse>,
}

impl ExtractionKernel {
    pub fn new(llm: Arc<dyn LlmClient>, options: KernelOptions) -> Self {
        Self {
            llm,
            options,
            grounding: None,
            reuse: None,
        }
    }

    pub fn with_grounding(mut self, grounding: Arc<GroundingExtractor>) -> Self {
        self.grounding = Some(grounding);
        self
    }

    /// Persist stage-1 structures under `layout_key` and reuse them on
    /// later runs of the same layout.
    pub fn with_structure_reuse(mut self, store: Arc<dyn StructureStore>, layout_key: &str) -> Self {
        self.reuse = Some(StructureReuse {
            store,
            layout_key: layout_key.to_string(),
        });
        self
    }

    /// Resolve the section's chunk indices against the document's chunks.
    pub fn section_chunks<'a>(
        &self,
        section: &Section,
        chunks: &'a [Chunk],
    ) -> Result<Vec<&'a Chunk>, ExtractionError> {
        section
            .chunk_indices
            .iter()
            .map(|&index| {
                chunks
                    .get(index)
                    .filter(|c| c.index == index)
                    .or_else(|| chunks.iter().find(|c| c.index == index))
                    .ok_or(ExtractionError::MissingChunk {
                        section_id: section.id,
                        index,
                    })
            })
            .collect()
    }

    /// Stage 1: derive the section's field structure from its own chunks.
    /// The transcript is not an input.
    pub fn synthesize(
        &self,
        section: &Section,
        section_chunks: &[&Chunk],
    ) -> Result<SynthesizedStructure, ExtractionError> {
        if let Some(cached) = self.load_cached(section) {
            return Ok(SynthesizedStructure::new(cached));
        }

        let name = section.display_name();
        let listing = render_indexed(section_chunks, |t| sanitize_for_prompt(t, "chunk"));

        let images = match (&self.grounding, self.options.include_images) {
            (Some(grounding), true) => grounding.crops_base64(section_chunks),
            _ => Vec::new(),
        };

        let raw = if images.is_empty() {
            let prompt = build_synthesis_prompt(&name, &listing, 0);
            self.llm
                .generate(&self.options.model, &prompt, SYNTHESIS_SYSTEM_PROMPT)?
        } else {
            let prompt = build_synthesis_prompt(&name, &listing, images.len());
            match self.llm.generate_with_images(
                &self.options.vision_model,
                &prompt,
                SYNTHESIS_SYSTEM_PROMPT,
                &images,
            ) {
                Err(e) if e.is_image_rejection() => {
                    tracing::warn!(
                        model = %self.options.vision_model,
                        error = %e,
                        "Model rejected images, synthesizing from text"
                    );
                    let prompt = build_synthesis_prompt(&name, &listing, 0);
                    self.llm
                        .generate(&self.options.model, &prompt, SYNTHESIS_SYSTEM_PROMPT)?
                }
                other => other?,
            }
        };

        let value = normalize_json(&raw)?;
        let structure =
            FieldStructure::from_model_json(&value, &name).map_err(ExtractionError::Synthesis)?;

        tracing::debug!(
            section_id = section.id,
            field_count = structure.fields.len(),
            images = images.len(),
            "Structure synthesized"
        );

        self.store_cached(section, &structure);
        Ok(SynthesizedStructure::new(structure))
    }

    /// Stage 2: fill the frozen structure from the transcript. Fields the
    /// transcript does not answer stay null.
    pub fn fill(
        &self,
        structure: SynthesizedStructure,
        transcript: &str,
    ) -> Result<FieldStructure, ExtractionError> {
        let mut filled = structure.into_inner();
        if filled.fields.is_empty() {
            tracing::debug!(section = %filled.name, "No fields synthesized, fill skipped");
            return Ok(filled);
        }

        let transcript = sanitize_transcript(transcript);
        let prompt = build_fill_prompt(&filled, &transcript);
        let raw = self
            .llm
            .generate(&self.options.model, &prompt, FILL_SYSTEM_PROMPT)?;

        let value = normalize_json(&raw)?;
        let values = values_map(&value)
            .ok_or_else(|| ExtractionError::Fill("response has no field values".into()))?;

        let populated = filled.apply_values(&values);
        tracing::debug!(
            section = %filled.name,
            field_count = filled.fields.len(),
            populated,
            "Structure filled"
        );
        Ok(filled)
    }

    /// Both stages in order for one section.
    pub fn extract(
        &self,
        section: &Section,
        chunks: &[Chunk],
        transcript: &str,
    ) -> Result<FieldStructure, ExtractionError> {
        let section_chunks = self.section_chunks(section, chunks)?;
        let structure = self.synthesize(section, &section_chunks)?;
        self.fill(structure, transcript)
    }

    fn load_cached(&self, section: &Section) -> Option<FieldStructure> {
        let reuse = self.reuse.as_ref()?;
        let key = section_key(&section.chunk_indices);
        match reuse.store.load_structure(&reuse.layout_key, &key) {
            Ok(Some(structure)) => {
                tracing::info!(section_id = section.id, "Reusing cached section structure");
                Some(structure)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(section_id = section.id, error = %e, "Structure cache read failed");
                None
            }
        }
    }

    fn store_cached(&self, section: &Section, structure: &FieldStructure) {
        let Some(reuse) = self.reuse.as_ref() else { return };
        if structure.fields.is_empty() {
            return;
        }
        let key = section_key(&section.chunk_indices);
        if let Err(e) = reuse.store.save_structure(&reuse.layout_key, &key, structure) {
            tracing::warn!(section_id = section.id, error = %e, "Structure cache write failed");
        }
    }
}

impl SectionRunner for ExtractionKernel {
    fn run(&self, section: &Section, chunks: &[Chunk], transcript: &str) -> SectionResult {
        let _span = tracing::info_span!(
            "section",
            section_id = section.id,
            chunk_count = section.chunk_indices.len()
        )
        .entered();
        let start = Instant::now();

        let outcome = self.extract(section, chunks, transcript);
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(structure) => {
                tracing::info!(
                    elapsed_ms,
                    populated = structure.populated_count(),
                    "Section extracted"
                );
                SectionResult::success(section, structure, elapsed_ms)
            }
            Err(e) => {
                tracing::warn!(elapsed_ms, error = %e, "Section failed");
                SectionResult::failed(section, e.to_string(), elapsed_ms)
            }
        }
    }
}

/// Accepts `{"values": {..}}`, `{"fields": [{name, value}]}`, a bare
/// `[{name, value}]` list, or a flat `{name: value}` object.
fn values_map(value: &Value) -> Option<Map<String, Value>> {
    fn from_field_list(items: &[Value]) -> Map<String, Value> {
        items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                let name = obj.get("name")?.as_str()?;
                Some((name.to_string(), obj.get("value").cloned().unwrap_or(Value::Null)))
            })
            .collect()
    }

    match value {
        Value::Object(map) => {
            if let Some(Value::Object(values)) = map.get("values") {
                return Some(values.clone());
            }
            if let Some(Value::Array(fields)) = map.get("fields") {
                return Some(from_field_list(fields));
            }
            Some(map.clone())
        }
        Value::Array(items) => Some(from_field_list(items)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::chunks::{MemoryStore, NormalizedBox};
    use crate::pipeline::extraction::SectionStatus;
    use crate::pipeline::grounding::ImageRasterizer;
    use crate::pipeline::llm::ScriptedLlmClient;
    use image::{DynamicImage, RgbImage};
    use serde_json::json;

    const STRUCTURE: &str = r#"{"name": "History", "fields": [
        {"name": "allergies", "type": "text", "label": "Allergies"},
        {"name": "smoker", "type": "boolean", "label": "Do you smoke?"},
        {"name": "emergency_phone", "type": "text", "label": "Emergency contact phone"}
    ]}"#;

    const TRANSCRIPT: &str = "Patient reports a penicillin allergy. She does not smoke.";

    fn form_chunks() -> Vec<Chunk> {
        vec![
            Chunk::new(0, "MEDICAL HISTORY", "title")
                .with_grounding(0, NormalizedBox::new(0.0, 0.0, 0.5, 0.1)),
            Chunk::new(1, "Allergies: ____  Smoker: [ ] yes [ ] no", "form")
                .with_grounding(0, NormalizedBox::new(0.0, 0.1, 0.5, 0.2)),
            Chunk::new(2, "Emergency contact phone: ____", "form"),
        ]
    }

    fn section() -> Section {
        Section::new(0, vec![0, 1, 2])
    }

    fn scripted(fill: &'static str) -> Arc<ScriptedLlmClient> {
        Arc::new(ScriptedLlmClient::new(move |_, system, _| {
            if system == SYNTHESIS_SYSTEM_PROMPT {
                Ok(STRUCTURE.to_string())
            } else {
                Ok(fill.to_string())
            }
        }))
    }

    fn text_only() -> KernelOptions {
        KernelOptions {
            include_images: false,
            ..KernelOptions::default()
        }
    }

    #[test]
    fn synthesis_runs_before_fill_and_ignores_transcript() {
        let llm = scripted(r#"{"values": {"allergies": "penicillin", "smoker": false}}"#);
        let kernel = ExtractionKernel::new(llm.clone(), text_only());

        let result = kernel.run(&section(), &form_chunks(), TRANSCRIPT);
        assert!(result.is_success());

        let calls = llm.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].system, SYNTHESIS_SYSTEM_PROMPT);
        assert!(!calls[0].prompt.contains("penicillin"));
        assert_eq!(calls[1].system, FILL_SYSTEM_PROMPT);
        assert!(calls[1].prompt.contains("emergency_phone"));
        assert!(calls[1].prompt.contains(TRANSCRIPT));
    }

    #[test]
    fn absent_fields_stay_null() {
        let llm = scripted(
            r#"{"values": {"allergies": "penicillin", "smoker": "no",
                "emergency_phone": "Not provided", "insurance_id": "X123"}}"#,
        );
        let kernel = ExtractionKernel::new(llm, text_only());

        let structure = kernel.extract(&section(), &form_chunks(), TRANSCRIPT).unwrap();
        assert_eq!(structure.field("allergies").unwrap().value, Some(json!("penicillin")));
        assert_eq!(structure.field("smoker").unwrap().value, Some(json!(false)));
        assert!(structure.field("emergency_phone").unwrap().value.is_none());
        assert!(structure.field("insurance_id").is_none());
        assert_eq!(structure.fields.len(), 3);
    }

    #[test]
    fn fill_keeps_stage_one_signature() {
        let llm = scripted(r#"{"fields": [{"name": "smoker", "type": "text", "value": "yes"}]}"#);
        let kernel = ExtractionKernel::new(llm, text_only());
        let chunks = form_chunks();
        let refs = kernel.section_chunks(&section(), &chunks).unwrap();

        let synthesized = kernel.synthesize(&section(), &refs).unwrap();
        let signature = synthesized.structure().signature();
        let filled = kernel.fill(synthesized, TRANSCRIPT).unwrap();

        assert_eq!(filled.signature(), signature);
        assert_eq!(filled.field("smoker").unwrap().value, Some(json!(true)));
    }

    #[test]
    fn stage_one_failure_skips_stage_two() {
        let llm = Arc::new(ScriptedLlmClient::new(|_, _, _| Ok("no structure here".into())));
        let kernel = ExtractionKernel::new(llm.clone(), text_only());

        let result = kernel.run(&section(), &form_chunks(), TRANSCRIPT);
        assert_eq!(result.status, SectionStatus::Failed);
        assert!(result.error.is_some());
        assert_eq!(llm.call_count(), 1);
    }

    #[test]
    fn stage_two_failure_is_reported() {
        let llm = Arc::new(ScriptedLlmClient::new(|_, system, _| {
            if system == SYNTHESIS_SYSTEM_PROMPT {
                Ok(STRUCTURE.to_string())
            } else {
                Err(LlmError::Api {
                    status: 500,
                    body: "overloaded".into(),
                })
            }
        }));
        let kernel = ExtractionKernel::new(llm, text_only());

        let result = kernel.run(&section(), &form_chunks(), TRANSCRIPT);
        assert_eq!(result.status, SectionStatus::Failed);
        assert!(result.error.unwrap().contains("overloaded"));
        assert_eq!(result.chunk_indices, vec![0, 1, 2]);
    }

    #[test]
    fn empty_structure_skips_fill() {
        let llm = Arc::new(ScriptedLlmClient::new(|_, _, _| {
            Ok(r#"{"name": "Logo", "fields": []}"#.into())
        }));
        let kernel = ExtractionKernel::new(llm.clone(), text_only());

        let result = kernel.run(&Section::new(0, vec![0]), &form_chunks(), TRANSCRIPT);
        assert!(result.is_success());
        assert!(result.structure.unwrap().fields.is_empty());
        assert_eq!(llm.call_count(), 1);
    }

    #[test]
    fn missing_chunk_fails_section() {
        let llm = scripted("{}");
        let kernel = ExtractionKernel::new(llm.clone(), text_only());

        let result = kernel.run(&Section::new(3, vec![1, 9]), &form_chunks(), TRANSCRIPT);
        assert_eq!(result.status, SectionStatus::Failed);
        assert!(result.error.unwrap().contains("chunk 9"));
        assert_eq!(llm.call_count(), 0);
    }

    #[test]
    fn structures_reused_across_transcripts() {
        let store = Arc::new(MemoryStore::new());
        let llm = scripted(r#"{"values": {"allergies": "latex"}}"#);

        let first = ExtractionKernel::new(llm.clone(), text_only())
            .with_structure_reuse(store.clone(), "intake_v2");
        assert!(first.run(&section(), &form_chunks(), TRANSCRIPT).is_success());
        assert_eq!(llm.call_count(), 2);

        let cached = store.load_structure("intake_v2", "0,1,2").unwrap().unwrap();
        assert!(cached.fields.iter().all(|f| f.value.is_none()));

        let second = ExtractionKernel::new(llm.clone(), text_only())
            .with_structure_reuse(store, "intake_v2");
        let result = second.run(&section(), &form_chunks(), "Allergic to latex.");
        assert!(result.is_success());
        assert_eq!(llm.call_count(), 3);
        assert_eq!(llm.calls()[2].system, FILL_SYSTEM_PROMPT);
    }

    fn grounding() -> Arc<GroundingExtractor> {
        let page = DynamicImage::ImageRgb8(RgbImage::new(100, 100));
        Arc::new(GroundingExtractor::new(
            Arc::new(ImageRasterizer::from_image(page)),
            5.0,
            2.0,
        ))
    }

    #[test]
    fn grounding_images_attached_to_synthesis_only() {
        let llm = scripted(r#"{"values": {}}"#);
        let kernel = ExtractionKernel::new(llm.clone(), KernelOptions::default())
            .with_grounding(grounding());

        assert!(kernel.run(&section(), &form_chunks(), TRANSCRIPT).is_success());
        let calls = llm.calls();
        // Chunk 2 has no page or box.
        assert_eq!(calls[0].image_count, 2);
        assert_eq!(calls[1].image_count, 0);
    }

    #[test]
    fn images_disabled_by_option() {
        let llm = scripted(r#"{"values": {}}"#);
        let kernel = ExtractionKernel::new(llm.clone(), text_only()).with_grounding(grounding());

        kernel.run(&section(), &form_chunks(), TRANSCRIPT);
        assert_eq!(llm.calls()[0].image_count, 0);
    }

    #[test]
    fn vision_rejection_falls_back_to_text() {
        let llm = Arc::new(ScriptedLlmClient::new(|_, system, images| {
            if images > 0 {
                Err(LlmError::VisionUnsupported("text-model".into()))
            } else if system == SYNTHESIS_SYSTEM_PROMPT {
                Ok(STRUCTURE.to_string())
            } else {
                Ok(r#"{"values": {"smoker": false}}"#.to_string())
            }
        }));
        let kernel = ExtractionKernel::new(llm.clone(), KernelOptions::default())
            .with_grounding(grounding());

        let result = kernel.run(&section(), &form_chunks(), TRANSCRIPT);
        assert!(result.is_success());
        assert_eq!(llm.call_count(), 3);
    }

    #[test]
    fn image_rejection_from_server_falls_back_to_text() {
        let llm = Arc::new(ScriptedLlmClient::new(|_, system, images| {
            if images > 0 {
                Err(LlmError::Api {
                    status: 500,
                    body: "this model is missing data required for image input".into(),
                })
            } else if system == SYNTHESIS_SYSTEM_PROMPT {
                Ok(STRUCTURE.to_string())
            } else {
                Ok(r#"{"values": {"allergies": "penicillin"}}"#.to_string())
            }
        }));
        let kernel = ExtractionKernel::new(llm.clone(), KernelOptions::default())
            .with_grounding(grounding());

        let result = kernel.run(&section(), &form_chunks(), TRANSCRIPT);
        assert!(result.is_success());
        let calls = llm.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].image_count, 2);
        assert_eq!(calls[1].image_count, 0);
        assert_eq!(calls[1].system, SYNTHESIS_SYSTEM_PROMPT);
    }

    #[test]
    fn other_image_call_errors_fail_the_section() {
        let llm = Arc::new(ScriptedLlmClient::new(|_, _, _| {
            Err(LlmError::Api {
                status: 503,
                body: "server overloaded".into(),
            })
        }));
        let kernel = ExtractionKernel::new(llm.clone(), KernelOptions::default())
            .with_grounding(grounding());

        let result = kernel.run(&section(), &form_chunks(), TRANSCRIPT);
        assert_eq!(result.status, SectionStatus::Failed);
        assert_eq!(llm.call_count(), 1);
    }

    #[test]
    fn fill_prompt_keeps_assistant_turns() {
        let llm = scripted(r#"{"values": {"allergies": "penicillin"}}"#);
        let kernel = ExtractionKernel::new(llm.clone(), text_only());
        let transcript = "Assistant: What medications do you take?\nPatient: Metformin.\n\
                          Assistant: Any allergies? Patient says penicillin.";

        assert!(kernel.run(&section(), &form_chunks(), transcript).is_success());
        let fill = &llm.calls()[1];
        assert!(fill.prompt.contains("Assistant: Any allergies? Patient says penicillin."));
        assert!(fill.prompt.contains("Assistant: What medications do you take?"));
    }

    #[test]
    fn values_map_accepts_known_shapes() {
        let nested = values_map(&json!({"values": {"a": 1}})).unwrap();
        assert_eq!(nested["a"], 1);
        let listed = values_map(&json!([{"name": "a", "value": 2}])).unwrap();
        assert_eq!(listed["a"], 2);
        let flat = values_map(&json!({"a": 3})).unwrap();
        assert_eq!(flat["a"], 3);
        assert!(values_map(&json!("text")).is_none());
    }
}
