use serde_json::json;

use super::types::FieldStructure;

pub const SYNTHESIS_SYSTEM_PROMPT: &str = r#"
You are a medical form analysis assistant. You receive the content of ONE section
of a blank or filled medical intake form. Your ONLY role is to describe the
fields this section asks for. You do not fill them in.

RULES (ABSOLUTE, NO EXCEPTIONS):
1. List only fields that the section itself asks for.
2. Use snake_case field names, unique within the section.
3. type is one of: text, date, boolean, choice, number.
4. For choice fields, list every printed option in "options".
5. Every "value" MUST be null.
6. Output ONLY JSON, no commentary.

OUTPUT FORMAT:
{"name": "section name", "fields": [
  {"name": "field_name", "type": "text", "label": "Printed label",
   "required": false, "options": [], "value": null}
]}
"#;

pub const FILL_SYSTEM_PROMPT: &str = r#"
You are a medical intake transcription assistant. You receive a list of form
fields and a transcript of a conversation with the patient. Your ONLY role is
to copy answers that the transcript states explicitly into the fields.

RULES (ABSOLUTE, NO EXCEPTIONS):
1. Use ONLY information explicitly stated in the transcript.
2. NEVER guess, infer, or fill a field from general medical knowledge.
3. If the transcript does not answer a field, its value is null.
4. Do not add, remove or rename fields.
5. choice values must be one of the listed options.
6. boolean values are true, false or null; dates are written as stated.
7. Output ONLY JSON, no commentary.

OUTPUT FORMAT:
{"values": {"field_name": "value or null"}}
"#;

/// Stage-1 prompt: the section's own content, no transcript.
pub fn build_synthesis_prompt(section_name: &str, section_listing: &str, image_count: usize) -> String {
    let image_note = if image_count > 0 {
        format!(
            "{image_count} image(s) of this section's regions on the page are attached, \
             in chunk order. Use them to read checkboxes and layout.\n"
        )
    } else {
        String::new()
    };

    format!(
        "{image_note}Section: {section_name}\n\n<section>\n{section_listing}\n</section>\n\n\
         Describe the fields this section of the form asks for."
    )
}

/// Stage-2 prompt: the frozen field list and the transcript.
pub fn build_fill_prompt(structure: &FieldStructure, transcript: &str) -> String {
    let fields: Vec<_> = structure
        .fields
        .iter()
        .map(|f| {
            let mut entry = json!({
                "name": f.name,
                "type": f.field_type.as_str(),
                "label": f.label,
            });
            if !f.options.is_empty() {
                entry["options"] = json!(f.options);
            }
            entry
        })
        .collect();
    let field_list = serde_json::to_string_pretty(&fields).unwrap_or_else(|_| "[]".into());

    format!(
        "Section: {name}\n\n<fields>\n{field_list}\n</fields>\n\n\
         <transcript>\n{transcript}\n</transcript>\n\n\
         Fill each field from the transcript. Use null for anything the transcript does not state.",
        name = structure.name,
    )
}
