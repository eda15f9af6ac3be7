use super::LlmError;

/// Text-generation client abstraction (allows deterministic fakes in tests).
///
/// Calls are synchronous request/response; implementations must be shareable
/// across the section worker pool.
pub trait LlmClient: Send + Sync {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, LlmError>;

    /// Generate with base64-encoded images attached to the prompt.
    ///
    /// Clients without vision support only accept an empty image list.
    fn generate_with_images(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
        images: &[String],
    ) -> Result<String, LlmError> {
        if images.is_empty() {
            self.generate(model, prompt, system)
        } else {
            Err(LlmError::VisionUnsupported(model.to_string()))
        }
    }

    fn is_model_available(&self, model: &str) -> Result<bool, LlmError>;

    fn list_models(&self) -> Result<Vec<String>, LlmError>;
}
