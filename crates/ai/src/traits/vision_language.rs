use super::AIModel;
use crate::prompts::PromptType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// One image to run through a vision-language model.
#[derive(Debug, Clone)]
pub struct BatchInputItem {
    pub image: DynamicImage,
    /// Literal prompt; when present and non-empty it wins over `prompt_type`.
    pub prompt: Option<String>,
    pub prompt_type: PromptType,
}

impl BatchInputItem {
    pub fn new(image: DynamicImage, prompt_type: PromptType) -> Self {
        Self {
            image,
            prompt: None,
            prompt_type,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub raw: String,
    /// Number of generated tokens, prompt excluded.
    pub token_count: usize,
    pub error: bool,
}

pub type VisionLanguageInput = BatchInputItem;
pub type VisionLanguageOutput = GenerationResult;
pub type VisionLanguageModel = AIModel<VisionLanguageInput, VisionLanguageOutput>;
