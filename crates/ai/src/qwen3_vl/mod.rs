//! Qwen3-VL vision-language generation on candle.
//!
//! [`Qwen3VL`] bundles the model with its processor. [`Qwen3VL::load`] builds it
//! from a checkpoint according to [`Settings`], and [`Qwen3VL::generate`] turns a
//! batch of images (with literal or registry prompts) into decoded text.

pub mod checkpoint;
pub mod message;
pub mod model;
pub mod placement;
pub mod processor;

#[cfg(test)]
mod testing;

use crate::{
    prompts::render_prompt,
    settings::Settings,
    traits::{BatchInputItem, GenerationResult, Model},
    utils::scale_to_fit,
};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen3_vl::{Config, Qwen3VLModel};
use checkpoint::CheckpointFiles;
use message::{collect_images, ContentBlock, Message};
use model::{row_budget, Generate, Qwen3VLGenerator};
use placement::{LoadPlan, Placement};
use processor::Qwen3VLProcessor;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Largest (width, height) an image is handed to the processor with.
pub const MAX_IMAGE_SIZE: (u32, u32) = (1536, 1024);

// room for prompt and image tokens on top of the output budget
const KV_CACHE_HEADROOM: usize = 8192;

pub struct Qwen3VL<M = Qwen3VLGenerator> {
    model: M,
    processor: Qwen3VLProcessor,
    max_output_tokens: usize,
    bbox_scale: u32,
    max_batch_size: usize,
}

impl<M: Generate> Qwen3VL<M> {
    pub fn new(model: M, processor: Qwen3VLProcessor, settings: &Settings) -> Self {
        Self {
            model,
            processor,
            max_output_tokens: settings.max_output_tokens,
            bbox_scale: settings.bbox_scale,
            max_batch_size: settings.max_batch_size,
        }
    }

    pub fn processor(&self) -> &Qwen3VLProcessor {
        &self.processor
    }

    /// Runs one batch. `max_output_tokens` of `None` uses the configured budget.
    ///
    /// Results come back in input order. Any failure fails the whole batch.
    pub fn generate(
        &mut self,
        batch: &[BatchInputItem],
        max_output_tokens: Option<usize>,
        bbox_scale: u32,
    ) -> anyhow::Result<Vec<GenerationResult>> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        let requested_tokens = max_output_tokens.unwrap_or(self.max_output_tokens);
        let messages: Vec<Message> = batch
            .iter()
            .map(|item| process_batch_element(item, bbox_scale))
            .collect();

        let texts = self.processor.apply_chat_template(&messages, true);
        let images = collect_images(&messages);
        let encoding = self
            .processor
            .encode_batch(&texts, &images)?
            .to_device(self.model.device())?;
        let inputs = encoding.input_rows()?;
        let seq_len = inputs.first().map(Vec::len).unwrap_or(0);

        let max_new_tokens = row_budget(requested_tokens, seq_len, self.model.max_positions());
        if max_new_tokens < requested_tokens {
            if max_new_tokens == 0 {
                anyhow::bail!(
                    "prompt of {} tokens leaves no room for output within {:?} positions",
                    seq_len,
                    self.model.max_positions()
                );
            }
            warn!(
                "capping output at {} tokens, {} requested does not fit the cache after {} prompt tokens",
                max_new_tokens, requested_tokens, seq_len
            );
        }

        debug!(
            "generating for {} items, {} input tokens per row, up to {} new tokens",
            batch.len(),
            seq_len,
            max_new_tokens
        );

        let outputs = self.model.generate(&encoding, max_new_tokens)?;
        if outputs.len() != inputs.len() {
            anyhow::bail!(
                "backend returned {} sequences for {} inputs",
                outputs.len(),
                inputs.len()
            );
        }

        let trimmed: Vec<Vec<u32>> = outputs
            .into_iter()
            .zip(&inputs)
            .map(|(output, input)| output.get(input.len()..).unwrap_or_default().to_vec())
            .collect();
        let decoded = self.processor.batch_decode(&trimmed)?;

        Ok(decoded
            .into_iter()
            .zip(&trimmed)
            .map(|(raw, tokens)| GenerationResult {
                raw,
                token_count: tokens.len(),
                error: false,
            })
            .collect())
    }
}

/// The chat message for one item: the downscaled image, then the prompt.
pub fn process_batch_element(item: &BatchInputItem, bbox_scale: u32) -> Message {
    let prompt = match item.prompt.as_deref() {
        Some(prompt) if !prompt.is_empty() => prompt.to_string(),
        _ => render_prompt(item.prompt_type, bbox_scale),
    };

    Message::user(vec![
        ContentBlock::Image {
            image: scale_to_fit(&item.image, MAX_IMAGE_SIZE),
        },
        ContentBlock::Text { text: prompt },
    ])
}

impl Qwen3VL<Qwen3VLGenerator> {
    pub fn load(settings: &Settings) -> anyhow::Result<Self> {
        let start = Instant::now();
        let plan = LoadPlan::from_settings(settings, candle_core::utils::cuda_is_available())?;
        let files = CheckpointFiles::resolve(&settings.model_checkpoint)?;

        let mut config_value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&files.config)?)?;
        let stored_bytes = stored_dtype_bytes(&config_value);
        if let (Some(attn_implementation), Some(object)) = (
            plan.attn_implementation.as_ref(),
            config_value.as_object_mut(),
        ) {
            object.insert(
                "attn_implementation".to_string(),
                serde_json::Value::String(attn_implementation.clone()),
            );
        }
        let mut config: Config = serde_json::from_value(config_value)?;

        let max_positions = settings.max_output_tokens + KV_CACHE_HEADROOM;
        if config.text_config.max_position_embeddings > max_positions {
            debug!(
                "capping max_position_embeddings from {} to {}",
                config.text_config.max_position_embeddings, max_positions
            );
            config.text_config.max_position_embeddings = max_positions;
        }

        let weight_bytes =
            files.weights_size()? * plan.dtype.size_in_bytes() as u64 / stored_bytes;
        let placement = plan.placement(weight_bytes, Placement::detect_accelerator())?;
        let device = placement.device()?;

        if let Some(int8) = &plan.quantization {
            warn!(
                "8-bit weights are not available, loading {:?} weights instead (outlier threshold {})",
                plan.dtype, int8.threshold
            );
        }
        info!(
            "loading {} on {} as {:?} ({} weight files)",
            settings.model_checkpoint,
            placement,
            plan.dtype,
            files.weights.len()
        );

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, plan.dtype, &device)? };
        let model = Qwen3VLModel::new(&config, vb)?;
        let processor =
            Qwen3VLProcessor::from_files(&files.tokenizer, files.preprocessor_config.as_deref())?;

        let tokens = processor.special_tokens();
        let stop_tokens = vec![tokens.im_end, tokens.pad];
        let generator =
            Qwen3VLGenerator::new(model, config, device, plan.dtype, stop_tokens, settings.seed);

        info!(
            "{} loaded in {:?}",
            settings.model_checkpoint,
            start.elapsed()
        );

        Ok(Self::new(generator, processor, settings))
    }
}

// bytes per weight as stored in the checkpoint, 16-bit unless stated otherwise
fn stored_dtype_bytes(config: &serde_json::Value) -> u64 {
    let dtype = ["torch_dtype", "dtype"].iter().find_map(|key| {
        config
            .get(key)
            .or_else(|| config.get("text_config").and_then(|c| c.get(key)))
            .and_then(|v| v.as_str())
    });

    match dtype {
        Some("float32") => 4,
        Some("float64") => 8,
        Some("int8") | Some("uint8") => 1,
        _ => 2,
    }
}

impl<M: Generate + Send> Model for Qwen3VL<M> {
    type Item = BatchInputItem;
    type Output = GenerationResult;

    async fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
        if items.len() > self.batch_size_limit() {
            anyhow::bail!(
                "too many items, at most {} items can be processed at a time",
                self.batch_size_limit()
            );
        }

        let bbox_scale = self.bbox_scale;
        let results = self.generate(&items, None, bbox_scale)?;
        Ok(results.into_iter().map(Ok).collect())
    }

    fn batch_size_limit(&self) -> usize {
        self.max_batch_size
    }
}
