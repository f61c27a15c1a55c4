//! Small stand-ins for the tokenizer and the generation backend.

use super::{
    model::Generate,
    processor::{BatchEncoding, ProcessorConfig, Qwen3VLProcessor},
};
use candle_core::Device;
use image::{DynamicImage, Rgb, RgbImage};
use std::{
    str::FromStr,
    sync::{Arc, Mutex},
};
use tokenizers::Tokenizer;

pub struct Ids {
    pub unk: u32,
    pub user: u32,
    pub assistant: u32,
    pub hello: u32,
    pub world: u32,
    pub pad: u32,
    pub im_start: u32,
    pub im_end: u32,
    pub vision_start: u32,
    pub vision_end: u32,
    pub image_pad: u32,
}

pub const IDS: Ids = Ids {
    unk: 0,
    user: 1,
    assistant: 2,
    hello: 3,
    world: 4,
    pad: 100,
    im_start: 101,
    im_end: 102,
    vision_start: 103,
    vision_end: 104,
    image_pad: 105,
};

const SPECIAL_TOKENS: [(&str, u32); 6] = [
    ("<|endoftext|>", IDS.pad),
    ("<|im_start|>", IDS.im_start),
    ("<|im_end|>", IDS.im_end),
    ("<|vision_start|>", IDS.vision_start),
    ("<|vision_end|>", IDS.vision_end),
    ("<|image_pad|>", IDS.image_pad),
];

/// Word level tokenizer with the Qwen chat and vision special tokens.
pub fn test_tokenizer() -> Tokenizer {
    let mut vocab = serde_json::json!({
        "[UNK]": IDS.unk,
        "user": IDS.user,
        "assistant": IDS.assistant,
        "hello": IDS.hello,
        "world": IDS.world,
    });
    let added_tokens: Vec<_> = SPECIAL_TOKENS
        .iter()
        .map(|(content, id)| {
            vocab[*content] = serde_json::json!(id);
            serde_json::json!({
                "id": id,
                "content": content,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true,
            })
        })
        .collect();

    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" },
    });

    Tokenizer::from_str(&json.to_string()).unwrap()
}

pub fn test_processor() -> Qwen3VLProcessor {
    let config = ProcessorConfig {
        min_pixels: 1024,
        ..Default::default()
    };
    Qwen3VLProcessor::new(test_tokenizer(), config).unwrap()
}

pub fn white_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([255, 255, 255])))
}

#[derive(Debug, Clone)]
pub struct GenerateCall {
    pub rows: Vec<Vec<u32>>,
    pub image_ranges: Vec<std::ops::Range<usize>>,
    pub max_new_tokens: usize,
}

/// Answers row `i` with `replies[i % replies.len()]`, cut at `max_new_tokens`.
pub struct ScriptedGenerator {
    replies: Vec<Vec<u32>>,
    pub calls: Arc<Mutex<Vec<GenerateCall>>>,
    device: Device,
    max_positions: Option<usize>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Vec<u32>>) -> Self {
        Self {
            replies,
            calls: Default::default(),
            device: Device::Cpu,
            max_positions: None,
        }
    }

    pub fn with_max_positions(mut self, max_positions: usize) -> Self {
        self.max_positions = Some(max_positions);
        self
    }
}

impl Generate for ScriptedGenerator {
    fn generate(
        &mut self,
        batch: &BatchEncoding,
        max_new_tokens: usize,
    ) -> anyhow::Result<Vec<Vec<u32>>> {
        let rows = batch.input_rows()?;
        self.calls.lock().unwrap().push(GenerateCall {
            rows: rows.clone(),
            image_ranges: batch.image_ranges.clone(),
            max_new_tokens,
        });

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, mut row)| {
                let reply = &self.replies[i % self.replies.len()];
                row.extend(reply.iter().take(max_new_tokens));
                row
            })
            .collect())
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn max_positions(&self) -> Option<usize> {
        self.max_positions
    }
}
