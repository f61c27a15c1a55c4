//! Text and vision preprocessing for Qwen3-VL checkpoints.
//!
//! Mirrors what the checkpoint's processor does: chat template rendering, dynamic
//! resolution patches for images, image placeholder expansion and left padded
//! tokenization.

use super::message::{ContentBlock, Message};
use anyhow::{anyhow, bail, Context};
use candle_core::{Device, Tensor};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use serde::Deserialize;
use std::{ops::Range, path::Path};
use tokenizers::Tokenizer;

pub const IM_START: &str = "<|im_start|>";
pub const IM_END: &str = "<|im_end|>";
pub const VISION_START: &str = "<|vision_start|>";
pub const VISION_END: &str = "<|vision_end|>";
pub const IMAGE_PAD: &str = "<|image_pad|>";
pub const PAD: &str = "<|endoftext|>";

const MAX_ASPECT_RATIO: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    pub patch_size: usize,
    pub temporal_patch_size: usize,
    pub merge_size: usize,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub min_pixels: usize,
    pub max_pixels: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            patch_size: 16,
            temporal_patch_size: 2,
            merge_size: 2,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
            min_pixels: 65536,
            max_pixels: 16777216,
        }
    }
}

#[derive(Deserialize)]
struct RawSize {
    shortest_edge: Option<usize>,
    longest_edge: Option<usize>,
}

// preprocessor_config.json, where `size.shortest_edge` / `size.longest_edge` are pixel counts
#[derive(Deserialize)]
struct RawProcessorConfig {
    patch_size: Option<usize>,
    temporal_patch_size: Option<usize>,
    merge_size: Option<usize>,
    image_mean: Option<[f32; 3]>,
    image_std: Option<[f32; 3]>,
    min_pixels: Option<usize>,
    max_pixels: Option<usize>,
    size: Option<RawSize>,
}

impl ProcessorConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let raw: RawProcessorConfig = serde_json::from_str(json)?;
        let default = Self::default();
        let size = raw.size.as_ref();

        Ok(Self {
            patch_size: raw.patch_size.unwrap_or(default.patch_size),
            temporal_patch_size: raw
                .temporal_patch_size
                .unwrap_or(default.temporal_patch_size),
            merge_size: raw.merge_size.unwrap_or(default.merge_size),
            image_mean: raw.image_mean.unwrap_or(default.image_mean),
            image_std: raw.image_std.unwrap_or(default.image_std),
            min_pixels: raw
                .min_pixels
                .or(size.and_then(|s| s.shortest_edge))
                .unwrap_or(default.min_pixels),
            max_pixels: raw
                .max_pixels
                .or(size.and_then(|s| s.longest_edge))
                .unwrap_or(default.max_pixels),
        })
    }

    fn factor(&self) -> usize {
        self.patch_size * self.merge_size
    }
}

/// Ids of the tokens the template and the generation loop rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub im_start: u32,
    pub im_end: u32,
    pub vision_start: u32,
    pub vision_end: u32,
    pub image_pad: u32,
    pub pad: u32,
}

impl SpecialTokens {
    pub fn from_tokenizer(tokenizer: &Tokenizer) -> anyhow::Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("tokenizer has no {} token", token))
        };

        Ok(Self {
            im_start: id(IM_START)?,
            im_end: id(IM_END)?,
            vision_start: id(VISION_START)?,
            vision_end: id(VISION_END)?,
            image_pad: id(IMAGE_PAD)?,
            pad: id(PAD)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ImageFeatures {
    /// `(patches, 3 * temporal_patch_size * patch_size²)`, f32 on the cpu.
    pub pixel_values: Tensor,
    pub grid_thw: [u32; 3],
    /// Language tokens the image occupies after the spatial merge.
    pub num_tokens: usize,
}

/// A tokenized batch, left padded so every row ends at the same position.
#[derive(Debug, Clone)]
pub struct BatchEncoding {
    /// `(batch, seq)` u32
    pub input_ids: Tensor,
    /// `(batch, seq)` u8, 0 over padding
    pub attention_mask: Tensor,
    /// One tensor per image, in batch order.
    pub pixel_values: Vec<Tensor>,
    /// `(images, 3)` u32
    pub image_grid_thw: Tensor,
    /// Which entries of `pixel_values` belong to each row.
    pub image_ranges: Vec<Range<usize>>,
}

impl BatchEncoding {
    pub fn batch_size(&self) -> usize {
        self.image_ranges.len()
    }

    pub fn to_device(self, device: &Device) -> anyhow::Result<Self> {
        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            attention_mask: self.attention_mask.to_device(device)?,
            pixel_values: self
                .pixel_values
                .iter()
                .map(|p| p.to_device(device))
                .collect::<candle_core::Result<Vec<_>>>()?,
            image_grid_thw: self.image_grid_thw.to_device(device)?,
            image_ranges: self.image_ranges,
        })
    }

    pub fn input_rows(&self) -> anyhow::Result<Vec<Vec<u32>>> {
        Ok(self.input_ids.to_vec2::<u32>()?)
    }

    pub fn attention_rows(&self) -> anyhow::Result<Vec<Vec<u8>>> {
        Ok(self.attention_mask.to_vec2::<u8>()?)
    }
}

pub struct Qwen3VLProcessor {
    tokenizer: Tokenizer,
    config: ProcessorConfig,
    tokens: SpecialTokens,
}

impl Qwen3VLProcessor {
    pub fn new(tokenizer: Tokenizer, config: ProcessorConfig) -> anyhow::Result<Self> {
        let tokens = SpecialTokens::from_tokenizer(&tokenizer)?;
        Ok(Self {
            tokenizer,
            config,
            tokens,
        })
    }

    pub fn from_files(
        tokenizer_path: impl AsRef<Path>,
        preprocessor_config_path: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path.as_ref())
            .map_err(|e| anyhow!("failed to load tokenizer: {}", e))?;

        let config = match preprocessor_config_path {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                ProcessorConfig::from_json(&json)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => ProcessorConfig::default(),
        };

        Self::new(tokenizer, config)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.tokens
    }

    /// Renders each message as its own single-turn conversation.
    pub fn apply_chat_template(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Vec<String> {
        messages
            .iter()
            .map(|message| {
                let mut text = format!("{}{}\n", IM_START, message.role);
                for block in &message.content {
                    match block {
                        ContentBlock::Image { .. } => {
                            text.push_str(VISION_START);
                            text.push_str(IMAGE_PAD);
                            text.push_str(VISION_END);
                        }
                        ContentBlock::Text { text: t } => text.push_str(t),
                    }
                }
                text.push_str(IM_END);
                text.push('\n');
                if add_generation_prompt {
                    text.push_str(IM_START);
                    text.push_str("assistant\n");
                }
                text
            })
            .collect()
    }

    pub fn preprocess_image(&self, image: &DynamicImage) -> anyhow::Result<ImageFeatures> {
        let config = &self.config;
        let (width, height) = image.dimensions();
        let (h, w) = smart_resize(
            height as usize,
            width as usize,
            config.factor(),
            config.min_pixels,
            config.max_pixels,
        )?;

        let rgb = if (w as u32, h as u32) == (width, height) {
            image.to_rgb8()
        } else {
            image
                .resize_exact(w as u32, h as u32, FilterType::CatmullRom)
                .to_rgb8()
        };

        let plane = h * w;
        let mut normalized = vec![0f32; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                normalized[c * plane + y as usize * w + x as usize] =
                    (pixel[c] as f32 / 255.0 - config.image_mean[c]) / config.image_std[c];
            }
        }

        let (p, t, m) = (
            config.patch_size,
            config.temporal_patch_size,
            config.merge_size,
        );
        let (grid_h, grid_w) = (h / p, w / p);
        let patch_dim = 3 * t * p * p;
        let mut patches = Vec::with_capacity(grid_h * grid_w * patch_dim);

        // merge blocks row-major, the m x m patches of a block contiguous;
        // inside a patch: channel, frame, row, column. A still image fills every frame.
        for bh in 0..grid_h / m {
            for bw in 0..grid_w / m {
                for sh in 0..m {
                    for sw in 0..m {
                        let (ph, pw) = (bh * m + sh, bw * m + sw);
                        for c in 0..3 {
                            for _ in 0..t {
                                for py in 0..p {
                                    let start = c * plane + (ph * p + py) * w + pw * p;
                                    patches.extend_from_slice(&normalized[start..start + p]);
                                }
                            }
                        }
                    }
                }
            }
        }

        let pixel_values = Tensor::from_vec(patches, (grid_h * grid_w, patch_dim), &Device::Cpu)?;

        Ok(ImageFeatures {
            pixel_values,
            grid_thw: [1, grid_h as u32, grid_w as u32],
            num_tokens: grid_h * grid_w / (m * m),
        })
    }

    /// Expands every image placeholder in `texts` to the number of tokens its
    /// image occupies, tokenizes, and left pads the rows to a common length.
    /// Images are consumed in order across the whole batch.
    pub fn encode_batch(
        &self,
        texts: &[String],
        images: &[&DynamicImage],
    ) -> anyhow::Result<BatchEncoding> {
        let features = images
            .iter()
            .map(|image| self.preprocess_image(image))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut next_image = 0;
        let mut rows = Vec::with_capacity(texts.len());
        let mut image_ranges = Vec::with_capacity(texts.len());

        for text in texts {
            let first_image = next_image;
            let mut expanded = String::with_capacity(text.len());
            let mut rest = text.as_str();

            while let Some(pos) = rest.find(IMAGE_PAD) {
                let Some(feature) = features.get(next_image) else {
                    bail!(
                        "batch has more image placeholders than images ({})",
                        features.len()
                    );
                };
                expanded.push_str(&rest[..pos]);
                expanded.push_str(&IMAGE_PAD.repeat(feature.num_tokens));
                rest = &rest[pos + IMAGE_PAD.len()..];
                next_image += 1;
            }
            expanded.push_str(rest);

            let encoding = self
                .tokenizer
                .encode(expanded, false)
                .map_err(|e| anyhow!(e))?;
            rows.push(encoding.get_ids().to_vec());
            image_ranges.push(first_image..next_image);
        }

        if next_image != features.len() {
            bail!(
                "batch has {} images but only {} image placeholders",
                features.len(),
                next_image
            );
        }

        let batch = rows.len();
        let seq_len = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for row in &rows {
            let padding = seq_len - row.len();
            ids.extend(std::iter::repeat(self.tokens.pad).take(padding));
            ids.extend_from_slice(row);
            mask.extend(std::iter::repeat(0u8).take(padding));
            mask.extend(std::iter::repeat(1u8).take(row.len()));
        }

        let grid: Vec<u32> = features.iter().flat_map(|f| f.grid_thw).collect();

        Ok(BatchEncoding {
            input_ids: Tensor::from_vec(ids, (batch, seq_len), &Device::Cpu)?,
            attention_mask: Tensor::from_vec(mask, (batch, seq_len), &Device::Cpu)?,
            image_grid_thw: Tensor::from_vec(grid, (features.len(), 3), &Device::Cpu)?,
            pixel_values: features.into_iter().map(|f| f.pixel_values).collect(),
            image_ranges,
        })
    }

    /// Decodes each sequence, dropping special tokens, without any cleanup pass.
    pub fn batch_decode(&self, sequences: &[Vec<u32>]) -> anyhow::Result<Vec<String>> {
        let sequences: Vec<&[u32]> = sequences.iter().map(Vec::as_slice).collect();
        self.tokenizer
            .decode_batch(&sequences, true)
            .map_err(|e| anyhow!("failed to decode: {}", e))
    }
}

/// Rounds `height` x `width` to multiples of `factor` while keeping the pixel count
/// within `min_pixels..=max_pixels` and the aspect ratio close to the original.
pub fn smart_resize(
    height: usize,
    width: usize,
    factor: usize,
    min_pixels: usize,
    max_pixels: usize,
) -> anyhow::Result<(usize, usize)> {
    if height == 0 || width == 0 {
        bail!("image has zero size ({}x{})", width, height);
    }
    if height.max(width) / height.min(width) > MAX_ASPECT_RATIO {
        bail!(
            "absolute aspect ratio must be smaller than {}, got {}x{}",
            MAX_ASPECT_RATIO,
            width,
            height
        );
    }

    let factor_f = factor as f64;
    let round = |x: usize| ((x as f64 / factor_f).round() as usize).max(1) * factor;
    let (mut h_bar, mut w_bar) = (round(height), round(width));

    if h_bar * w_bar > max_pixels {
        let beta = ((height * width) as f64 / max_pixels as f64).sqrt();
        h_bar = ((height as f64 / beta / factor_f).floor() as usize).max(1) * factor;
        w_bar = ((width as f64 / beta / factor_f).floor() as usize).max(1) * factor;
    } else if h_bar * w_bar < min_pixels {
        let beta = (min_pixels as f64 / (height * width) as f64).sqrt();
        h_bar = (height as f64 * beta / factor_f).ceil() as usize * factor;
        w_bar = (width as f64 * beta / factor_f).ceil() as usize * factor;
    }

    Ok((h_bar, w_bar))
}
