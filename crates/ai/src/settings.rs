use anyhow::{bail, Context};
use std::str::FromStr;

pub const DEFAULT_MODEL_CHECKPOINT: &str = "datalab-to/chandra";
pub const DEFAULT_MAX_OUTPUT_TOKENS: usize = 12384;
pub const DEFAULT_BBOX_SCALE: u32 = 1024;

/// Everything the loader and the generation driver read.
///
/// Built explicitly and passed around; `from_env` overlays the process environment
/// (after `.env` has been loaded) on top of the defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Hugging Face repo id (optionally `repo@revision`) or a local directory.
    pub model_checkpoint: String,
    pub max_output_tokens: usize,
    pub bbox_scale: u32,
    /// Pins every weight to this device (`cpu`, `cuda:1`, `metal`, ...).
    /// `None` lets the loader place the model within the memory limits below.
    pub device: Option<String>,
    pub use_8bit_quantization: bool,
    pub attn_implementation: Option<String>,
    pub max_batch_size: usize,
    pub accelerator_memory_gib: u64,
    pub host_memory_gib: u64,
    pub seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_checkpoint: DEFAULT_MODEL_CHECKPOINT.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            bbox_scale: DEFAULT_BBOX_SCALE,
            device: None,
            use_8bit_quantization: false,
            attn_implementation: None,
            max_batch_size: 8,
            accelerator_memory_gib: 11,
            host_memory_gib: 60,
            seed: 299792458,
        }
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut settings = Self::default();

        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref().trim();

            match key {
                "MODEL_CHECKPOINT" => {
                    if value.is_empty() {
                        bail!("MODEL_CHECKPOINT must not be empty");
                    }
                    settings.model_checkpoint = value.to_string();
                }
                "MAX_OUTPUT_TOKENS" => settings.max_output_tokens = parse(key, value)?,
                "BBOX_SCALE" => settings.bbox_scale = parse(key, value)?,
                "INFERENCE_DEVICE" => settings.device = optional(value),
                "USE_8BIT_QUANTIZATION" => settings.use_8bit_quantization = parse_bool(key, value)?,
                "ATTN_IMPLEMENTATION" => settings.attn_implementation = optional(value),
                "MAX_BATCH_SIZE" => settings.max_batch_size = parse(key, value)?,
                "ACCELERATOR_MEMORY_GIB" => settings.accelerator_memory_gib = parse(key, value)?,
                "HOST_MEMORY_GIB" => settings.host_memory_gib = parse(key, value)?,
                "GENERATION_SEED" => settings.seed = parse(key, value)?,
                _ => {}
            }
        }

        if settings.max_batch_size == 0 {
            bail!("MAX_BATCH_SIZE must be at least 1");
        }

        Ok(settings)
    }
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid value for {}: {:?}", key, value))
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid value for {}: {:?}", key, value),
    }
}

fn optional(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
