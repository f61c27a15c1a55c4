use ai::{
    prompts::PromptType, qwen3_vl::Qwen3VL, settings::Settings, AIModel, BatchInputItem,
    GenerationResult, VisionLanguageModel,
};
use anyhow::Context;
use clap::Parser;
use std::{path::PathBuf, process};

/// Runs page images through a Qwen3-VL checkpoint and prints the results as JSON.
///
/// Options override the environment (`MODEL_CHECKPOINT`, `MAX_OUTPUT_TOKENS`, ...),
/// which is read after `.env` has been loaded.
#[derive(Debug, Parser)]
#[command(name = "ocr-cli", version)]
struct Cli {
    /// Images to process, in output order.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Literal prompt used for every image instead of the registry template.
    #[arg(long)]
    prompt: Option<String>,

    #[arg(long, default_value_t = PromptType::OcrLayout)]
    prompt_type: PromptType,

    #[arg(long)]
    max_output_tokens: Option<usize>,

    #[arg(long)]
    bbox_scale: Option<u32>,

    /// Hub repo id (`repo[@revision]`) or local directory.
    #[arg(long)]
    checkpoint: Option<String>,

    /// `cpu`, `cuda[:N]` or `metal[:N]`. Unset places the model automatically.
    #[arg(long)]
    device: Option<String>,

    #[arg(long)]
    int8: bool,

    #[arg(long)]
    attn_implementation: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Write logs to `<dir>/app.log` instead of stderr.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) -> anyhow::Result<()> {
        if let Some(checkpoint) = &self.checkpoint {
            settings.model_checkpoint = checkpoint.clone();
        }
        if let Some(max_output_tokens) = self.max_output_tokens {
            settings.max_output_tokens = max_output_tokens;
        }
        if let Some(bbox_scale) = self.bbox_scale {
            settings.bbox_scale = bbox_scale;
        }
        if let Some(device) = &self.device {
            settings.device = Some(device.clone());
        }
        if self.int8 {
            settings.use_8bit_quantization = true;
        }
        if let Some(attn_implementation) = &self.attn_implementation {
            settings.attn_implementation = Some(attn_implementation.clone());
        }
        if let Some(batch_size) = self.batch_size {
            if batch_size == 0 {
                anyhow::bail!("--batch-size must be at least 1");
            }
            settings.max_batch_size = batch_size;
        }
        Ok(())
    }

    fn batch_items(&self) -> anyhow::Result<Vec<BatchInputItem>> {
        self.images
            .iter()
            .map(|path| {
                let image = ai::image::open(path)
                    .with_context(|| format!("failed to open image {}", path.display()))?;
                let item = BatchInputItem::new(image, self.prompt_type);
                Ok(match &self.prompt {
                    Some(prompt) => item.with_prompt(prompt.clone()),
                    None => item,
                })
            })
            .collect()
    }
}

#[tokio::main]
async fn main() {
    let Err(error) = run().await else {
        process::exit(0);
    };

    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!("ocr-cli failed: {:#}", error);
    } else {
        eprintln!("Error: {error:#}");
    }
    process::exit(1);
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.log_dir {
        Some(dir) => analytics_tracing::init_tracing_to_file(dir.clone()),
        None => analytics_tracing::init_tracing_to_stderr(),
    }

    let mut settings = Settings::from_env()?;
    cli.apply(&mut settings)?;
    tracing::debug!("settings: {:?}", settings);

    let items = cli.batch_items()?;
    let batch_size = settings.max_batch_size;

    let model: VisionLanguageModel = AIModel::new(
        "qwen3-vl",
        move || {
            let settings = settings.clone();
            async move { Qwen3VL::load(&settings) }
        },
        None,
    )?;

    let mut results: Vec<GenerationResult> = Vec::with_capacity(items.len());
    for chunk in items.chunks(batch_size) {
        for result in model.process(chunk.to_vec()).await? {
            results.push(result?);
        }
        tracing::info!("{}/{} images done", results.len(), items.len());
    }

    println!("{}", serde_json::to_string_pretty(&results)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn options_override_settings() {
        let cli = Cli::parse_from([
            "ocr-cli",
            "--prompt-type",
            "ocr",
            "--checkpoint",
            "/models/chandra",
            "--max-output-tokens",
            "512",
            "--device",
            "cuda:1",
            "--int8",
            "--batch-size",
            "3",
            "page.png",
        ]);
        assert_eq!(cli.prompt_type, PromptType::Ocr);
        assert_eq!(cli.images, vec![PathBuf::from("page.png")]);

        let mut settings = Settings::default();
        cli.apply(&mut settings).unwrap();
        assert_eq!(settings.model_checkpoint, "/models/chandra");
        assert_eq!(settings.max_output_tokens, 512);
        assert_eq!(settings.device.as_deref(), Some("cuda:1"));
        assert!(settings.use_8bit_quantization);
        assert_eq!(settings.max_batch_size, 3);
        assert_eq!(settings.bbox_scale, 1024);
    }

    #[test]
    fn unset_options_keep_settings() {
        let cli = Cli::parse_from(["ocr-cli", "a.png", "b.png"]);
        assert_eq!(cli.prompt_type, PromptType::OcrLayout);

        let mut settings = Settings::default();
        cli.apply(&mut settings).unwrap();
        assert_eq!(settings, Settings::default());

        let cli = Cli::parse_from(["ocr-cli", "--batch-size", "0", "a.png"]);
        assert!(cli.apply(&mut settings).is_err());
    }
}
