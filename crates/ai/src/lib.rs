#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod loader;
mod traits;

pub mod prompts;
pub mod qwen3_vl;
pub mod settings;
pub mod utils;

pub use image;
pub use tokenizers;
pub use traits::*;

use tokio::sync::oneshot;

pub type HandlerPayload<TItem, TOutput> = (
    Vec<TItem>,
    oneshot::Sender<anyhow::Result<Vec<anyhow::Result<TOutput>>>>,
);
