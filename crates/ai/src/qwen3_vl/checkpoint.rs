use anyhow::{bail, Context};
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::{
    collections::{BTreeSet, HashSet},
    path::{Path, PathBuf},
};
use tracing::debug;

const DEFAULT_REVISION: &str = "main";

/// Local paths of everything needed to build the model and its processor.
#[derive(Debug, Clone)]
pub struct CheckpointFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub preprocessor_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

impl CheckpointFiles {
    /// `checkpoint` is either a local directory or a hub repo id, optionally
    /// suffixed with `@revision`.
    pub fn resolve(checkpoint: &str) -> anyhow::Result<Self> {
        let path = Path::new(checkpoint);
        if path.is_dir() {
            Self::from_dir(path)
        } else {
            Self::from_hub(checkpoint)
        }
    }

    pub fn from_dir(dir: &Path) -> anyhow::Result<Self> {
        debug!("using local checkpoint {}", dir.display());
        Self::gather(|name| {
            let path = dir.join(name);
            Ok(path.is_file().then_some(path))
        })
    }

    pub fn from_hub(checkpoint: &str) -> anyhow::Result<Self> {
        let (repo_id, revision) = checkpoint
            .split_once('@')
            .unwrap_or((checkpoint, DEFAULT_REVISION));
        debug!("fetching {} at {} from the hub", repo_id, revision);

        let api = Api::new()?;
        let repo = api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        // the file listing tells a missing file apart from a failed download
        let listed: HashSet<String> = repo
            .info()
            .with_context(|| format!("failed to list files of {}", repo_id))?
            .siblings
            .into_iter()
            .map(|sibling| sibling.rfilename)
            .collect();

        Self::gather(|name| {
            if !listed.contains(name) {
                return Ok(None);
            }
            repo.get(name)
                .map(Some)
                .with_context(|| format!("failed to fetch {} from {}", name, repo_id))
        })
    }

    /// `fetch` yields `Ok(None)` only when the file does not exist; any other
    /// failure is passed through.
    fn gather<F>(mut fetch: F) -> anyhow::Result<Self>
    where
        F: FnMut(&str) -> anyhow::Result<Option<PathBuf>>,
    {
        let mut require = |name: &str| -> anyhow::Result<PathBuf> {
            fetch(name)?.ok_or_else(|| anyhow::anyhow!("{} not found in checkpoint", name))
        };
        let config = require("config.json")?;
        let tokenizer = require("tokenizer.json")?;

        let preprocessor_config = fetch("preprocessor_config.json")?;

        let weights = match fetch("model.safetensors.index.json")? {
            Some(index) => shard_names(&index)?
                .iter()
                .map(|name| {
                    fetch(name)?
                        .ok_or_else(|| anyhow::anyhow!("shard {} not found in checkpoint", name))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => vec![fetch("model.safetensors")?
                .ok_or_else(|| anyhow::anyhow!("model.safetensors not found in checkpoint"))?],
        };

        Ok(Self {
            config,
            tokenizer,
            preprocessor_config,
            weights,
        })
    }

    /// Bytes on disk across all weight files.
    pub fn weights_size(&self) -> anyhow::Result<u64> {
        let mut total = 0;
        for path in &self.weights {
            total += std::fs::metadata(path)
                .with_context(|| format!("failed to stat {}", path.display()))?
                .len();
        }
        Ok(total)
    }
}

/// Unique shard file names listed in a `model.safetensors.index.json`.
fn shard_names(index: &Path) -> anyhow::Result<BTreeSet<String>> {
    let content = std::fs::read_to_string(index)?;
    let index: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", index.display()))?;

    let Some(weight_map) = index.get("weight_map").and_then(|v| v.as_object()) else {
        bail!("no weight map in safetensors index");
    };

    Ok(weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(|v| v.to_string())
        .collect())
}
