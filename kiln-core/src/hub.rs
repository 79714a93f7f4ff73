use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};

/// Access to the Hugging Face hub rooted at an explicit cache directory.
#[derive(Clone, Debug)]
pub struct Hub {
    api: Api,
}

impl Hub {
    pub fn new(cache_dir: &Path) -> Result<Self> {
        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir.to_path_buf())
            .with_progress(false)
            .build()
            .context("failed to create hf hub API")?;
        Ok(Self { api })
    }

    /// Resolves a model path to a local directory when one exists, otherwise to a
    /// hub repository.
    pub fn source(&self, model_path: &str) -> ModelSource {
        let path = Path::new(model_path);
        if path.is_dir() {
            ModelSource::Local(path.to_path_buf())
        } else {
            ModelSource::Remote {
                repo_id: model_path.to_string(),
                repo: self.api.model(model_path.to_string()),
            }
        }
    }

    /// Fetches a single file from a hub repository.
    pub fn file(&self, repo_id: &str, file: &str) -> Result<PathBuf> {
        self.api
            .model(repo_id.to_string())
            .get(file)
            .with_context(|| format!("failed to get {file} from {repo_id}"))
    }
}

pub enum ModelSource {
    Local(PathBuf),
    Remote { repo_id: String, repo: ApiRepo },
}

impl ModelSource {
    pub fn name(&self) -> String {
        match self {
            ModelSource::Local(dir) => dir.display().to_string(),
            ModelSource::Remote { repo_id, .. } => repo_id.clone(),
        }
    }

    pub fn get(&self, file: &str) -> Result<PathBuf> {
        match self {
            ModelSource::Local(dir) => {
                let path = dir.join(file);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(anyhow!("{} not found", path.display()))
                }
            }
            ModelSource::Remote { repo_id, repo } => repo
                .get(file)
                .with_context(|| format!("failed to get {file} from {repo_id}")),
        }
    }

    /// Returns the first of `candidates` that can be fetched.
    pub fn get_first(&self, candidates: &[&str]) -> Result<PathBuf> {
        let mut last_error = None;
        for candidate in candidates {
            match self.get(candidate) {
                Ok(path) => return Ok(path),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("no candidate files given")))
    }

    /// Returns a file only when it is already present in a local model directory.
    pub fn local_file(&self, file: &str) -> Option<PathBuf> {
        match self {
            ModelSource::Local(dir) => Some(dir.join(file)).filter(|p| p.is_file()),
            ModelSource::Remote { .. } => None,
        }
    }

    /// Fetches every shard listed in a safetensors index, falling back to a single
    /// unsharded file when the index is missing.
    pub fn safetensors(&self, index_file: &str, single_file: &str) -> Result<Vec<PathBuf>> {
        let index = match self.get(index_file) {
            Ok(index) => index,
            Err(_) => return Ok(vec![self.get(single_file)?]),
        };
        let json: serde_json::Value = serde_json::from_reader(
            File::open(&index).with_context(|| format!("failed to open {}", index.display()))?,
        )
        .with_context(|| format!("failed to parse {}", index.display()))?;
        let shards = shard_names(&json)
            .ok_or_else(|| anyhow!("no weight map in {}", index.display()))?;
        shards.iter().map(|shard| self.get(shard)).collect()
    }
}

fn shard_names(index: &serde_json::Value) -> Option<BTreeSet<String>> {
    let weight_map = index.get("weight_map")?.as_object()?;
    Some(
        weight_map
            .values()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
    )
}
