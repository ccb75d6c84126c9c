//! Wires configuration into a ready-to-use [`SearchPipeline`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use homedir::my_home;

use crate::config::Config;
use crate::profile::{HostEnv, ProfileLocator};
use crate::semantic::{EmbeddingError, FastEmbedder, SearchPipeline};

const BASE_PATH_ENV: &str = "MARKSEARCH_BASE_PATH";

/// Where marksearch keeps its config, index and model cache.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base: PathBuf,
}

impl AppPaths {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = my_home().context("could not determine home directory")?;
        Self::resolve(std::env::var_os(BASE_PATH_ENV), home)
    }

    fn resolve(env_value: Option<OsString>, home: Option<PathBuf>) -> anyhow::Result<Self> {
        let base = match env_value.filter(|value| !value.is_empty()) {
            Some(value) => PathBuf::from(value),
            None => home
                .context("home directory path is empty")?
                .join(".local")
                .join("share")
                .join("marksearch"),
        };

        Ok(Self { base })
    }
}

/// Build the pipeline described by `config`, persisting under `base_path`.
///
/// The model itself is not loaded until the first embedding is needed.
pub fn build_pipeline(config: &Config, base_path: &Path) -> Result<SearchPipeline, EmbeddingError> {
    let embedder = FastEmbedder::new(&config.model, base_path.to_path_buf())?
        .with_download_progress(config.show_download_progress);

    let locator = ProfileLocator::for_host(&HostEnv::current())
        .with_min_size(config.min_profile_size_bytes)
        .with_override(config.profile_path.clone());

    log::debug!(
        "pipeline: model '{}', {} profile roots, data in {}",
        config.model,
        locator.roots().len(),
        base_path.display()
    );

    Ok(SearchPipeline::new(Arc::new(embedder), locator, base_path.to_path_buf())
        .with_batch_size(config.embedding_batch_size))
}
