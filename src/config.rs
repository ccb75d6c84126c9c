use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::profile::DEFAULT_MIN_PROFILE_SIZE;
use crate::semantic::{DEFAULT_BATCH_SIZE, DEFAULT_MODEL, DEFAULT_TOP_K};
use crate::storage::BackendLocal;

const CONFIG_FILE_NAME: &str = "config.yaml";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Parse(#[from] serde_yml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Embedding model name (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_model")]
    pub model: String,

    /// Results returned when a query doesn't ask for a count
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Profile directory or places.sqlite to use instead of discovery
    #[serde(default)]
    pub profile_path: Option<PathBuf>,

    /// Smaller places.sqlite files are ignored during discovery
    #[serde(default = "default_min_profile_size")]
    pub min_profile_size_bytes: u64,

    #[serde(default = "default_batch_size")]
    pub embedding_batch_size: usize,

    /// Show a progress bar while the model downloads
    #[serde(default = "default_show_download_progress")]
    pub show_download_progress: bool,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            top_k: default_top_k(),
            profile_path: None,
            min_profile_size_bytes: default_min_profile_size(),
            embedding_batch_size: default_batch_size(),
            show_download_progress: default_show_download_progress(),
            listen_addr: default_listen_addr(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_min_profile_size() -> u64 {
    DEFAULT_MIN_PROFILE_SIZE
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_show_download_progress() -> bool {
    true
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".into()));
        }

        if self.top_k == 0 {
            return Err(ConfigError::Invalid("top_k must be greater than 0".into()));
        }

        if self.embedding_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "embedding_batch_size must be greater than 0".into(),
            ));
        }

        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "listen_addr must be an ip:port pair, got '{}'",
                self.listen_addr
            )));
        }

        Ok(())
    }

    /// Read `config.yaml` from `base_path`, creating it with defaults on
    /// first run.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        let store = BackendLocal::new(base_path)?;

        if !store.exists(CONFIG_FILE_NAME) {
            log::info!("writing default config to {}", base_path.display());
            store.write(
                CONFIG_FILE_NAME,
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let bytes = store.read(CONFIG_FILE_NAME)?;
        let config_str = String::from_utf8(bytes)
            .map_err(|_| ConfigError::Invalid("config file is not valid utf8".into()))?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case new fields were added since the file was written
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let store = BackendLocal::new(&self.base_path)?;
        store.write(CONFIG_FILE_NAME, serde_yml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
