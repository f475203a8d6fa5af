//! This module provides functionality for loading and validating the application's configuration.
//!
//! It defines the [`IrisConfig`] struct, which holds the API credentials, model names and
//! retrieval parameters, and a [`load_config`] function to load it from a YAML file.
//!
//! Only `api_key` and `api_base` are required; every other field falls back to the
//! defaults below when it is missing from the file.
//!
//! | field | default |
//! |---|---|
//! | `chat_model` | `gpt-4o-mini` |
//! | `embedding_model` | `text-embedding-3-large` |
//! | `embedding_dimension` | `3072` |
//! | `embedding_batch_size` | `8` |
//! | `top_k` | `5` |
//! | `similarity_threshold` | `0.85` |
//! | `temperature` | `0.3` |
//! | `max_completion_tokens` | `400` |
//! | `request_timeout_secs` | `60` |
//! | `index_dir` | `<config_dir>/vector_store` |
//! | `index_name` | `eye_disease` |
//! | `approximate_search` | `false` |
//!
//! # Examples
//!
//! ```no_run
//! use iris_rag::config::{IrisConfig, load_config};
//! use std::path::Path;
//!
//! let config: IrisConfig = load_config(Path::new("/path/to/config.yaml")).unwrap();
//! println!("{:?}", config);
//! ```

use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RagError, Result};
use crate::vector_store::IndexPaths;

/// Represents the application's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct IrisConfig {
    /// The API key used to authenticate requests to the API.
    pub api_key: String,

    /// The base URL of the OpenAI-compatible API, e.g. `https://api.openai.com/v1`.
    pub api_base: String,

    /// Model used for chat completions.
    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    /// Model used for embeddings.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Length of every embedding vector the index accepts.
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    // Texts per embedding request during ingestion
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,

    /// Number of passages retrieved per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Deduplication threshold θ; passages scoring above it are dropped.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_completion_tokens")]
    pub max_completion_tokens: u32,

    /// Deadline for each embedding or completion call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Directory holding the persisted index artifacts.
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,

    /// Base name of the persisted index artifacts.
    #[serde(default = "default_index_name")]
    pub index_name: String,

    /// Use the HNSW index instead of the exact scan.
    #[serde(default)]
    pub approximate_search: bool,

    /// Token budget for the history part of a prompt (cl100k_base).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_token_budget: Option<usize>,

    /// Name of a prompt template under `<config_dir>/templates/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}

fn default_embedding_dimension() -> usize {
    3072
}

fn default_embedding_batch_size() -> usize {
    8
}

fn default_top_k() -> usize {
    5
}

fn default_similarity_threshold() -> f64 {
    crate::similarity::DEFAULT_THRESHOLD
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_completion_tokens() -> u32 {
    400
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_index_dir() -> PathBuf {
    crate::config_dir()
        .map(|dir| dir.join("vector_store"))
        .unwrap_or_else(|_| PathBuf::from("vector_store"))
}

fn default_index_name() -> String {
    "eye_disease".to_string()
}

impl IrisConfig {
    /// A configuration with the given credentials and every other field at its default.
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: api_base.into(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_dimension: default_embedding_dimension(),
            embedding_batch_size: default_embedding_batch_size(),
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            temperature: default_temperature(),
            max_completion_tokens: default_max_completion_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            index_dir: default_index_dir(),
            index_name: default_index_name(),
            approximate_search: false,
            history_token_budget: None,
            template: None,
        }
    }

    /// Reject values the retrieval pipeline cannot run with.
    ///
    /// # Errors
    /// [`RagError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(RagError::Config("top_k must be at least 1".into()));
        }
        if self.embedding_batch_size == 0 {
            return Err(RagError::Config(
                "embedding_batch_size must be at least 1".into(),
            ));
        }
        if self.embedding_dimension == 0 {
            return Err(RagError::Config(
                "embedding_dimension must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(RagError::Config(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Where the index artifact pair lives.
    pub fn index_paths(&self) -> IndexPaths {
        IndexPaths::new(&self.index_dir, &self.index_name)
    }
}

/// Loads and validates the application's configuration from a YAML file.
///
/// # Parameters
/// - `file`: The path to the YAML configuration file.
///
/// # Returns
/// - `Ok(IrisConfig)`: The loaded configuration.
/// - `Err(RagError::Io)`: The file could not be read.
/// - `Err(RagError::Config)`: The YAML is malformed or a value is out of range.
pub fn load_config(file: &Path) -> Result<IrisConfig> {
    debug!("Loading config: {}", file.display());
    let content = fs::read_to_string(file).map_err(|e| RagError::io(file, e))?;
    let config: IrisConfig = serde_yaml::from_str(&content)
        .map_err(|e| RagError::Config(format!("{}: {e}", file.display())))?;
    config.validate()?;
    Ok(config)
}
