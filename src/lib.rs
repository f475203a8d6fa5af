//! # Iris (library root)
//!
//! Retrieval-augmented dialogue over an eye-disease corpus. The crate provides
//! the plumbing behind the `iris` CLI:
//!
//! - Near-duplicate passage filtering (`similarity`) and source splitting (`chunking`).
//! - A flat embedding index with exact k-NN search and paired persistence (`vector_store`).
//! - Embedding/completion capability traits and their deadlines (`gateway`), with
//!   OpenAI-compatible implementations (`api`).
//! - Conversation history and prompt composition (`session`, `template`).
//! - The end-to-end query protocol (`assistant`) and index construction (`ingest`).
//! - CLI parsing (`commands`), configuration (`config`) and errors (`error`).
//!
//! ## Query flow
//! ```text
//! query ─► EmbeddingGateway ─► VectorIndex::search (top k) ─► ConversationSession::compose_prompt
//!       ─► CompletionGateway ─► ConversationSession::record ─► reply
//! ```
//!
//! ## Ingestion flow
//! ```text
//! document ─► split_paragraphs ─► SimilarityFilter::dedup ─► embed (batched)
//!          ─► VectorIndex::add ─► VectorIndex::save
//! ```
//!
//! ## Modules
//! - [`api`], [`assistant`], [`chunking`], [`commands`], [`config`], [`error`],
//!   [`gateway`], [`ingest`], [`session`], [`similarity`], [`template`], [`vector_store`]

use directories::ProjectDirs;

pub mod api;
pub mod assistant;
pub mod chunking;
pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod session;
pub mod similarity;
pub mod template;
pub mod vector_store;

pub use error::{RagError, Result};

/// Return the per-platform configuration directory used by Iris.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "iris-rag", "iris")`, so you get the right place on each OS
/// (e.g., `~/.config/iris` on Linux,
/// `~/Library/Application Support/com.iris-rag.iris` on macOS).
///
/// The directory is **not** created by this function.
///
/// # Errors
/// [`RagError::Config`] if the platform configuration directory cannot be
/// determined (rare, but possible in heavily sandboxed environments).
///
/// # Examples
/// ```rust
/// let cfg = iris_rag::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<std::path::PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "iris-rag", "iris")
        .ok_or_else(|| RagError::Config("Unable to determine config directory".into()))?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
