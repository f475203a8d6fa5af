//! Index construction from a source document.
//!
//! read → split into paragraphs → drop near-duplicates → embed in batches →
//! append to a fresh [`VectorIndex`] → save the artifact pair.
//!
//! Nothing is written unless every earlier step succeeded, so a failed
//! ingestion leaves a previously saved index in place.

use std::path::Path;

use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chunking::load_paragraphs;
use crate::config::IrisConfig;
use crate::error::Result;
use crate::gateway::{EmbeddingGateway, embed_in_batches};
use crate::similarity::SimilarityFilter;
use crate::vector_store::VectorIndex;

/// What an ingestion run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    /// Paragraphs found in the source.
    pub paragraphs: usize,
    /// Paragraphs left after deduplication, i.e. index entries.
    pub kept: usize,
    /// Embedding dimension of the index.
    pub dimension: Option<usize>,
}

/// Build the index for `source` and save it to `config.index_paths()`.
///
/// `progress` is advanced once per embedded paragraph; pass
/// [`ProgressBar::hidden`] when no terminal output is wanted.
///
/// # Errors
/// - [`RagError::Io`](crate::error::RagError::Io) /
///   [`RagError::Deserialization`](crate::error::RagError::Deserialization) reading the source.
/// - [`RagError::Gateway`](crate::error::RagError::Gateway) or
///   [`RagError::Cancelled`](crate::error::RagError::Cancelled) while embedding.
/// - [`RagError::DimensionMismatch`](crate::error::RagError::DimensionMismatch) if the
///   gateway's vectors do not have `config.embedding_dimension` entries.
/// - [`RagError::Io`](crate::error::RagError::Io) saving the artifacts.
pub async fn build_index(
    source: &Path,
    gateway: &dyn EmbeddingGateway,
    config: &IrisConfig,
    cancel: &CancellationToken,
    progress: ProgressBar,
) -> Result<(VectorIndex, IngestReport)> {
    let paragraphs = load_paragraphs(source)?;
    let filter = SimilarityFilter::new(config.similarity_threshold);
    let kept = filter.dedup(&paragraphs);

    info!(
        paragraphs = paragraphs.len(),
        kept = kept.len(),
        threshold = config.similarity_threshold,
        "Deduplicated source paragraphs"
    );

    progress.set_length(kept.len() as u64);
    let vectors = embed_in_batches(
        gateway,
        &kept,
        config.embedding_batch_size,
        config.request_timeout(),
        cancel,
        |n| progress.inc(n as u64),
    )
    .await;
    progress.finish_and_clear();
    let vectors = vectors?;

    let mut index = VectorIndex::with_dimension(config.embedding_dimension);
    let entries = kept.len();
    index.add(kept, vectors)?;
    index.set_approximate_search(config.approximate_search)?;
    index.save(&config.index_paths())?;

    let report = IngestReport {
        paragraphs: paragraphs.len(),
        kept: entries,
        dimension: index.dimension(),
    };
    info!(?report, "Ingestion complete");
    Ok((index, report))
}
