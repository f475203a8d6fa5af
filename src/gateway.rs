//! # Gateways
//!
//! Capability traits for the two external services the retrieval subsystem
//! depends on, plus the deadline/cancellation wrapper every call goes through.
//!
//! - [`EmbeddingGateway`]: text → fixed-length vectors, batched, order-preserving,
//!   exactly one vector per input.
//! - [`CompletionGateway`]: [`PromptContext`] → reply text.
//!
//! Implementations talking to an OpenAI-compatible API live in [`crate::api`];
//! tests script their own.
//!
//! Calls are never retried here. Each one is bounded by [`with_deadline`],
//! which turns an elapsed timeout into [`RagError::Gateway`] and a fired
//! [`CancellationToken`] into [`RagError::Cancelled`].

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RagError, Result};
use crate::session::PromptContext;
use crate::vector_store::Embedding;

/// Service name carried by embedding failures.
pub const EMBEDDING: &str = "embedding";

/// Service name carried by completion failures.
pub const COMPLETION: &str = "completion";

/// Maps texts to embedding vectors.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    /// Embed `texts`, returning one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

/// Maps a composed prompt to a generated reply.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    async fn complete(&self, prompt: &PromptContext) -> Result<String>;
}

/// Run a gateway call under a timeout and a cancellation token.
///
/// Cancellation wins over completion when both are ready, so a query that was
/// cancelled never reports success.
///
/// # Errors
/// - [`RagError::Cancelled`] if `cancel` fires first (or already has).
/// - [`RagError::Gateway`] for `service` if `limit` elapses first.
/// - Whatever `call` itself returns.
pub async fn with_deadline<T, F>(
    service: &'static str,
    limit: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(RagError::Cancelled);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(service, "Gateway call cancelled");
            Err(RagError::Cancelled)
        }
        outcome = tokio::time::timeout(limit, call) => match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(service, timeout_ms = limit.as_millis() as u64, "Gateway call timed out");
                Err(RagError::gateway(
                    service,
                    format!("timed out after {}ms", limit.as_millis()),
                ))
            }
        },
    }
}

/// Embed `texts` in consecutive batches of at most `batch_size`.
///
/// Each batch is one gateway call under [`with_deadline`]; `on_batch` is told
/// how many texts each finished batch covered.
///
/// # Errors
/// - [`RagError::Config`] if `batch_size` is zero.
/// - [`RagError::Gateway`] if a batch fails or does not return exactly one
///   vector per text.
/// - [`RagError::Cancelled`] if `cancel` fires.
pub async fn embed_in_batches(
    gateway: &dyn EmbeddingGateway,
    texts: &[String],
    batch_size: usize,
    limit: Duration,
    cancel: &CancellationToken,
    mut on_batch: impl FnMut(usize),
) -> Result<Vec<Embedding>> {
    if batch_size == 0 {
        return Err(RagError::Config("embedding batch size must be at least 1".into()));
    }

    let mut vectors = Vec::with_capacity(texts.len());
    for (n, batch) in texts.chunks(batch_size).enumerate() {
        let embedded = with_deadline(EMBEDDING, limit, cancel, gateway.embed(batch)).await?;
        if embedded.len() != batch.len() {
            return Err(RagError::gateway(
                EMBEDDING,
                format!(
                    "batch {n}: expected {} vectors, got {}",
                    batch.len(),
                    embedded.len()
                ),
            ));
        }
        debug!(batch = n, size = batch.len(), "Embedded batch");
        vectors.extend(embedded);
        on_batch(batch.len());
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records batch sizes and returns `[len, index]` vectors.
    #[derive(Default)]
    struct RecordingEmbedder {
        batches: Mutex<Vec<usize>>,
        short_by: usize,
    }

    #[async_trait]
    impl EmbeddingGateway for RecordingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
            self.batches.lock().unwrap().push(texts.len());
            let keep = texts.len().saturating_sub(self.short_by);
            Ok(texts
                .iter()
                .take(keep)
                .map(|t| vec![t.chars().count() as f32, 0.0])
                .collect())
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    #[tokio::test]
    async fn test_embed_in_batches_slices_and_preserves_order() {
        let embedder = RecordingEmbedder::default();
        let input = texts(20);
        let mut progress = 0;

        let vectors = embed_in_batches(
            &embedder,
            &input,
            8,
            Duration::from_secs(5),
            &CancellationToken::new(),
            |n| progress += n,
        )
        .await
        .unwrap();

        assert_eq!(*embedder.batches.lock().unwrap(), vec![8, 8, 4]);
        assert_eq!(progress, 20);
        let lengths: Vec<f32> = vectors.iter().map(|v| v[0]).collect();
        let expected: Vec<f32> = (1..=20).map(|n| n as f32).collect();
        assert_eq!(lengths, expected);
    }

    #[tokio::test]
    async fn test_embed_in_batches_rejects_short_answers() {
        let embedder = RecordingEmbedder {
            short_by: 1,
            ..Default::default()
        };
        let err = embed_in_batches(
            &embedder,
            &texts(3),
            8,
            Duration::from_secs(5),
            &CancellationToken::new(),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::Gateway { service: EMBEDDING, .. }));
    }

    #[tokio::test]
    async fn test_embed_in_batches_rejects_zero_batch_size() {
        let err = embed_in_batches(
            &RecordingEmbedder::default(),
            &texts(3),
            0,
            Duration::from_secs(5),
            &CancellationToken::new(),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[tokio::test]
    async fn test_with_deadline_passes_results_through() {
        let token = CancellationToken::new();
        let ok = with_deadline(COMPLETION, Duration::from_secs(1), &token, async {
            Ok::<_, RagError>("reply")
        })
        .await
        .unwrap();
        assert_eq!(ok, "reply");

        let err = with_deadline(COMPLETION, Duration::from_secs(1), &token, async {
            Err::<(), _>(RagError::gateway(COMPLETION, "503"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "completion gateway error: 503");
    }

    #[tokio::test]
    async fn test_with_deadline_times_out() {
        let err = with_deadline(
            COMPLETION,
            Duration::from_millis(20),
            &CancellationToken::new(),
            std::future::pending::<Result<String>>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::Gateway { service: COMPLETION, .. }));
    }

    #[tokio::test]
    async fn test_with_deadline_honors_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let err = with_deadline(EMBEDDING, Duration::from_secs(5), &token, async {
            Ok::<_, RagError>(1)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::Cancelled));

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = with_deadline(
            EMBEDDING,
            Duration::from_secs(5),
            &token,
            std::future::pending::<Result<()>>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::Cancelled));
    }
}
