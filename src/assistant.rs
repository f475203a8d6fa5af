//! # Dialogue manager
//!
//! Runs one query end to end:
//!
//! ```text
//! Idle → Embedding → Retrieving → Composing → AwaitingCompletion → Recording → Idle
//!            │                                       │
//!            └──────────────► Failed ◄───────────────┘
//! ```
//!
//! The session is only touched in `Recording`, the last step, so every failure
//! (gateway error, timeout, cancellation, malformed output) leaves both the
//! session and the index exactly as they were. Retrieval itself never fails a
//! query: an empty index simply yields no passages.
//!
//! One manager can serve many sessions concurrently; each session must have at
//! most one query in flight, which `&mut ConversationSession` enforces.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RagError, Result};
use crate::gateway::{COMPLETION, CompletionGateway, EMBEDDING, EmbeddingGateway, with_deadline};
use crate::session::ConversationSession;
use crate::vector_store::SharedIndex;

/// Default retrieval depth.
pub const DEFAULT_TOP_K: usize = 5;

/// Default deadline for each gateway call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Steps of the query protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Idle,
    Embedding,
    Retrieving,
    Composing,
    AwaitingCompletion,
    Recording,
    Failed,
}

/// How one query ran: every state it passed through, and its result.
///
/// `states` starts with `Idle` and ends with `Idle` on success or `Failed` on
/// error. Each outcome belongs to its own call, so concurrent queries on one
/// manager never see each other's progress.
#[derive(Debug)]
pub struct QueryOutcome {
    pub states: Vec<QueryState>,
    pub result: Result<String>,
}

impl QueryOutcome {
    pub fn final_state(&self) -> QueryState {
        self.states.last().copied().unwrap_or(QueryState::Idle)
    }

    /// The step the query was in when it failed, if it failed.
    pub fn failed_in(&self) -> Option<QueryState> {
        match self.states.as_slice() {
            [.., step, QueryState::Failed] => Some(*step),
            _ => None,
        }
    }
}

struct Trace(Vec<QueryState>);

impl Trace {
    fn enter(&mut self, state: QueryState) {
        debug!(state = ?state, "Query state");
        self.0.push(state);
    }

    fn fail(&mut self, err: RagError) -> RagError {
        let from = self.0.last().copied().unwrap_or(QueryState::Idle);
        warn!(state = ?from, error = %err, "Query failed");
        self.enter(QueryState::Failed);
        err
    }
}

/// Ties the gateways, the shared index and a session together for one query at a time.
pub struct DialogueManager {
    embedder: Arc<dyn EmbeddingGateway>,
    completer: Arc<dyn CompletionGateway>,
    index: SharedIndex,
    top_k: usize,
    timeout: Duration,
}

impl DialogueManager {
    pub fn new(
        embedder: Arc<dyn EmbeddingGateway>,
        completer: Arc<dyn CompletionGateway>,
        index: SharedIndex,
    ) -> Self {
        Self {
            embedder,
            completer,
            index,
            top_k: DEFAULT_TOP_K,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Deadline applied to each gateway call separately.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    /// Answer `query` within `session`.
    ///
    /// On success the (query, reply) pair is appended to `session` and the
    /// reply returned. On any error `session` is unchanged.
    ///
    /// # Errors
    /// - [`RagError::EmptyQuery`] before any gateway is contacted.
    /// - [`RagError::Gateway`] if a gateway fails, times out, or returns
    ///   malformed output (wrong vector count or dimension, empty reply).
    /// - [`RagError::Cancelled`] if `cancel` fires before the pair is recorded.
    pub async fn process_query(
        &self,
        session: &mut ConversationSession,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.run_query(session, query, cancel).await.result
    }

    /// [`process_query`](Self::process_query), also reporting the states the
    /// query went through.
    pub async fn run_query(
        &self,
        session: &mut ConversationSession,
        query: &str,
        cancel: &CancellationToken,
    ) -> QueryOutcome {
        let mut trace = Trace(Vec::with_capacity(7));
        let result = self.steps(session, query, cancel, &mut trace).await;
        QueryOutcome {
            states: trace.0,
            result,
        }
    }

    async fn steps(
        &self,
        session: &mut ConversationSession,
        query: &str,
        cancel: &CancellationToken,
        trace: &mut Trace,
    ) -> Result<String> {
        trace.enter(QueryState::Idle);
        if query.trim().is_empty() {
            return Err(trace.fail(RagError::EmptyQuery));
        }

        trace.enter(QueryState::Embedding);
        let batch = [query.to_string()];
        let mut vectors = with_deadline(EMBEDDING, self.timeout, cancel, self.embedder.embed(&batch))
            .await
            .map_err(|e| trace.fail(e))?;
        if vectors.len() != 1 {
            return Err(trace.fail(RagError::gateway(
                EMBEDDING,
                format!("expected 1 vector for the query, got {}", vectors.len()),
            )));
        }
        let vector = vectors.remove(0);

        trace.enter(QueryState::Retrieving);
        let retrieved = {
            let index = self.index.read().await;
            if let Some(dimension) = index.dimension() {
                if vector.len() != dimension {
                    return Err(trace.fail(RagError::gateway(
                        EMBEDDING,
                        format!(
                            "query embedding has {} dimensions, index has {dimension}",
                            vector.len()
                        ),
                    )));
                }
            }
            index
                .search(&vector, self.top_k)
                .map_err(|e| trace.fail(e))?
        };
        debug!(k = self.top_k, hits = retrieved.len(), "Retrieved passages");

        trace.enter(QueryState::Composing);
        let prompt = session.compose_prompt(query, &retrieved);

        trace.enter(QueryState::AwaitingCompletion);
        let reply = with_deadline(
            COMPLETION,
            self.timeout,
            cancel,
            self.completer.complete(&prompt),
        )
        .await
        .map_err(|e| trace.fail(e))?;
        if reply.trim().is_empty() {
            return Err(trace.fail(RagError::gateway(COMPLETION, "empty reply")));
        }
        if cancel.is_cancelled() {
            return Err(trace.fail(RagError::Cancelled));
        }

        trace.enter(QueryState::Recording);
        session.record(query, reply.clone());
        info!(
            query_len = query.chars().count(),
            hits = retrieved.len(),
            reply_len = reply.chars().count(),
            "Query answered"
        );

        trace.enter(QueryState::Idle);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PromptContext;
    use crate::vector_store::{Embedding, VectorIndex};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds every text as the same fixed vector.
    struct FixedEmbedder {
        vector: Embedding,
        calls: AtomicUsize,
        fail: bool,
    }

    impl FixedEmbedder {
        fn new(vector: Embedding) -> Self {
            Self {
                vector,
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl EmbeddingGateway for FixedEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RagError::gateway(EMBEDDING, "connection refused"));
            }
            Ok(texts.iter().map(|_| self.vector.clone()).collect())
        }
    }

    /// Replies with a scripted answer and keeps the prompts it was sent.
    struct ScriptedCompleter {
        reply: Result<String>,
        prompts: Mutex<Vec<PromptContext>>,
    }

    impl ScriptedCompleter {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err(RagError::gateway(COMPLETION, "HTTP 503")),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionGateway for ScriptedCompleter {
        async fn complete(&self, prompt: &PromptContext) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.clone());
            match &self.reply {
                Ok(reply) => Ok(reply.clone()),
                Err(e) => Err(RagError::gateway(COMPLETION, e.to_string())),
            }
        }
    }

    fn eye_index() -> SharedIndex {
        let mut index = VectorIndex::new();
        index
            .add(
                (0..8).map(|i| format!("passage {i}")).collect(),
                (0..8).map(|i| vec![i as f32, 0.0]).collect(),
            )
            .unwrap();
        index.into_shared()
    }

    fn manager(
        embedder: Arc<FixedEmbedder>,
        completer: Arc<ScriptedCompleter>,
        index: SharedIndex,
    ) -> DialogueManager {
        DialogueManager::new(embedder, completer, index).with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_successful_query_records_one_pair() {
        let embedder = Arc::new(FixedEmbedder::new(vec![2.2, 0.0]));
        let completer = Arc::new(ScriptedCompleter::replying("眼压升高是主要病因。"));
        let dm = manager(embedder, completer.clone(), eye_index());
        let mut session = ConversationSession::default();

        let reply = dm
            .process_query(&mut session, "青光眼的病因？", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply, "眼压升高是主要病因。");
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[0].content, "青光眼的病因？");
        assert_eq!(session.history()[1].content, reply);

        let prompts = completer.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].history.is_empty());
        // nearest first, top 5 of 8
        assert!(prompts[0].final_user_turn.ends_with(
            "[相关片段]:\npassage 2\npassage 3\npassage 1\npassage 4\npassage 0"
        ));
    }

    #[tokio::test]
    async fn test_history_is_sent_on_follow_up() {
        let embedder = Arc::new(FixedEmbedder::new(vec![0.0, 0.0]));
        let completer = Arc::new(ScriptedCompleter::replying("R"));
        let dm = manager(embedder, completer.clone(), eye_index()).with_top_k(1);
        let mut session = ConversationSession::default();
        let token = CancellationToken::new();

        dm.process_query(&mut session, "Q1", &token).await.unwrap();
        dm.process_query(&mut session, "Q2", &token).await.unwrap();

        let prompts = completer.prompts.lock().unwrap();
        assert_eq!(prompts[1].history, session.history()[..2].to_vec());
        assert_eq!(session.history().len(), 4);
    }

    #[tokio::test]
    async fn test_completion_failure_leaves_history_untouched() {
        let embedder = Arc::new(FixedEmbedder::new(vec![1.0, 0.0]));
        let completer = Arc::new(ScriptedCompleter::failing());
        let dm = manager(embedder, completer, eye_index());

        let mut session = ConversationSession::default();
        session.record("Q1", "R1");
        let before = session.history().to_vec();

        let err = dm
            .process_query(&mut session, "Q2", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RagError::Gateway { service: COMPLETION, .. }));
        assert_eq!(session.history(), before.as_slice());
    }

    #[tokio::test]
    async fn test_outcome_walks_every_state_on_success() {
        let embedder = Arc::new(FixedEmbedder::new(vec![1.0, 0.0]));
        let completer = Arc::new(ScriptedCompleter::replying("R"));
        let dm = manager(embedder, completer, eye_index());
        let mut session = ConversationSession::default();

        let outcome = dm
            .run_query(&mut session, "Q", &CancellationToken::new())
            .await;

        assert_eq!(outcome.result.unwrap(), "R");
        assert_eq!(
            outcome.states,
            vec![
                QueryState::Idle,
                QueryState::Embedding,
                QueryState::Retrieving,
                QueryState::Composing,
                QueryState::AwaitingCompletion,
                QueryState::Recording,
                QueryState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_sessions_report_their_own_outcome() {
        let embedder = Arc::new(FixedEmbedder::new(vec![1.0, 0.0]));
        let good = manager(
            embedder.clone(),
            Arc::new(ScriptedCompleter::replying("R")),
            eye_index(),
        );
        let bad = Arc::new(ScriptedCompleter::failing());
        let shared = DialogueManager::new(embedder, bad, good.index().clone());
        let token = CancellationToken::new();

        let mut first = ConversationSession::default();
        let mut second = ConversationSession::default();
        let (ok, failed) = tokio::join!(
            good.run_query(&mut first, "Q1", &token),
            shared.run_query(&mut second, "Q2", &token),
        );

        assert_eq!(ok.final_state(), QueryState::Idle);
        assert_eq!(ok.failed_in(), None);
        assert_eq!(failed.final_state(), QueryState::Failed);
        assert_eq!(failed.failed_in(), Some(QueryState::AwaitingCompletion));
        assert_eq!(first.history().len(), 2);
        assert!(second.history().is_empty());

        // one manager, two sessions, one query each
        let mut third = ConversationSession::default();
        let mut fourth = ConversationSession::default();
        let (answered, empty) = tokio::join!(
            good.run_query(&mut third, "Q3", &token),
            good.run_query(&mut fourth, "  ", &token),
        );
        assert_eq!(answered.final_state(), QueryState::Idle);
        assert_eq!(empty.failed_in(), Some(QueryState::Idle));
        assert!(matches!(empty.result, Err(RagError::EmptyQuery)));
    }

    #[tokio::test]
    async fn test_embedding_failure_skips_completion() {
        let embedder = Arc::new(FixedEmbedder {
            fail: true,
            ..FixedEmbedder::new(vec![1.0, 0.0])
        });
        let completer = Arc::new(ScriptedCompleter::replying("unused"));
        let dm = manager(embedder, completer.clone(), eye_index());
        let mut session = ConversationSession::default();

        let err = dm
            .process_query(&mut session, "Q", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RagError::Gateway { service: EMBEDDING, .. }));
        assert_eq!(completer.calls(), 0);
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_contacts_no_gateway() {
        let embedder = Arc::new(FixedEmbedder::new(vec![1.0, 0.0]));
        let completer = Arc::new(ScriptedCompleter::replying("unused"));
        let dm = manager(embedder.clone(), completer.clone(), eye_index());
        let mut session = ConversationSession::default();

        for query in ["", "   ", "\n\t"] {
            let err = dm
                .process_query(&mut session, query, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, RagError::EmptyQuery));
        }
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(completer.calls(), 0);
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn test_empty_index_still_answers() {
        let embedder = Arc::new(FixedEmbedder::new(vec![1.0, 0.0, 0.0]));
        let completer = Arc::new(ScriptedCompleter::replying("no material"));
        let dm = manager(embedder, completer.clone(), VectorIndex::new().into_shared());
        let mut session = ConversationSession::default();

        let reply = dm
            .process_query(&mut session, "how do I bake bread", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply, "no material");
        let prompts = completer.prompts.lock().unwrap();
        assert!(prompts[0].final_user_turn.ends_with("[相关片段]:\n"));
        assert!(prompts[0].system.contains(&session.template().refusal));
    }

    #[tokio::test]
    async fn test_cancelled_query_has_no_side_effects() {
        let embedder = Arc::new(FixedEmbedder::new(vec![1.0, 0.0]));
        let completer = Arc::new(ScriptedCompleter::replying("late"));
        let dm = manager(embedder.clone(), completer.clone(), eye_index());
        let mut session = ConversationSession::default();
        session.record("Q1", "R1");

        let token = CancellationToken::new();
        token.cancel();
        let err = dm.process_query(&mut session, "Q2", &token).await.unwrap_err();

        assert!(matches!(err, RagError::Cancelled));
        assert_eq!(session.history().len(), 2);
        assert_eq!(completer.calls(), 0);
        assert_eq!(dm.index().read().await.len(), 8);
    }

    #[tokio::test]
    async fn test_wrong_dimension_embedding_is_malformed_output() {
        let embedder = Arc::new(FixedEmbedder::new(vec![1.0, 0.0, 0.0]));
        let completer = Arc::new(ScriptedCompleter::replying("unused"));
        let dm = manager(embedder, completer.clone(), eye_index());
        let mut session = ConversationSession::default();

        let err = dm
            .process_query(&mut session, "Q", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RagError::Gateway { service: EMBEDDING, .. }));
        assert_eq!(completer.calls(), 0);
    }

    #[tokio::test]
    async fn test_blank_reply_is_malformed_output() {
        let embedder = Arc::new(FixedEmbedder::new(vec![1.0, 0.0]));
        let completer = Arc::new(ScriptedCompleter::replying("  \n"));
        let dm = manager(embedder, completer, eye_index());
        let mut session = ConversationSession::default();

        let err = dm
            .process_query(&mut session, "Q", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RagError::Gateway { service: COMPLETION, .. }));
        assert!(session.history().is_empty());
    }
}
