//! # Conversation session
//!
//! One dialogue's ordered turn history and the prompt built from it.
//!
//! A [`ConversationSession`] only ever grows by whole (user, assistant) pairs
//! through [`ConversationSession::record`], so its history always has even
//! length and strictly alternating roles starting with the user. Nothing here
//! talks to a gateway; [`DialogueManager`](crate::assistant::DialogueManager)
//! decides when a pair is recorded.
//!
//! ## Prompt layout
//! [`compose_prompt`](ConversationSession::compose_prompt) produces a
//! [`PromptContext`] of three parts, in order:
//! 1. the rendered system instruction of the session's [`PromptTemplate`],
//! 2. the prior history as alternating user/assistant turns,
//! 3. a final user turn holding the query verbatim and the retrieved passages,
//!    one per line, under the template's labels.
//!
//! With a history token budget set, the oldest pairs are left out of the
//! prompt (never out of the session) until the history fits; tokens are
//! counted with `cl100k_base`.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tiktoken_rs::{CoreBPE, cl100k_base};
use tracing::{debug, warn};

use crate::template::PromptTemplate;
use crate::vector_store::TextChunk;

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!("cl100k_base tokenizer unavailable, history budget disabled: {e}");
        None
    }
});

/// Who a turn came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// Everything the completion gateway needs for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    /// Rendered system instruction.
    pub system: String,
    /// Prior turns, oldest first.
    pub history: Vec<ConversationTurn>,
    /// Current query plus retrieved passages.
    pub final_user_turn: String,
}

/// Append-only turn history for a single dialogue.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    template: PromptTemplate,
    turns: Vec<ConversationTurn>,
    history_token_budget: Option<usize>,
}

impl Default for ConversationSession {
    fn default() -> Self {
        Self::new(PromptTemplate::default())
    }
}

impl ConversationSession {
    /// An empty session using `template` for every prompt.
    pub fn new(template: PromptTemplate) -> Self {
        Self {
            template,
            turns: Vec::new(),
            history_token_budget: None,
        }
    }

    /// Bound the history part of composed prompts to `budget` tokens.
    pub fn with_history_token_budget(mut self, budget: Option<usize>) -> Self {
        self.history_token_budget = budget;
        self
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    /// All turns so far, in chronological order.
    pub fn history(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// Number of completed (query, reply) exchanges.
    pub fn exchanges(&self) -> usize {
        self.turns.len() / 2
    }

    /// Build the prompt for `query` with the `retrieved` passages, nearest first.
    pub fn compose_prompt(&self, query: &str, retrieved: &[TextChunk]) -> PromptContext {
        PromptContext {
            system: self.template.render_system_prompt(),
            history: self.bounded_history().to_vec(),
            final_user_turn: self.template.render_user_turn(query, retrieved),
        }
    }

    /// Append a completed exchange: the user's `query`, then the assistant's `reply`.
    pub fn record(&mut self, query: impl Into<String>, reply: impl Into<String>) {
        self.turns.push(ConversationTurn::user(query));
        self.turns.push(ConversationTurn::assistant(reply));
        debug!(turns = self.turns.len(), "Recorded exchange");
    }

    /// The newest suffix of whole pairs that fits the token budget.
    fn bounded_history(&self) -> &[ConversationTurn] {
        let Some(budget) = self.history_token_budget else {
            return &self.turns;
        };
        let Some(bpe) = BPE.as_ref() else {
            return &self.turns;
        };

        let mut start = 0;
        let mut tokens: usize = self
            .turns
            .iter()
            .map(|turn| bpe.encode_with_special_tokens(&turn.content).len())
            .sum();
        while tokens > budget && start < self.turns.len() {
            tokens -= self.turns[start..start + 2]
                .iter()
                .map(|turn| bpe.encode_with_special_tokens(&turn.content).len())
                .sum::<usize>();
            start += 2;
        }

        if start > 0 {
            debug!(
                dropped_exchanges = start / 2,
                budget, "History trimmed to fit token budget"
            );
        }
        &self.turns[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: usize, text: &str) -> TextChunk {
        TextChunk {
            id,
            text: text.to_string(),
        }
    }

    fn assert_alternates(history: &[ConversationTurn]) {
        assert_eq!(history.len() % 2, 0);
        for (i, turn) in history.iter().enumerate() {
            let expected = if i % 2 == 0 {
                TurnRole::User
            } else {
                TurnRole::Assistant
            };
            assert_eq!(turn.role, expected, "turn {i}");
        }
    }

    #[test]
    fn test_new_session_is_empty() {
        let session = ConversationSession::default();
        assert!(session.history().is_empty());
        assert_eq!(session.exchanges(), 0);
    }

    #[test]
    fn test_record_appends_user_then_assistant() {
        let mut session = ConversationSession::default();
        session.record("Q1", "R1");
        assert_eq!(
            session.history(),
            &[ConversationTurn::user("Q1"), ConversationTurn::assistant("R1")]
        );

        session.record("Q2", "R2");
        assert_eq!(
            session.history(),
            &[
                ConversationTurn::user("Q1"),
                ConversationTurn::assistant("R1"),
                ConversationTurn::user("Q2"),
                ConversationTurn::assistant("R2"),
            ]
        );
    }

    #[test]
    fn test_history_alternates_after_many_records() {
        let mut session = ConversationSession::default();
        for i in 0..7 {
            session.record(format!("question {i}"), format!("answer {i}"));
            assert_alternates(session.history());
        }
        assert_eq!(session.exchanges(), 7);
    }

    #[test]
    fn test_compose_prompt_layout() {
        let mut session = ConversationSession::default();
        session.record("Q1", "R1");

        let prompt = session.compose_prompt(
            "青光眼的治疗原则？",
            &[chunk(4, "降低眼压是核心。"), chunk(0, "可选择药物或手术。")],
        );

        assert_eq!(prompt.system, session.template().render_system_prompt());
        assert_eq!(prompt.history, session.history());
        assert_eq!(
            prompt.final_user_turn,
            "[当前查询]: 青光眼的治疗原则？\n[相关片段]:\n降低眼压是核心。\n可选择药物或手术。"
        );
    }

    #[test]
    fn test_compose_prompt_does_not_touch_history() {
        let mut session = ConversationSession::default();
        session.record("Q1", "R1");
        let before = session.history().to_vec();

        let _ = session.compose_prompt("Q2", &[chunk(0, "passage")]);
        assert_eq!(session.history(), before.as_slice());
    }

    #[test]
    fn test_out_of_domain_query_routes_to_refusal() {
        let session = ConversationSession::default();
        let prompt = session.compose_prompt("how do I bake bread", &[]);

        let refusal = &session.template().refusal;
        assert!(prompt.system.contains(refusal.as_str()));
        assert!(prompt.final_user_turn.contains("how do I bake bread"));
    }

    #[test]
    fn test_token_budget_drops_oldest_pairs_from_prompt_only() {
        let mut session =
            ConversationSession::default().with_history_token_budget(Some(12));
        session.record("first question about cataract surgery", "first answer");
        session.record("second question", "second answer");
        session.record("third", "third");

        let prompt = session.compose_prompt("now", &[]);
        assert!(prompt.history.len() < session.history().len());
        assert_alternates(&prompt.history);
        assert_eq!(prompt.history.last(), session.history().last());
        assert_eq!(session.history().len(), 6);
    }

    #[test]
    fn test_zero_budget_sends_no_history() {
        let mut session = ConversationSession::default().with_history_token_budget(Some(0));
        session.record("Q1", "R1");
        assert!(session.compose_prompt("Q2", &[]).history.is_empty());
    }

    #[test]
    fn test_turn_role_serializes_lowercase() {
        let json = serde_json::to_string(&ConversationTurn::assistant("ok")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"ok"}"#);
        assert_eq!(TurnRole::User.as_str(), "user");
    }
}
