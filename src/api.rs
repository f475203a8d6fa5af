//! # API Module
//!
//! Gateway implementations for OpenAI-compatible APIs and the two CLI
//! front-ends built on them.
//!
//! - [`OpenAiEmbeddings`]: `POST {api_base}/embeddings` through `reqwest`.
//! - [`OpenAiCompletion`]: chat completions through `async-openai`; the
//!   [`PromptContext`] becomes one system message, the history as alternating
//!   user/assistant messages, and the final user message.
//! - [`ask`]: answer one question against the persisted index.
//! - [`interactive_mode`]: a REPL over one [`ConversationSession`].
//!
//! # Example
//!
//! ```no_run
//! use iris_rag::api::ask;
//! use iris_rag::config::IrisConfig;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IrisConfig::new("sk-...", "https://api.openai.com/v1");
//! let reply = ask(&config, "青光眼有哪些早期症状？".to_string()).await?;
//! println!("{reply}");
//! # Ok(()) }
//! ```

use std::{
    error::Error,
    io::{BufRead, Write, stdout},
    sync::Arc,
};

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use crossterm::{
    ExecutableCommand,
    style::{Attribute, Color, Print, SetAttribute, SetForegroundColor},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    assistant::DialogueManager,
    config::IrisConfig,
    error::{RagError, Result},
    gateway::{COMPLETION, CompletionGateway, EMBEDDING, EmbeddingGateway},
    session::{ConversationSession, PromptContext, TurnRole},
    template::{PromptTemplate, load_template},
    vector_store::{Embedding, VectorIndex},
};

/// Words that end [`interactive_mode`].
const EXIT_WORDS: [&str; 3] = ["exit", "quit", "退出"];

/// Creates a new OpenAI API client from configuration.
///
/// # Parameters
/// - `config: &IrisConfig`: Configuration containing API base and key.
pub fn create_client(config: &IrisConfig) -> Client<OpenAIConfig> {
    let openai_config = OpenAIConfig::new()
        .with_api_key(config.api_key.clone())
        .with_api_base(config.api_base.clone());
    debug!("Client created for {}", config.api_base);
    Client::with_config(openai_config)
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Embedding,
}

/// Embedding gateway for `POST {api_base}/embeddings`.
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddings {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbeddings {
    pub fn new(config: &IrisConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}/embeddings", config.api_base.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.embedding_model.clone(),
        }
    }
}

#[async_trait]
impl EmbeddingGateway for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            encoding_format: "float",
        };
        debug!(model = %self.model, inputs = texts.len(), "Requesting embeddings");

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::gateway(EMBEDDING, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RagError::gateway(EMBEDDING, format!("HTTP {status}: {detail}")));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::gateway(EMBEDDING, format!("malformed response: {e}")))?;

        parsed.data.sort_by_key(|item| item.index);
        let in_order = parsed
            .data
            .iter()
            .enumerate()
            .all(|(position, item)| item.index == position);
        if parsed.data.len() != texts.len() || !in_order {
            return Err(RagError::gateway(
                EMBEDDING,
                format!(
                    "expected {} embeddings indexed 0..{}, got {}",
                    texts.len(),
                    texts.len(),
                    parsed.data.len()
                ),
            ));
        }

        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

/// Completion gateway for chat completions.
#[derive(Debug, Clone)]
pub struct OpenAiCompletion {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompletion {
    pub fn new(config: &IrisConfig) -> Self {
        Self {
            client: create_client(config),
            model: config.chat_model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_completion_tokens,
        }
    }
}

/// Lay a prompt out as chat messages: system, history, final user turn.
pub fn prompt_messages(prompt: &PromptContext) -> Vec<ChatCompletionRequestMessage> {
    let mut messages = Vec::with_capacity(prompt.history.len() + 2);
    messages.push(ChatCompletionRequestMessage::System(
        ChatCompletionRequestSystemMessage {
            content: ChatCompletionRequestSystemMessageContent::Text(prompt.system.clone()),
            name: None,
        },
    ));

    for turn in &prompt.history {
        messages.push(match turn.role {
            TurnRole::User => user_message(turn.content.clone()),
            TurnRole::Assistant => assistant_message(turn.content.clone()),
        });
    }

    messages.push(user_message(prompt.final_user_turn.clone()));
    messages
}

fn user_message(content: String) -> ChatCompletionRequestMessage {
    ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
        content: ChatCompletionRequestUserMessageContent::Text(content),
        name: None,
    })
}

#[allow(deprecated)]
fn assistant_message(content: String) -> ChatCompletionRequestMessage {
    ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
        content: Some(ChatCompletionRequestAssistantMessageContent::Text(content)),
        name: None,
        refusal: None,
        audio: None,
        tool_calls: None,
        function_call: None,
    })
}

#[async_trait]
impl CompletionGateway for OpenAiCompletion {
    #[allow(deprecated)]
    async fn complete(&self, prompt: &PromptContext) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .messages(prompt_messages(prompt))
            .temperature(self.temperature)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(|e| RagError::gateway(COMPLETION, e.to_string()))?;

        debug!(model = %self.model, turns = prompt.history.len(), "Sending completion request");

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| RagError::gateway(COMPLETION, e.to_string()))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RagError::gateway(COMPLETION, "response carried no message content"))
    }
}

/// Build a [`DialogueManager`] over the persisted index and the configured gateways.
///
/// # Errors
/// Whatever [`VectorIndex::load`] reports, plus template loading errors when
/// `config.template` names one.
pub fn build_manager(config: &IrisConfig) -> Result<(DialogueManager, PromptTemplate)> {
    let mut index = VectorIndex::load(&config.index_paths())?;
    index.set_approximate_search(config.approximate_search)?;

    let template = match &config.template {
        Some(name) => load_template(name)?,
        None => PromptTemplate::default(),
    };

    let manager = DialogueManager::new(
        Arc::new(OpenAiEmbeddings::new(config)),
        Arc::new(OpenAiCompletion::new(config)),
        index.into_shared(),
    )
    .with_top_k(config.top_k)
    .with_timeout(config.request_timeout());

    Ok((manager, template))
}

fn print_reply(reply: &str) -> std::io::Result<()> {
    let mut stdout = stdout();
    stdout.execute(SetForegroundColor(Color::Blue))?;
    stdout.execute(SetAttribute(Attribute::Bold))?;
    stdout.execute(Print(reply))?;
    stdout.execute(SetAttribute(Attribute::Reset))?;
    stdout.execute(SetForegroundColor(Color::Reset))?;
    writeln!(stdout)?;
    stdout.flush()
}

/// Asks a single question against the persisted index and prints the reply.
///
/// # Returns
/// - `Result<String, Box<dyn Error>>`: The assistant's reply.
pub async fn ask(
    config: &IrisConfig,
    question: String,
) -> std::result::Result<String, Box<dyn Error>> {
    let (manager, template) = build_manager(config)?;
    let mut session = ConversationSession::new(template)
        .with_history_token_budget(config.history_token_budget);

    let reply = manager
        .process_query(&mut session, &question, &CancellationToken::new())
        .await?;
    print_reply(&reply)?;
    Ok(reply)
}

/// Enters interactive conversation mode with the assistant.
///
/// Each line is one query; `exit`, `quit`, `退出` or end of input leave the
/// loop. A failed query is reported and the conversation continues with its
/// history unchanged.
pub async fn interactive_mode(config: &IrisConfig) -> std::result::Result<(), Box<dyn Error>> {
    let (manager, template) = build_manager(config)?;
    let mut session = ConversationSession::new(template)
        .with_history_token_budget(config.history_token_budget);

    println!("眼科医学知识助手：你好，我是眼科医学知识助手。你可以问我关于眼部疾病的问题，输入'退出'结束对话。");

    let stdin = std::io::stdin();
    loop {
        let mut stdout = stdout();
        stdout.execute(Print("\nYou: "))?;
        stdout.execute(SetForegroundColor(Color::Green))?;
        stdout.flush()?;

        let mut input = String::new();
        let read = stdin.lock().read_line(&mut input)?;
        stdout.execute(SetForegroundColor(Color::Reset))?;

        let input = input.trim();
        if read == 0 || EXIT_WORDS.contains(&input.to_lowercase().as_str()) {
            break;
        }
        if input.is_empty() {
            continue;
        }

        match manager
            .process_query(&mut session, input, &CancellationToken::new())
            .await
        {
            Ok(reply) => print_reply(&reply)?,
            Err(e) => {
                eprintln!("Error: {e}");
                continue;
            }
        }
    }

    println!("对话已结束");
    Ok(())
}
