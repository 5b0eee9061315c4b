//! Agent chat client.
//!
//! Agents answer in a single phase: one POST carries the prompt and the
//! full response comes back synchronously (the platform hides its own
//! polling). The client wraps the call in the retry engine, classifies
//! failures into the response envelope, runs the result-handler pipeline
//! on success and cooperates with [`crate::conversation`] scopes to keep
//! multi-turn context without manual id threading.
//!
//! `chat` and `chat_many` never fail with an `Err`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::batch;
use crate::config::{self, AgentConfig};
use crate::conversation;
use crate::handlers::{RawResultHandler, ResultContext, ResultHandler};
use crate::retry::RetryPolicy;
use crate::transport::{EnvironmentAwareTransport, HttpTransport};
use crate::Result;

// ======================
// Data models
// ======================

/// Outcome classification of a chat call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStatus {
    /// The Agent answered.
    Success,
    /// Client-side error (HTTP error, network issue, handler failure).
    Error,
    /// The request timed out, including throttling-wait timeouts.
    Timeout,
}

impl std::fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatStatus::Success => write!(f, "SUCCESS"),
            ChatStatus::Error => write!(f, "ERROR"),
            ChatStatus::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// Token accounting reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChatTokenUsage {
    /// Tokens from the user prompt.
    pub user: u64,
    /// Tokens added by knowledge-source enrichment.
    pub enrichment: u64,
    /// Tokens in the generated output.
    pub output: u64,
}

impl ChatTokenUsage {
    pub fn total(&self) -> u64 {
        self.user + self.enrichment + self.output
    }
}

/// A chat request for an Agent.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// The message sent to the Agent.
    pub user_prompt: String,
    /// Caller-visible identifier; generated when not provided.
    pub id: String,
    /// Continue an existing conversation. Explicit ids win over an active
    /// conversation scope.
    pub conversation_id: Option<String>,
    /// Whether the server should keep conversation context.
    pub use_conversation: bool,
    /// Whether the Agent should consult its knowledge sources.
    pub use_knowledge_sources: bool,
    /// Whether knowledge-source ids should come back in the response.
    pub return_knowledge_sources: bool,
    /// Free-form metadata forwarded with the request.
    pub metadata: HashMap<String, Value>,
}

impl ChatRequest {
    pub fn new(user_prompt: impl Into<String>) -> Self {
        let user_prompt = user_prompt.into();
        assert!(!user_prompt.is_empty(), "User prompt cannot be empty");
        Self {
            user_prompt,
            id: Uuid::new_v4().to_string(),
            conversation_id: None,
            use_conversation: false,
            use_knowledge_sources: true,
            return_knowledge_sources: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self.use_conversation = true;
        self
    }

    pub fn with_use_conversation(mut self, use_conversation: bool) -> Self {
        self.use_conversation = use_conversation;
        self
    }

    pub fn with_knowledge_sources(mut self, use_knowledge_sources: bool) -> Self {
        self.use_knowledge_sources = use_knowledge_sources;
        self
    }

    pub fn with_return_knowledge_sources(mut self, return_knowledge_sources: bool) -> Self {
        self.return_knowledge_sources = return_knowledge_sources;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Body shape the chat endpoint expects.
    pub fn to_api_payload(&self) -> Value {
        let mut payload = json!({
            "user_prompt": self.user_prompt,
            "streaming": false,
            "use_conversation": self.use_conversation,
            "use_knowledge_sources": self.use_knowledge_sources,
            "return_knowledge_sources": self.return_knowledge_sources,
        });
        if let Some(conversation_id) = &self.conversation_id {
            payload["conversation_id"] = json!(conversation_id);
        }
        if !self.metadata.is_empty() {
            payload["metadata"] = json!(self.metadata);
        }
        payload
    }
}

/// Response envelope for a chat call.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The request that produced this response (conversation enrichment
    /// included).
    pub request: ChatRequest,
    pub status: ChatStatus,
    /// The Agent's raw reply text.
    pub message: Option<String>,
    /// Handler-processed result (the raw message under the default
    /// handler).
    pub result: Option<Value>,
    /// Why the Agent stopped generating.
    pub stop_reason: Option<String>,
    pub tokens: Option<ChatTokenUsage>,
    /// Id for continuing this conversation.
    pub conversation_id: Option<String>,
    /// Knowledge sources consulted, when requested.
    pub knowledge_sources: Vec<String>,
    pub error: Option<String>,
    /// Entire decoded response body.
    pub raw_response: Option<Value>,
}

impl ChatResponse {
    fn error(request: ChatRequest, error: impl Into<String>) -> Self {
        Self {
            request,
            status: ChatStatus::Error,
            message: None,
            result: None,
            stop_reason: None,
            tokens: None,
            conversation_id: None,
            knowledge_sources: Vec::new(),
            error: Some(error.into()),
            raw_response: None,
        }
    }

    fn timeout(request: ChatRequest, error: impl Into<String>) -> Self {
        Self {
            status: ChatStatus::Timeout,
            ..Self::error(request, error)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ChatStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == ChatStatus::Error
    }

    pub fn is_timeout(&self) -> bool {
        self.status == ChatStatus::Timeout
    }
}

// ======================
// Options
// ======================

/// Per-client options; unset values fall back to the configuration
/// registry.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Per-HTTP-call timeout.
    pub request_timeout: Duration,
    /// Retry budget for chat calls.
    pub max_retries: u32,
    /// Base for the exponential backoff between attempts.
    pub retry_initial_delay: Duration,
    /// Concurrency bound for `chat_many`.
    pub max_workers: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_initial_delay: Duration::from_millis(500),
            max_workers: 8,
        }
    }
}

impl AgentOptions {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            request_timeout: cfg.request_timeout.copied(),
            max_retries: cfg.retry_max_retries.copied(),
            retry_initial_delay: cfg.retry_initial_delay.copied(),
            max_workers: 8,
        }
    }
}

// ======================
// Client
// ======================

/// Client for chatting with a platform Agent.
///
/// ```rust,no_run
/// use stkai_sdk::{Agent, ChatRequest};
///
/// # async fn demo() {
/// let agent = Agent::new("my-agent-slug");
/// let response = agent.chat(ChatRequest::new("What is SOLID?")).await;
/// if response.is_success() {
///     println!("{}", response.message.as_deref().unwrap_or(""));
/// }
/// # }
/// ```
pub struct Agent {
    agent_id: String,
    base_url: String,
    options: AgentOptions,
    transport: Arc<dyn HttpTransport>,
    result_handler: Arc<dyn ResultHandler>,
}

/// Builder for [`Agent`]; unset options fall back to the configuration
/// registry.
pub struct AgentBuilder {
    agent_id: String,
    base_url: Option<String>,
    options: Option<AgentOptions>,
    transport: Option<Arc<dyn HttpTransport>>,
    result_handler: Option<Arc<dyn ResultHandler>>,
}

impl AgentBuilder {
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn options(mut self, options: AgentOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the default [`RawResultHandler`].
    pub fn result_handler(mut self, handler: Arc<dyn ResultHandler>) -> Self {
        self.result_handler = Some(handler);
        self
    }

    pub fn build(self) -> Agent {
        let cfg = config::current();
        let mut options = self.options.unwrap_or_else(|| AgentOptions::from_config(&cfg.agent));
        if options.max_workers == 0 {
            options.max_workers = 1;
        }
        Agent {
            agent_id: self.agent_id,
            base_url: self.base_url.unwrap_or_else(|| cfg.agent.base_url.get().clone()),
            options,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(EnvironmentAwareTransport::new())),
            result_handler: self.result_handler.unwrap_or_else(|| Arc::new(RawResultHandler)),
        }
    }
}

impl Agent {
    /// Client with registry defaults and the environment-aware transport.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self::builder(agent_id).build()
    }

    pub fn builder(agent_id: impl Into<String>) -> AgentBuilder {
        let agent_id = agent_id.into();
        assert!(!agent_id.is_empty(), "Agent ID cannot be empty");
        AgentBuilder {
            agent_id,
            base_url: None,
            options: None,
            transport: None,
            result_handler: None,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Send one message and wait for the Agent's reply.
    pub async fn chat(&self, request: ChatRequest) -> ChatResponse {
        self.do_chat(request).await
    }

    /// Send many messages with at most `max_workers` in flight.
    ///
    /// Responses come back in input order; worker panics become ERROR
    /// responses. Workers share the caller's conversation scope.
    pub async fn chat_many(&self, requests: Vec<ChatRequest>) -> Vec<ChatResponse> {
        if requests.is_empty() {
            return Vec::new();
        }
        info!(
            "Agent-Batch | Starting batch chat of {} requests (max_workers={}, agent='{}')",
            requests.len(),
            self.options.max_workers,
            self.agent_id
        );
        batch::execute_bounded(
            requests,
            self.options.max_workers,
            |request| self.do_chat(request),
            |request, message| {
                error!("{} | Agent | Batch worker panicked: {message}", short_id(&request.id));
                ChatResponse::error(request, format!("Batch worker panicked: {message}"))
            },
        )
        .await
    }

    async fn do_chat(&self, request: ChatRequest) -> ChatResponse {
        // An active conversation scope enriches requests that do not pin
        // an id themselves.
        let scope = conversation::current();
        let mut request = request;
        if let Some(conversation) = &scope {
            if request.conversation_id.is_none() {
                request.use_conversation = true;
                request.conversation_id = conversation.id();
            }
        }

        info!(
            "{} | Agent | Sending message to agent '{}'...",
            short_id(&request.id),
            self.agent_id
        );

        let url = format!(
            "{}/v1/agent/{}/chat",
            self.base_url.trim_end_matches('/'),
            self.agent_id
        );
        let payload = request.to_api_payload();
        let timeout = self.options.request_timeout;
        let policy = RetryPolicy::new(self.options.max_retries, self.options.retry_initial_delay);

        let outcome: Result<Value> = policy
            .run(|_ctx| {
                let transport = Arc::clone(&self.transport);
                let url = url.clone();
                let payload = payload.clone();
                async move {
                    let response = transport.post(&url, &payload, timeout).await?;
                    let response = response.error_for_status()?;
                    response.json::<Value>()
                }
            })
            .await;

        let data = match outcome {
            Ok(data) => data,
            Err(e) if e.is_timeout() => {
                error!("{} | Agent | Request timed out: {e}", short_id(&request.id));
                return ChatResponse::timeout(request, format!("Request timed out: {e}"));
            }
            Err(e) => {
                error!("{} | Agent | Request failed: {e}", short_id(&request.id));
                return ChatResponse::error(request, format!("Request failed: {e}"));
            }
        };

        let mut response = parse_success_response(request, data);

        // Handler pipeline runs on the raw reply; a handler failure flips
        // the outcome to ERROR.
        let handler_context = ResultContext::new(
            response.request.id.clone(),
            None,
            response.message.clone().map(Value::String).unwrap_or(Value::Null),
            response.raw_response.clone().unwrap_or(Value::Null),
        );
        match self.result_handler.handle(&handler_context) {
            Ok(processed) => response.result = Some(processed),
            Err(e) => {
                error!("{} | Agent | Result handler failed: {e}", short_id(&response.request.id));
                let mut failed = ChatResponse::error(
                    response.request,
                    format!("Error while processing the result: {e}"),
                );
                failed.raw_response = response.raw_response;
                return failed;
            }
        }

        // First successful response inside a scope donates its id.
        if let (Some(conversation), Some(conversation_id)) = (&scope, &response.conversation_id) {
            conversation.set_if_absent(conversation_id);
        }

        info!(
            "{} | Agent | Response received (tokens: {})",
            short_id(&response.request.id),
            response
                .tokens
                .map(|t| t.total().to_string())
                .unwrap_or_else(|| "N/A".to_string())
        );
        response
    }
}

fn parse_success_response(request: ChatRequest, data: Value) -> ChatResponse {
    let tokens = data.get("tokens").and_then(Value::as_object).map(|tokens| {
        let read = |key: &str| tokens.get(key).and_then(Value::as_u64).unwrap_or(0);
        ChatTokenUsage {
            user: read("user"),
            enrichment: read("enrichment"),
            output: read("output"),
        }
    });

    let message = data
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| data.get("result").and_then(Value::as_str))
        .map(str::to_string);

    let knowledge_sources = data
        .get("knowledge_sources")
        .or_else(|| data.get("knowledge_source_id"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    ChatResponse {
        request,
        status: ChatStatus::Success,
        message,
        result: None,
        stop_reason: data.get("stop_reason").and_then(Value::as_str).map(str::to_string),
        tokens,
        conversation_id: data
            .get("conversation_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        knowledge_sources,
        error: None,
        raw_response: Some(data),
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(26).collect()
}
