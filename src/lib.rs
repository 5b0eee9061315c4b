//! StackAI Rust SDK
//!
//! A client library for the StackAI platform's two execution surfaces:
//! Remote Quick Commands (RQC), long-running jobs behind a
//! create-then-poll protocol, and Agents, which answer a single chat
//! request synchronously.
//!
//! The SDK layers a composable HTTP pipeline between your code and the
//! network: authentication, optional client-side rate limiting (token
//! bucket or adaptive AIMD), retries with jittered exponential backoff and
//! `Retry-After` support, bounded-concurrency batch execution, and a
//! result-handler pipeline with lifecycle listeners.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use stkai_sdk::{RemoteQuickCommand, RqcRequest};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     stkai_sdk::config::configure(
//!         stkai_sdk::config::Overrides {
//!             auth: Some(stkai_sdk::config::AuthOverrides {
//!                 client_id: Some("my-client-id".into()),
//!                 client_secret: Some("my-client-secret".into()),
//!                 ..Default::default()
//!             }),
//!             ..Default::default()
//!         },
//!         true,
//!     )
//!     .expect("valid configuration");
//!
//!     let rqc = RemoteQuickCommand::new("my-quick-command");
//!     let request = RqcRequest::new(json!({"prompt": "Hello!"}));
//!     let response = rqc.execute(request).await;
//!     if response.is_completed() {
//!         println!("{:?}", response.result);
//!     } else {
//!         println!("failed: {:?}", response.error);
//!     }
//! }
//! ```
//!
//! `execute`, `execute_many`, `chat` and `chat_many` never fail with an
//! `Err`: every outcome, including network failures and timeouts, is
//! encoded in the returned response envelope.

pub mod agents;
pub mod auth;
mod batch;
pub mod config;
pub mod conversation;
pub mod handlers;
pub mod jitter;
pub mod listeners;
pub mod rate_limit;
pub mod retry;
pub mod rqc;
pub mod transport;

// Re-export main client types
pub use agents::{
    Agent, AgentBuilder, AgentOptions, ChatRequest, ChatResponse, ChatStatus, ChatTokenUsage,
};
pub use auth::{AuthProvider, ClientCredentialsAuthProvider, EnvHostCliProbe, HostCliProbe};
pub use config::{Config, ConfigSource, ConfigValue, RateLimitPreset, RateLimitStrategy};
pub use conversation::Conversation;
pub use handlers::{
    ChainedResultHandler, JsonResultHandler, RawResultHandler, ResultContext, ResultHandler,
};
pub use jitter::Jitter;
pub use listeners::{FileLoggingListener, ListenerContext, RqcEventListener};
pub use rate_limit::{AdaptiveTransport, TokenBucketTransport};
pub use retry::{RetryContext, RetryPolicy};
pub use rqc::{
    CreateExecutionOptions, GetResultOptions, RemoteQuickCommand, RemoteQuickCommandBuilder,
    RqcExecutionStatus, RqcRequest, RqcResponse,
};
pub use transport::{
    EnvironmentAwareTransport, HostCliTransport, HttpTransport, StandaloneTransport,
    TransportResponse,
};

/// SDK version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default base URL for the Remote Quick Command API
pub const DEFAULT_RQC_BASE_URL: &str = "https://genai-code-buddy-api.stackspot.com";

/// Default base URL for the Agent API
pub const DEFAULT_AGENT_BASE_URL: &str = "https://genai-inference-app.stackspot.com";

/// Default OAuth2 token endpoint for the client-credentials flow
pub const DEFAULT_TOKEN_URL: &str = "https://idm.stackspot.com/stackspot-dev/oidc/oauth/token";

/// Result type used throughout the SDK
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the SDK
///
/// Errors flow back up the transport decorator stack as values. The retry
/// engine classifies them via [`Error::is_retryable`]; the RQC and Agent
/// clients catch them at their boundary and fold them into response
/// envelopes, so none of these escape the public `execute`/`chat` surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Server error ({status}): {message}")]
    HostError { status: u16, message: String },

    #[error("Request timed out: {message}")]
    RequestTimeout { message: String },

    #[error("Server rate limit exceeded (HTTP 429): {message}")]
    ServerThrottle {
        /// Parsed `Retry-After` header in seconds, when present and sane.
        retry_after: Option<f64>,
        message: String,
    },

    #[error("Rate limit timeout: waited {waited:.2}s, max_wait_time={max_wait:.2}s")]
    ThrottleTimeout { waited: f64, max_wait: f64 },

    #[error("Client error ({status}): {message}")]
    ClientError { status: u16, message: String },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("Result handler failed: {message}")]
    Handler { message: String },

    #[error("Authentication error: {message}")]
    Auth { message: String },

    #[error("Max retries exceeded after {attempts} attempts. Last error: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },
}

impl Error {
    /// Whether the retry engine should re-attempt after this error.
    ///
    /// Transient transport conditions (network failures, 5xx, 408, 429 and
    /// both throttling timeouts) are retryable; everything the server is
    /// unlikely to answer differently next time is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network { .. }
                | Error::HostError { .. }
                | Error::RequestTimeout { .. }
                | Error::ServerThrottle { .. }
                | Error::ThrottleTimeout { .. }
        )
    }

    /// Whether this error represents a timeout condition, looking through
    /// [`Error::RetriesExhausted`] wrappers.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::RequestTimeout { .. } | Error::ThrottleTimeout { .. } => true,
            Error::RetriesExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    /// `Retry-After` seconds carried by a server throttle response, if any.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Error::ServerThrottle { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration { .. } => "configuration",
            Error::Network { .. } => "network",
            Error::HostError { .. } => "host_error",
            Error::RequestTimeout { .. } => "request_timeout",
            Error::ServerThrottle { .. } => "server_throttle",
            Error::ThrottleTimeout { .. } => "client_side_throttle_timeout",
            Error::ClientError { .. } => "client_error",
            Error::MalformedResponse { .. } => "malformed_response",
            Error::Handler { .. } => "handler_failure",
            Error::Auth { .. } => "auth_failure",
            Error::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Error::RequestTimeout {
                message: error.to_string(),
            }
        } else if error.is_connect() {
            Error::Network {
                message: format!("Connection failed: {}", error),
            }
        } else {
            Error::Network {
                message: error.to_string(),
            }
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Self {
        Error::Configuration {
            message: format!("Invalid URL: {}", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network { message: "refused".into() }.is_retryable());
        assert!(Error::HostError { status: 503, message: "unavailable".into() }.is_retryable());
        assert!(Error::RequestTimeout { message: "slow".into() }.is_retryable());
        assert!(Error::ServerThrottle { retry_after: None, message: "429".into() }.is_retryable());
        assert!(Error::ThrottleTimeout { waited: 1.0, max_wait: 0.5 }.is_retryable());

        assert!(!Error::ClientError { status: 404, message: "missing".into() }.is_retryable());
        assert!(!Error::MalformedResponse { message: "no id".into() }.is_retryable());
        assert!(!Error::Handler { message: "boom".into() }.is_retryable());
        assert!(!Error::Auth { message: "denied".into() }.is_retryable());
    }

    #[test]
    fn test_timeout_classification_recurses_into_exhausted_retries() {
        let wrapped = Error::RetriesExhausted {
            attempts: 4,
            last: Box::new(Error::RequestTimeout { message: "slow".into() }),
        };
        assert!(wrapped.is_timeout());

        let not_timeout = Error::RetriesExhausted {
            attempts: 4,
            last: Box::new(Error::HostError { status: 500, message: "oops".into() }),
        };
        assert!(!not_timeout.is_timeout());
    }

    #[test]
    fn test_retry_after_accessor() {
        let throttled = Error::ServerThrottle { retry_after: Some(5.0), message: "429".into() };
        assert_eq!(throttled.retry_after(), Some(5.0));
        assert_eq!(Error::Network { message: "x".into() }.retry_after(), None);
    }
}
