//! Authentication collaborators.
//!
//! Two ways of attaching credentials to outgoing requests:
//!
//! - [`ClientCredentialsAuthProvider`] owns a cached OAuth2 bearer token
//!   obtained via the client-credentials grant and refreshes it on expiry
//!   (or when a transport calls [`AuthProvider::invalidate`] after a 401).
//! - [`HostCliProbe`] describes a host CLI that supplies base URLs and
//!   pre-signed authorization headers; [`EnvHostCliProbe`] reads the CLI's
//!   environment contract.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::AuthConfig;
use crate::{Error, Result};

/// Environment variable the host CLI uses to advertise its API base URL.
pub const CLI_BASE_URL_VAR: &str = "STKAI_CLI_BASE_URL";

/// Environment variable the host CLI uses to hand over a pre-signed token.
pub const CLI_TOKEN_VAR: &str = "STKAI_CLI_TOKEN";

/// Refresh the cached token this long before its expiry.
const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Token lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 1199;

// =============================================================================
// AuthProvider
// =============================================================================

/// Supplies bearer tokens for standalone (non-CLI) operation.
///
/// Implementations own the token cache and must be safe for concurrent
/// use; refreshes are expected to be serialized so a stampede of callers
/// results in a single token request.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// A currently valid access token (without the `Bearer ` prefix).
    async fn access_token(&self) -> Result<String>;

    /// Drop the cached token so the next call fetches a fresh one.
    ///
    /// Called by transports when the server answers 401 with a token that
    /// was thought to be valid.
    async fn invalidate(&self);
}

#[derive(Debug, Clone)]
struct TokenInfo {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// OAuth2 client-credentials flow with a cached, auto-refreshed token.
pub struct ClientCredentialsAuthProvider {
    client_id: String,
    client_secret: String,
    token_url: String,
    refresh_margin: Duration,
    http: reqwest::Client,
    // Refresh is serialized: callers arriving mid-refresh wait here and
    // then see the fresh token.
    token: Mutex<Option<TokenInfo>>,
}

impl ClientCredentialsAuthProvider {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: token_url.into(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            http: reqwest::Client::new(),
            token: Mutex::new(None),
        }
    }

    /// Build from an `auth` config group.
    ///
    /// Fails when credentials are not configured.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        match (config.client_id.get(), config.client_secret.get()) {
            (Some(id), Some(secret)) => {
                Ok(Self::new(id.clone(), secret.clone(), config.token_url.get().clone()))
            }
            _ => Err(Error::Configuration {
                message: "Client credentials not configured. Set client_id and client_secret via \
                          configure() or the STKAI_AUTH_CLIENT_ID / STKAI_AUTH_CLIENT_SECRET \
                          environment variables."
                    .to_string(),
            }),
        }
    }

    fn is_valid(&self, token: &TokenInfo) -> bool {
        token
            .expires_at
            .checked_sub(self.refresh_margin)
            .map_or(false, |deadline| Instant::now() < deadline)
    }

    async fn fetch_new_token(&self) -> Result<TokenInfo> {
        debug!("Requesting access token from {}", self.token_url);

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Error::Auth {
                message: format!("Failed to obtain access token: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth {
                message: format!("Failed to obtain access token (HTTP {}): {body}", status.as_u16()),
            });
        }

        let parsed: TokenEndpointResponse = response.json().await.map_err(|e| Error::Auth {
            message: format!("Invalid token response: {e}"),
        })?;

        let expires_in = parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        Ok(TokenInfo {
            access_token: parsed.access_token,
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        })
    }
}

#[async_trait]
impl AuthProvider for ClientCredentialsAuthProvider {
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if self.is_valid(token) {
                return Ok(token.access_token.clone());
            }
        }

        let fresh = self.fetch_new_token().await?;
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(access_token)
    }

    async fn invalidate(&self) {
        debug!("Invalidating cached access token");
        *self.token.lock().await = None;
    }
}

impl std::fmt::Debug for ClientCredentialsAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentialsAuthProvider")
            .field("client_id", &self.client_id)
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// HostCliProbe
// =============================================================================

/// Describes an installed host CLI that can authenticate requests.
///
/// When a CLI is present it takes precedence over client credentials:
/// the SDK asks it for base URLs at configuration time and for a
/// pre-signed authorization header on every call.
pub trait HostCliProbe: Send + Sync {
    /// Whether the host CLI is installed and logged in.
    fn is_available(&self) -> bool;

    /// Base URL for the Remote Quick Command API, if the CLI knows it.
    fn base_url_for_rqc(&self) -> Option<String>;

    /// Base URL for the Agent API, if the CLI knows it.
    fn base_url_for_agent(&self) -> Option<String>;

    /// Attach the CLI's authorization header to an outgoing request.
    fn sign(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder>;
}

/// Probe reading the host CLI's environment contract.
///
/// The CLI advertises itself through `STKAI_CLI_BASE_URL` (the RQC API
/// root) and `STKAI_CLI_TOKEN` (a pre-signed bearer). The Agent API root
/// is derived from the RQC one by the platform's host naming convention.
#[derive(Debug, Clone)]
pub struct EnvHostCliProbe {
    base_url: Option<String>,
    token: Option<String>,
}

impl EnvHostCliProbe {
    /// Capture the CLI environment as it is right now.
    pub fn new() -> Self {
        let read = |var: &str| std::env::var(var).ok().filter(|v| !v.is_empty());
        Self {
            base_url: read(CLI_BASE_URL_VAR),
            token: read(CLI_TOKEN_VAR),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_values(base_url: Option<String>, token: Option<String>) -> Self {
        Self { base_url, token }
    }
}

impl Default for EnvHostCliProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCliProbe for EnvHostCliProbe {
    fn is_available(&self) -> bool {
        self.base_url.is_some() && self.token.is_some()
    }

    fn base_url_for_rqc(&self) -> Option<String> {
        self.base_url.clone()
    }

    fn base_url_for_agent(&self) -> Option<String> {
        // Platform convention: the inference host substitutes for the
        // code-buddy host in the same environment.
        self.base_url
            .as_ref()
            .map(|url| url.replace("genai-code-buddy-api", "genai-inference-app"))
    }

    fn sign(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.token.as_ref().ok_or_else(|| Error::Auth {
            message: "Host CLI token is not available".to_string(),
        })?;
        Ok(request.bearer_auth(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_unavailable_without_token() {
        let probe = EnvHostCliProbe::with_values(Some("https://api.example.com".into()), None);
        assert!(!probe.is_available());

        let probe = EnvHostCliProbe::with_values(None, Some("tok".into()));
        assert!(!probe.is_available());
    }

    #[test]
    fn test_probe_derives_agent_url_by_host_substitution() {
        let probe = EnvHostCliProbe::with_values(
            Some("https://genai-code-buddy-api.stackspot.com".into()),
            Some("tok".into()),
        );
        assert!(probe.is_available());
        assert_eq!(
            probe.base_url_for_agent().unwrap(),
            "https://genai-inference-app.stackspot.com"
        );
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let config = crate::config::Config::build(
            &|_| None,
            &crate::config::HostCliUrls::default(),
            &crate::config::Overrides::default(),
            false,
        )
        .unwrap();
        assert!(ClientCredentialsAuthProvider::from_config(&config.auth).is_err());
    }

    #[tokio::test]
    async fn test_token_cache_returns_unexpired_token() {
        let provider = ClientCredentialsAuthProvider::new("id", "secret", "https://token.invalid");
        {
            let mut cached = provider.token.lock().await;
            *cached = Some(TokenInfo {
                access_token: "cached-token".into(),
                expires_at: Instant::now() + Duration::from_secs(600),
            });
        }
        assert_eq!(provider.access_token().await.unwrap(), "cached-token");

        provider.invalidate().await;
        assert!(provider.token.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_token_near_expiry_is_not_reused() {
        let provider = ClientCredentialsAuthProvider::new("id", "secret", "https://token.invalid");
        {
            let mut cached = provider.token.lock().await;
            // Inside the refresh margin: must trigger a fetch, which fails
            // against the unreachable endpoint.
            *cached = Some(TokenInfo {
                access_token: "stale".into(),
                expires_at: Instant::now() + Duration::from_secs(10),
            });
        }
        assert!(provider.access_token().await.is_err());
    }
}
