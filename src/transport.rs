//! HTTP transport contract and the transports that implement it.
//!
//! [`HttpTransport`] is the single seam between the SDK's control plane
//! and the network: authenticated GET/POST with a per-call timeout,
//! returning the raw status/headers/body. No retries happen at this
//! layer; decorators ([`crate::rate_limit`]) and the retry engine
//! ([`crate::retry`]) compose on top of it.
//!
//! Implementations:
//! - [`HostCliTransport`]: per-call signing through a [`HostCliProbe`].
//! - [`StandaloneTransport`]: bearer tokens from an [`AuthProvider`],
//!   with a single 401-triggered refresh retry.
//! - [`EnvironmentAwareTransport`]: lazily picks one of the above from
//!   the environment and wraps it in the configured rate limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::auth::{AuthProvider, ClientCredentialsAuthProvider, EnvHostCliProbe, HostCliProbe};
use crate::config::{self, Config, RateLimitStrategy};
use crate::rate_limit::{AdaptiveTransport, TokenBucketTransport};
use crate::{Error, Result};

/// `Retry-After` values above this are ignored (defensive against abusive
/// or buggy servers).
pub const MAX_RETRY_AFTER_SECS: f64 = 60.0;

// =============================================================================
// Response
// =============================================================================

/// Raw response handed back by a transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self { status, headers, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as UTF-8 (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body decoded as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::MalformedResponse {
            message: format!("Failed to parse response body as JSON: {e}"),
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parsed `Retry-After` header in seconds.
    ///
    /// Only the numeric-seconds form is honored, and only up to
    /// [`MAX_RETRY_AFTER_SECS`]; anything else falls back to `None` so the
    /// caller uses its own backoff.
    pub fn retry_after(&self) -> Option<f64> {
        let raw = self.header("Retry-After")?;
        match raw.trim().parse::<f64>() {
            Ok(seconds) if seconds >= 0.0 && seconds <= MAX_RETRY_AFTER_SECS => Some(seconds),
            Ok(seconds) => {
                warn!(
                    "Retry-After header ({seconds}s) exceeds {MAX_RETRY_AFTER_SECS}s; using exponential backoff instead"
                );
                None
            }
            // HTTP-date form is not supported.
            Err(_) => None,
        }
    }

    /// Classify a non-success status into the SDK error taxonomy.
    pub fn error_for_status(self) -> Result<TransportResponse> {
        if self.is_success() {
            return Ok(self);
        }
        let preview: String = self.text().chars().take(200).collect();
        match self.status {
            408 => Err(Error::RequestTimeout {
                message: format!("HTTP 408: {preview}"),
            }),
            429 => Err(Error::ServerThrottle {
                retry_after: self.retry_after(),
                message: preview,
            }),
            status if status >= 500 => Err(Error::HostError {
                status,
                message: preview,
            }),
            status => Err(Error::ClientError {
                status,
                message: preview,
            }),
        }
    }
}

// =============================================================================
// Transport contract
// =============================================================================

/// Authenticated HTTP capability used by every SDK client.
///
/// GETs are polling reads and are never throttled by the rate-limit
/// decorators; POSTs create work on the platform and consume quota.
/// Transports return `Ok` for every HTTP status, since classification
/// happens on the caller's side and on the decorators' return path.
/// `Err` is reserved for network-level failures.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Execute an authenticated GET request.
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<TransportResponse>;

    /// Execute an authenticated POST request with a JSON body.
    async fn post(&self, url: &str, body: &Value, timeout: Duration)
        -> Result<TransportResponse>;
}

async fn into_transport_response(response: reqwest::Response) -> Result<TransportResponse> {
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect();
    let body = response.bytes().await.map_err(Error::from)?.to_vec();
    Ok(TransportResponse::new(status, headers, body))
}

fn http_client(user_agent: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .build()
        .map_err(|e| Error::Configuration {
            message: format!("Failed to create HTTP client: {e}"),
        })
}

fn apply_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &[(String, String)],
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
}

// =============================================================================
// Host-CLI transport
// =============================================================================

/// Transport that lets the host CLI sign every request.
///
/// Stateless: the probe is consulted per call, so a CLI re-login is picked
/// up without rebuilding the transport.
pub struct HostCliTransport {
    probe: Arc<dyn HostCliProbe>,
    http: reqwest::Client,
}

impl HostCliTransport {
    pub fn new(probe: Arc<dyn HostCliProbe>) -> Result<Self> {
        let user_agent = config::current().sdk.user_agent.get().clone();
        Ok(Self {
            probe,
            http: http_client(&user_agent)?,
        })
    }
}

#[async_trait]
impl HttpTransport for HostCliTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<TransportResponse> {
        let builder = apply_headers(self.http.get(url), headers).timeout(timeout);
        let signed = self.probe.sign(builder)?;
        let response = signed.send().await?;
        into_transport_response(response).await
    }

    async fn post(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        let builder = self.http.post(url).json(body).timeout(timeout);
        let signed = self.probe.sign(builder)?;
        let response = signed.send().await?;
        into_transport_response(response).await
    }
}

// =============================================================================
// Standalone transport
// =============================================================================

/// Transport that authenticates with bearer tokens from an [`AuthProvider`].
///
/// A 401 answer invalidates the cached token and the request is retried
/// once with a fresh one; a second 401 surfaces as [`Error::Auth`].
pub struct StandaloneTransport {
    auth: Arc<dyn AuthProvider>,
    http: reqwest::Client,
}

impl StandaloneTransport {
    pub fn new(auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let user_agent = config::current().sdk.user_agent.get().clone();
        Ok(Self {
            auth,
            http: http_client(&user_agent)?,
        })
    }

    async fn send_authorized<F>(&self, build: F) -> Result<TransportResponse>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let token = self.auth.access_token().await?;
        let response = build().bearer_auth(&token).send().await?;
        let response = into_transport_response(response).await?;
        if response.status != 401 {
            return Ok(response);
        }

        // One refresh attempt for a 401; recursing here could loop forever
        // against a server that always rejects.
        debug!("Received 401; refreshing token and retrying once");
        self.auth.invalidate().await;
        let token = self.auth.access_token().await?;
        let response = build().bearer_auth(&token).send().await?;
        let response = into_transport_response(response).await?;
        if response.status == 401 {
            return Err(Error::Auth {
                message: "Request rejected with HTTP 401 after refreshing the access token"
                    .to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl HttpTransport for StandaloneTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<TransportResponse> {
        self.send_authorized(|| apply_headers(self.http.get(url), headers).timeout(timeout))
            .await
    }

    async fn post(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        self.send_authorized(|| self.http.post(url).json(body).timeout(timeout))
            .await
    }
}

// =============================================================================
// Environment-aware assembly
// =============================================================================

/// Builds the transport stack a configuration asks for.
///
/// Selection: host CLI when available (credentials, if also present, are
/// ignored with a warning), otherwise client credentials, otherwise a
/// configuration error. The chosen transport is wrapped in the configured
/// rate-limit decorator.
pub(crate) fn build_transport_stack(
    config: &Config,
    probe: Arc<dyn HostCliProbe>,
) -> Result<Arc<dyn HttpTransport>> {
    let base: Arc<dyn HttpTransport> = if probe.is_available() {
        debug!("Host CLI detected; delegating request signing to it");
        if config.auth.has_credentials() {
            warn!(
                "Auth credentials are configured but a host CLI is present; \
                 the CLI handles authentication and the credentials are ignored"
            );
        }
        Arc::new(HostCliTransport::new(probe)?)
    } else if config.auth.has_credentials() {
        debug!("Client credentials detected; using standalone authentication");
        let provider = ClientCredentialsAuthProvider::from_config(&config.auth)?;
        Arc::new(StandaloneTransport::new(Arc::new(provider))?)
    } else {
        return Err(Error::Configuration {
            message: "No authentication method available. Either:\n\
                      1. Run under the host CLI (it advertises itself via the environment), or\n\
                      2. Set STKAI_AUTH_CLIENT_ID and STKAI_AUTH_CLIENT_SECRET, or\n\
                      3. Call config::configure() with auth credentials at startup."
                .to_string(),
        });
    };

    let rl = &config.rate_limit;
    if !rl.enabled.copied() {
        return Ok(base);
    }

    let limited: Arc<dyn HttpTransport> = match rl.strategy.copied() {
        RateLimitStrategy::TokenBucket => {
            debug!(
                "Applying token_bucket rate limiting (max_requests={}, time_window={:?})",
                rl.max_requests.copied(),
                rl.time_window.copied()
            );
            Arc::new(TokenBucketTransport::new(
                base,
                rl.max_requests.copied(),
                rl.time_window.copied(),
                rl.max_wait_time.copied(),
            ))
        }
        RateLimitStrategy::Adaptive => {
            debug!(
                "Applying adaptive rate limiting (max_requests={}, time_window={:?})",
                rl.max_requests.copied(),
                rl.time_window.copied()
            );
            Arc::new(
                AdaptiveTransport::new(base, rl.max_requests.copied(), rl.time_window.copied())
                    .with_max_wait_time(rl.max_wait_time.copied())
                    .with_min_rate_floor(rl.min_rate_floor.copied())
                    .with_penalty_factor(rl.penalty_factor.copied())
                    .with_recovery_factor(rl.recovery_factor.copied()),
            )
        }
    };
    Ok(limited)
}

/// Transport that detects its environment on first use.
///
/// Detection is lazy so `configure()` can run after construction; the
/// result is cached for the lifetime of the transport.
pub struct EnvironmentAwareTransport {
    probe: Arc<dyn HostCliProbe>,
    delegate: OnceCell<Arc<dyn HttpTransport>>,
}

impl EnvironmentAwareTransport {
    pub fn new() -> Self {
        Self::with_probe(Arc::new(EnvHostCliProbe::new()))
    }

    /// Use a specific probe instead of reading the process environment.
    pub fn with_probe(probe: Arc<dyn HostCliProbe>) -> Self {
        Self {
            probe,
            delegate: OnceCell::new(),
        }
    }

    async fn delegate(&self) -> Result<&Arc<dyn HttpTransport>> {
        self.delegate
            .get_or_try_init(|| async {
                build_transport_stack(&config::current(), self.probe.clone())
            })
            .await
    }
}

impl Default for EnvironmentAwareTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for EnvironmentAwareTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<TransportResponse> {
        self.delegate().await?.get(url, headers, timeout).await
    }

    async fn post(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        self.delegate().await?.post(url, body, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostCliUrls, Overrides};

    fn response(status: u16, headers: &[(&str, &str)], body: &str) -> TransportResponse {
        TransportResponse::new(
            status,
            headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body.as_bytes().to_vec(),
        )
    }

    #[test]
    fn test_error_for_status_classification() {
        assert!(response(200, &[], "{}").error_for_status().is_ok());

        match response(408, &[], "slow").error_for_status() {
            Err(Error::RequestTimeout { .. }) => {}
            other => panic!("expected RequestTimeout, got {other:?}"),
        }
        match response(429, &[("Retry-After", "5")], "later").error_for_status() {
            Err(Error::ServerThrottle { retry_after: Some(secs), .. }) => assert_eq!(secs, 5.0),
            other => panic!("expected ServerThrottle, got {other:?}"),
        }
        match response(404, &[], "missing").error_for_status() {
            Err(Error::ClientError { status: 404, .. }) => {}
            other => panic!("expected ClientError, got {other:?}"),
        }
        match response(503, &[], "busy").error_for_status() {
            Err(Error::HostError { status: 503, .. }) => {}
            other => panic!("expected HostError, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_after_parsing() {
        assert_eq!(response(429, &[("Retry-After", "5")], "").retry_after(), Some(5.0));
        assert_eq!(response(429, &[("retry-after", "30.5")], "").retry_after(), Some(30.5));
        // Values beyond the cap are ignored.
        assert_eq!(response(429, &[("Retry-After", "120")], "").retry_after(), None);
        // HTTP-date form is not supported.
        assert_eq!(
            response(429, &[("Retry-After", "Wed, 21 Oct 2015 07:28:00 GMT")], "").retry_after(),
            None
        );
        assert_eq!(response(429, &[], "").retry_after(), None);
    }

    #[test]
    fn test_json_parse_failure_is_malformed() {
        let err = response(200, &[], "not-json").json::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { .. }));
    }

    #[test]
    fn test_stack_assembly_requires_some_auth() {
        let config = Config::build(
            &|_| None,
            &HostCliUrls::default(),
            &Overrides::default(),
            false,
        )
        .unwrap();
        let probe = Arc::new(EnvHostCliProbe::with_values(None, None));
        let result = build_transport_stack(&config, probe);
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_stack_assembly_prefers_host_cli() {
        let config = Config::build(
            &|_| None,
            &HostCliUrls::default(),
            &Overrides {
                auth: Some(crate::config::AuthOverrides {
                    client_id: Some("id".into()),
                    client_secret: Some("secret".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            false,
        )
        .unwrap();
        let probe = Arc::new(EnvHostCliProbe::with_values(
            Some("https://api.example.com".into()),
            Some("tok".into()),
        ));
        assert!(build_transport_stack(&config, probe).is_ok());
    }
}
