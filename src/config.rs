//! SDK configuration registry.
//!
//! Configuration is organized in groups (`auth`, `rqc`, `agent`,
//! `rate_limit`, `sdk`) and resolved in layers, lowest precedence first:
//!
//! 1. hardcoded defaults,
//! 2. environment variables (`STKAI_<GROUP>_<OPTION>`),
//! 3. host-CLI-derived values (base URLs, when a host CLI is detected),
//! 4. values passed to [`configure`].
//!
//! Per-client option structs (e.g. `CreateExecutionOptions`) sit above the
//! registry and always win.
//!
//! Every resolved field carries its originating [`ConfigSource`], and
//! [`explain`] reports the full value/source table, answering "why is my
//! timeout 30 seconds?".
//!
//! The registry is process-wide and read-mostly: readers take an `Arc`
//! snapshot, writers ([`configure`], [`reset`]) publish a new immutable
//! snapshot.

use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use url::Url;

use crate::auth::{EnvHostCliProbe, HostCliProbe};
use crate::{Error, Result, DEFAULT_AGENT_BASE_URL, DEFAULT_RQC_BASE_URL, DEFAULT_TOKEN_URL};

/// Environment variable prefix for all SDK options.
pub const ENV_PREFIX: &str = "STKAI";

// =============================================================================
// Sourced values
// =============================================================================

/// Where a configuration value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Hardcoded default.
    Default,
    /// Environment variable (carries the variable name).
    Env(String),
    /// Derived from the host CLI environment.
    HostCli,
    /// Set explicitly via [`configure`].
    User,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Env(var) => write!(f, "env:{var}"),
            ConfigSource::HostCli => write!(f, "host_cli"),
            ConfigSource::User => write!(f, "user"),
        }
    }
}

/// A configuration value together with its source.
#[derive(Debug, Clone)]
pub struct ConfigValue<T> {
    value: T,
    source: ConfigSource,
}

impl<T> ConfigValue<T> {
    fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
        }
    }

    fn set(&mut self, value: T, source: ConfigSource) {
        self.value = value;
        self.source = source;
    }

    /// The resolved value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// The layer that produced the value.
    pub fn source(&self) -> &ConfigSource {
        &self.source
    }
}

impl<T: Copy> ConfigValue<T> {
    /// The resolved value, copied out.
    pub fn copied(&self) -> T {
        self.value
    }
}

// =============================================================================
// Groups
// =============================================================================

/// Credentials for standalone (non-CLI) authentication.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub client_id: ConfigValue<Option<String>>,
    pub client_secret: ConfigValue<Option<String>>,
    pub token_url: ConfigValue<String>,
}

impl AuthConfig {
    fn defaults() -> Self {
        Self {
            client_id: ConfigValue::default_value(None),
            client_secret: ConfigValue::default_value(None),
            token_url: ConfigValue::default_value(DEFAULT_TOKEN_URL.to_string()),
        }
    }

    /// Whether both client id and secret are present.
    pub fn has_credentials(&self) -> bool {
        self.client_id.get().is_some() && self.client_secret.get().is_some()
    }
}

/// Remote Quick Command client defaults.
#[derive(Debug, Clone)]
pub struct RqcConfig {
    pub request_timeout: ConfigValue<Duration>,
    pub retry_max_retries: ConfigValue<u32>,
    pub retry_initial_delay: ConfigValue<Duration>,
    /// Retry budget for individual polls. `None` derives
    /// `min(1, retry_max_retries)`.
    pub poll_retry_max_retries: ConfigValue<Option<u32>>,
    pub poll_interval: ConfigValue<Duration>,
    pub poll_max_duration: ConfigValue<Duration>,
    pub overload_timeout: ConfigValue<Duration>,
    pub max_workers: ConfigValue<usize>,
    pub base_url: ConfigValue<String>,
}

impl RqcConfig {
    fn defaults() -> Self {
        Self {
            request_timeout: ConfigValue::default_value(Duration::from_secs(30)),
            retry_max_retries: ConfigValue::default_value(3),
            retry_initial_delay: ConfigValue::default_value(Duration::from_millis(500)),
            poll_retry_max_retries: ConfigValue::default_value(None),
            poll_interval: ConfigValue::default_value(Duration::from_secs(10)),
            poll_max_duration: ConfigValue::default_value(Duration::from_secs(600)),
            overload_timeout: ConfigValue::default_value(Duration::from_secs(60)),
            max_workers: ConfigValue::default_value(8),
            base_url: ConfigValue::default_value(DEFAULT_RQC_BASE_URL.to_string()),
        }
    }

    /// Effective retry budget for the polling phase.
    pub fn effective_poll_retries(&self) -> u32 {
        self.poll_retry_max_retries
            .copied()
            .unwrap_or_else(|| self.retry_max_retries.copied().min(1))
    }
}

/// Agent client defaults.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub request_timeout: ConfigValue<Duration>,
    pub retry_max_retries: ConfigValue<u32>,
    pub retry_initial_delay: ConfigValue<Duration>,
    pub base_url: ConfigValue<String>,
}

impl AgentConfig {
    fn defaults() -> Self {
        Self {
            request_timeout: ConfigValue::default_value(Duration::from_secs(60)),
            retry_max_retries: ConfigValue::default_value(3),
            retry_initial_delay: ConfigValue::default_value(Duration::from_millis(500)),
            base_url: ConfigValue::default_value(DEFAULT_AGENT_BASE_URL.to_string()),
        }
    }
}

/// Rate limiting strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStrategy {
    TokenBucket,
    Adaptive,
}

impl fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitStrategy::TokenBucket => write!(f, "token_bucket"),
            RateLimitStrategy::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl std::str::FromStr for RateLimitStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "token_bucket" => Ok(RateLimitStrategy::TokenBucket),
            "adaptive" => Ok(RateLimitStrategy::Adaptive),
            other => Err(Error::Configuration {
                message: format!(
                    "Unknown rate limit strategy: {other}. Valid strategies are: 'token_bucket', 'adaptive'."
                ),
            }),
        }
    }
}

/// Client-side rate limiting settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: ConfigValue<bool>,
    pub strategy: ConfigValue<RateLimitStrategy>,
    pub max_requests: ConfigValue<u32>,
    pub time_window: ConfigValue<Duration>,
    /// Cap on token acquisition waits. `None` waits indefinitely.
    pub max_wait_time: ConfigValue<Option<Duration>>,
    pub min_rate_floor: ConfigValue<f64>,
    pub penalty_factor: ConfigValue<f64>,
    pub recovery_factor: ConfigValue<f64>,
}

impl RateLimitConfig {
    fn defaults() -> Self {
        Self {
            enabled: ConfigValue::default_value(false),
            strategy: ConfigValue::default_value(RateLimitStrategy::TokenBucket),
            max_requests: ConfigValue::default_value(100),
            time_window: ConfigValue::default_value(Duration::from_secs(60)),
            max_wait_time: ConfigValue::default_value(Some(Duration::from_secs(45))),
            min_rate_floor: ConfigValue::default_value(0.1),
            penalty_factor: ConfigValue::default_value(0.3),
            recovery_factor: ConfigValue::default_value(0.05),
        }
    }
}

/// SDK metadata.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub user_agent: ConfigValue<String>,
}

impl SdkConfig {
    fn defaults() -> Self {
        Self {
            user_agent: ConfigValue::default_value(format!("stkai-sdk-rust/{}", crate::VERSION)),
        }
    }
}

/// Full resolved configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    pub auth: AuthConfig,
    pub rqc: RqcConfig,
    pub agent: AgentConfig,
    pub rate_limit: RateLimitConfig,
    pub sdk: SdkConfig,
}

// =============================================================================
// Overrides (user layer)
// =============================================================================

/// Cap on the time spent waiting for a rate-limit token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitLimit {
    Bounded(Duration),
    Unlimited,
}

impl WaitLimit {
    fn to_option(self) -> Option<Duration> {
        match self {
            WaitLimit::Bounded(d) => Some(d),
            WaitLimit::Unlimited => None,
        }
    }
}

/// Curated adaptive-limiter profiles.
///
/// `Conservative` backs off hardest and recovers slowest; `Optimistic` is
/// the lightest touch; `Balanced` matches the documented defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitPreset {
    Conservative,
    Balanced,
    Optimistic,
}

impl RateLimitPreset {
    /// `(max_wait_time, min_rate_floor, penalty_factor, recovery_factor)`
    fn settings(self) -> (WaitLimit, f64, f64, f64) {
        match self {
            RateLimitPreset::Conservative => {
                (WaitLimit::Bounded(Duration::from_secs(60)), 0.05, 0.5, 0.02)
            }
            RateLimitPreset::Balanced => {
                (WaitLimit::Bounded(Duration::from_secs(45)), 0.1, 0.3, 0.05)
            }
            RateLimitPreset::Optimistic => {
                (WaitLimit::Bounded(Duration::from_secs(30)), 0.2, 0.15, 0.1)
            }
        }
    }
}

impl std::str::FromStr for RateLimitPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conservative" => Ok(RateLimitPreset::Conservative),
            "balanced" => Ok(RateLimitPreset::Balanced),
            "optimistic" => Ok(RateLimitPreset::Optimistic),
            other => Err(Error::Configuration {
                message: format!(
                    "Unknown rate limit preset: {other}. Valid presets are: 'conservative', 'balanced', 'optimistic'."
                ),
            }),
        }
    }
}

/// Partial overrides for the `auth` group.
#[derive(Debug, Clone, Default)]
pub struct AuthOverrides {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: Option<String>,
}

/// Partial overrides for the `rqc` group.
#[derive(Debug, Clone, Default)]
pub struct RqcOverrides {
    pub request_timeout: Option<Duration>,
    pub retry_max_retries: Option<u32>,
    pub retry_initial_delay: Option<Duration>,
    pub poll_retry_max_retries: Option<u32>,
    pub poll_interval: Option<Duration>,
    pub poll_max_duration: Option<Duration>,
    pub overload_timeout: Option<Duration>,
    pub max_workers: Option<usize>,
    pub base_url: Option<String>,
}

/// Partial overrides for the `agent` group.
#[derive(Debug, Clone, Default)]
pub struct AgentOverrides {
    pub request_timeout: Option<Duration>,
    pub retry_max_retries: Option<u32>,
    pub retry_initial_delay: Option<Duration>,
    pub base_url: Option<String>,
}

/// Partial overrides for the `rate_limit` group.
///
/// A `preset` expands first; explicit fields win over the preset.
#[derive(Debug, Clone, Default)]
pub struct RateLimitOverrides {
    pub enabled: Option<bool>,
    pub strategy: Option<RateLimitStrategy>,
    pub preset: Option<RateLimitPreset>,
    pub max_requests: Option<u32>,
    pub time_window: Option<Duration>,
    pub max_wait_time: Option<WaitLimit>,
    pub min_rate_floor: Option<f64>,
    pub penalty_factor: Option<f64>,
    pub recovery_factor: Option<f64>,
}

/// Partial overrides for the `sdk` group.
#[derive(Debug, Clone, Default)]
pub struct SdkOverrides {
    pub user_agent: Option<String>,
}

/// Overrides for [`configure`], grouped like the configuration itself.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub auth: Option<AuthOverrides>,
    pub rqc: Option<RqcOverrides>,
    pub agent: Option<AgentOverrides>,
    pub rate_limit: Option<RateLimitOverrides>,
    pub sdk: Option<SdkOverrides>,
}

// =============================================================================
// Resolution
// =============================================================================

type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T, E: fmt::Display>(
    var: &str,
    raw: &str,
    parsed: std::result::Result<T, E>,
) -> Result<T> {
    parsed.map_err(|e| Error::Configuration {
        message: format!("Invalid value for {var} ({raw:?}): {e}"),
    })
}

fn env_seconds(env: EnvLookup, var: &str) -> Result<Option<Duration>> {
    match env(var) {
        None => Ok(None),
        Some(raw) => {
            let secs: f64 = parse_env(var, &raw, raw.parse::<f64>())?;
            if secs <= 0.0 {
                return Err(Error::Configuration {
                    message: format!("Invalid value for {var}: must be a positive number of seconds"),
                });
            }
            Ok(Some(Duration::from_secs_f64(secs)))
        }
    }
}

fn env_parse<T: std::str::FromStr>(env: EnvLookup, var: &str) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    match env(var) {
        None => Ok(None),
        Some(raw) => parse_env(var, &raw, raw.parse::<T>()).map(Some),
    }
}

fn env_bool(env: EnvLookup, var: &str) -> Option<bool> {
    env(var).map(|raw| matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes"))
}

/// `unlimited`/`none`/`null` mean no cap; otherwise seconds.
fn env_wait_limit(env: EnvLookup, var: &str) -> Result<Option<Option<Duration>>> {
    match env(var) {
        None => Ok(None),
        Some(raw) if matches!(raw.to_lowercase().as_str(), "unlimited" | "none" | "null") => {
            Ok(Some(None))
        }
        Some(raw) => {
            let secs: f64 = parse_env(var, &raw, raw.parse::<f64>())?;
            if secs <= 0.0 {
                return Err(Error::Configuration {
                    message: format!("Invalid value for {var}: must be positive seconds or 'unlimited'"),
                });
            }
            Ok(Some(Some(Duration::from_secs_f64(secs))))
        }
    }
}

macro_rules! apply_env {
    ($field:expr, $value:expr, $var:expr) => {
        if let Some(v) = $value {
            $field.set(v, ConfigSource::Env($var.to_string()));
        }
    };
}

macro_rules! apply_user {
    ($field:expr, $value:expr) => {
        if let Some(v) = $value {
            $field.set(v, ConfigSource::User);
        }
    };
}

/// Base URLs advertised by a detected host CLI.
#[derive(Debug, Clone, Default)]
pub(crate) struct HostCliUrls {
    pub rqc_base_url: Option<String>,
    pub agent_base_url: Option<String>,
}

impl HostCliUrls {
    pub(crate) fn detect(probe: &dyn HostCliProbe) -> Self {
        if !probe.is_available() {
            return Self::default();
        }
        Self {
            rqc_base_url: probe.base_url_for_rqc(),
            agent_base_url: probe.base_url_for_agent(),
        }
    }
}

impl Config {
    /// Resolve defaults + environment + host CLI, with no user overrides.
    pub fn from_environment() -> Result<Self> {
        let probe = EnvHostCliProbe::new();
        Self::build(&env_var, &HostCliUrls::detect(&probe), &Overrides::default(), true)
    }

    pub(crate) fn build(
        env: EnvLookup,
        host_cli: &HostCliUrls,
        overrides: &Overrides,
        allow_env_override: bool,
    ) -> Result<Self> {
        let mut config = Config {
            auth: AuthConfig::defaults(),
            rqc: RqcConfig::defaults(),
            agent: AgentConfig::defaults(),
            rate_limit: RateLimitConfig::defaults(),
            sdk: SdkConfig::defaults(),
        };

        if allow_env_override {
            config.apply_env(env)?;
        }
        config.apply_host_cli(host_cli);
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, env: EnvLookup) -> Result<()> {
        // auth
        apply_env!(self.auth.client_id, env("STKAI_AUTH_CLIENT_ID").map(Some), "STKAI_AUTH_CLIENT_ID");
        apply_env!(
            self.auth.client_secret,
            env("STKAI_AUTH_CLIENT_SECRET").map(Some),
            "STKAI_AUTH_CLIENT_SECRET"
        );
        apply_env!(self.auth.token_url, env("STKAI_AUTH_TOKEN_URL"), "STKAI_AUTH_TOKEN_URL");

        // rqc
        apply_env!(
            self.rqc.request_timeout,
            env_seconds(env, "STKAI_RQC_REQUEST_TIMEOUT")?,
            "STKAI_RQC_REQUEST_TIMEOUT"
        );
        apply_env!(
            self.rqc.retry_max_retries,
            env_parse::<u32>(env, "STKAI_RQC_RETRY_MAX_RETRIES")?,
            "STKAI_RQC_RETRY_MAX_RETRIES"
        );
        apply_env!(
            self.rqc.retry_initial_delay,
            env_seconds(env, "STKAI_RQC_RETRY_INITIAL_DELAY")?,
            "STKAI_RQC_RETRY_INITIAL_DELAY"
        );
        apply_env!(
            self.rqc.poll_retry_max_retries,
            env_parse::<u32>(env, "STKAI_RQC_POLL_RETRY_MAX_RETRIES")?.map(Some),
            "STKAI_RQC_POLL_RETRY_MAX_RETRIES"
        );
        apply_env!(
            self.rqc.poll_interval,
            env_seconds(env, "STKAI_RQC_POLL_INTERVAL")?,
            "STKAI_RQC_POLL_INTERVAL"
        );
        apply_env!(
            self.rqc.poll_max_duration,
            env_seconds(env, "STKAI_RQC_POLL_MAX_DURATION")?,
            "STKAI_RQC_POLL_MAX_DURATION"
        );
        apply_env!(
            self.rqc.overload_timeout,
            env_seconds(env, "STKAI_RQC_OVERLOAD_TIMEOUT")?,
            "STKAI_RQC_OVERLOAD_TIMEOUT"
        );
        apply_env!(
            self.rqc.max_workers,
            env_parse::<usize>(env, "STKAI_RQC_MAX_WORKERS")?,
            "STKAI_RQC_MAX_WORKERS"
        );
        apply_env!(self.rqc.base_url, env("STKAI_RQC_BASE_URL"), "STKAI_RQC_BASE_URL");

        // agent
        apply_env!(
            self.agent.request_timeout,
            env_seconds(env, "STKAI_AGENT_REQUEST_TIMEOUT")?,
            "STKAI_AGENT_REQUEST_TIMEOUT"
        );
        apply_env!(
            self.agent.retry_max_retries,
            env_parse::<u32>(env, "STKAI_AGENT_RETRY_MAX_RETRIES")?,
            "STKAI_AGENT_RETRY_MAX_RETRIES"
        );
        apply_env!(
            self.agent.retry_initial_delay,
            env_seconds(env, "STKAI_AGENT_RETRY_INITIAL_DELAY")?,
            "STKAI_AGENT_RETRY_INITIAL_DELAY"
        );
        apply_env!(self.agent.base_url, env("STKAI_AGENT_BASE_URL"), "STKAI_AGENT_BASE_URL");

        // rate_limit
        apply_env!(
            self.rate_limit.enabled,
            env_bool(env, "STKAI_RATE_LIMIT_ENABLED"),
            "STKAI_RATE_LIMIT_ENABLED"
        );
        apply_env!(
            self.rate_limit.strategy,
            env_parse::<RateLimitStrategy>(env, "STKAI_RATE_LIMIT_STRATEGY")?,
            "STKAI_RATE_LIMIT_STRATEGY"
        );
        if let Some(preset) = env_parse::<RateLimitPreset>(env, "STKAI_RATE_LIMIT_PRESET")? {
            let (wait, floor, penalty, recovery) = preset.settings();
            let source = ConfigSource::Env("STKAI_RATE_LIMIT_PRESET".to_string());
            self.rate_limit.max_wait_time.set(wait.to_option(), source.clone());
            self.rate_limit.min_rate_floor.set(floor, source.clone());
            self.rate_limit.penalty_factor.set(penalty, source.clone());
            self.rate_limit.recovery_factor.set(recovery, source);
        }
        apply_env!(
            self.rate_limit.max_requests,
            env_parse::<u32>(env, "STKAI_RATE_LIMIT_MAX_REQUESTS")?,
            "STKAI_RATE_LIMIT_MAX_REQUESTS"
        );
        apply_env!(
            self.rate_limit.time_window,
            env_seconds(env, "STKAI_RATE_LIMIT_TIME_WINDOW")?,
            "STKAI_RATE_LIMIT_TIME_WINDOW"
        );
        apply_env!(
            self.rate_limit.max_wait_time,
            env_wait_limit(env, "STKAI_RATE_LIMIT_MAX_WAIT_TIME")?,
            "STKAI_RATE_LIMIT_MAX_WAIT_TIME"
        );
        apply_env!(
            self.rate_limit.min_rate_floor,
            env_parse::<f64>(env, "STKAI_RATE_LIMIT_MIN_RATE_FLOOR")?,
            "STKAI_RATE_LIMIT_MIN_RATE_FLOOR"
        );
        apply_env!(
            self.rate_limit.penalty_factor,
            env_parse::<f64>(env, "STKAI_RATE_LIMIT_PENALTY_FACTOR")?,
            "STKAI_RATE_LIMIT_PENALTY_FACTOR"
        );
        apply_env!(
            self.rate_limit.recovery_factor,
            env_parse::<f64>(env, "STKAI_RATE_LIMIT_RECOVERY_FACTOR")?,
            "STKAI_RATE_LIMIT_RECOVERY_FACTOR"
        );

        // sdk
        apply_env!(self.sdk.user_agent, env("STKAI_SDK_USER_AGENT"), "STKAI_SDK_USER_AGENT");

        Ok(())
    }

    fn apply_host_cli(&mut self, host_cli: &HostCliUrls) {
        if let Some(url) = &host_cli.rqc_base_url {
            self.rqc.base_url.set(url.clone(), ConfigSource::HostCli);
        }
        if let Some(url) = &host_cli.agent_base_url {
            self.agent.base_url.set(url.clone(), ConfigSource::HostCli);
        }
    }

    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(auth) = &overrides.auth {
            apply_user!(self.auth.client_id, auth.client_id.clone().map(Some));
            apply_user!(self.auth.client_secret, auth.client_secret.clone().map(Some));
            apply_user!(self.auth.token_url, auth.token_url.clone());
        }
        if let Some(rqc) = &overrides.rqc {
            apply_user!(self.rqc.request_timeout, rqc.request_timeout);
            apply_user!(self.rqc.retry_max_retries, rqc.retry_max_retries);
            apply_user!(self.rqc.retry_initial_delay, rqc.retry_initial_delay);
            apply_user!(self.rqc.poll_retry_max_retries, rqc.poll_retry_max_retries.map(Some));
            apply_user!(self.rqc.poll_interval, rqc.poll_interval);
            apply_user!(self.rqc.poll_max_duration, rqc.poll_max_duration);
            apply_user!(self.rqc.overload_timeout, rqc.overload_timeout);
            apply_user!(self.rqc.max_workers, rqc.max_workers);
            apply_user!(self.rqc.base_url, rqc.base_url.clone());
        }
        if let Some(agent) = &overrides.agent {
            apply_user!(self.agent.request_timeout, agent.request_timeout);
            apply_user!(self.agent.retry_max_retries, agent.retry_max_retries);
            apply_user!(self.agent.retry_initial_delay, agent.retry_initial_delay);
            apply_user!(self.agent.base_url, agent.base_url.clone());
        }
        if let Some(rl) = &overrides.rate_limit {
            if let Some(preset) = rl.preset {
                let (wait, floor, penalty, recovery) = preset.settings();
                self.rate_limit.max_wait_time.set(wait.to_option(), ConfigSource::User);
                self.rate_limit.min_rate_floor.set(floor, ConfigSource::User);
                self.rate_limit.penalty_factor.set(penalty, ConfigSource::User);
                self.rate_limit.recovery_factor.set(recovery, ConfigSource::User);
            }
            apply_user!(self.rate_limit.enabled, rl.enabled);
            apply_user!(self.rate_limit.strategy, rl.strategy);
            apply_user!(self.rate_limit.max_requests, rl.max_requests);
            apply_user!(self.rate_limit.time_window, rl.time_window);
            apply_user!(self.rate_limit.max_wait_time, rl.max_wait_time.map(WaitLimit::to_option));
            apply_user!(self.rate_limit.min_rate_floor, rl.min_rate_floor);
            apply_user!(self.rate_limit.penalty_factor, rl.penalty_factor);
            apply_user!(self.rate_limit.recovery_factor, rl.recovery_factor);
        }
        if let Some(sdk) = &overrides.sdk {
            apply_user!(self.sdk.user_agent, sdk.user_agent.clone());
        }
    }

    fn validate(&self) -> Result<()> {
        fn positive(name: &str, d: Duration) -> Result<()> {
            if d.is_zero() {
                return Err(Error::Configuration {
                    message: format!("{name} must be greater than 0"),
                });
            }
            Ok(())
        }
        fn valid_url(name: &str, value: &str) -> Result<()> {
            Url::parse(value).map_err(|e| Error::Configuration {
                message: format!("{name} is not a valid URL ({value:?}): {e}"),
            })?;
            Ok(())
        }
        fn open_unit_interval(name: &str, value: f64) -> Result<()> {
            if !(value > 0.0 && value < 1.0) {
                return Err(Error::Configuration {
                    message: format!("{name} must be between 0 and 1 (exclusive), got {value}"),
                });
            }
            Ok(())
        }

        valid_url("auth.token_url", self.auth.token_url.get())?;
        valid_url("rqc.base_url", self.rqc.base_url.get())?;
        valid_url("agent.base_url", self.agent.base_url.get())?;

        positive("rqc.request_timeout", self.rqc.request_timeout.copied())?;
        positive("rqc.retry_initial_delay", self.rqc.retry_initial_delay.copied())?;
        positive("rqc.poll_interval", self.rqc.poll_interval.copied())?;
        positive("rqc.poll_max_duration", self.rqc.poll_max_duration.copied())?;
        positive("rqc.overload_timeout", self.rqc.overload_timeout.copied())?;
        if self.rqc.max_workers.copied() == 0 {
            return Err(Error::Configuration {
                message: "rqc.max_workers must be at least 1".to_string(),
            });
        }

        positive("agent.request_timeout", self.agent.request_timeout.copied())?;
        positive("agent.retry_initial_delay", self.agent.retry_initial_delay.copied())?;

        let rl = &self.rate_limit;
        if rl.max_requests.copied() == 0 {
            return Err(Error::Configuration {
                message: "rate_limit.max_requests must be at least 1".to_string(),
            });
        }
        positive("rate_limit.time_window", rl.time_window.copied())?;
        if let Some(wait) = rl.max_wait_time.copied() {
            positive("rate_limit.max_wait_time", wait)?;
        }
        let floor = rl.min_rate_floor.copied();
        if !(floor > 0.0 && floor <= 1.0) {
            return Err(Error::Configuration {
                message: format!(
                    "rate_limit.min_rate_floor must be between 0 (exclusive) and 1 (inclusive), got {floor}"
                ),
            });
        }
        open_unit_interval("rate_limit.penalty_factor", rl.penalty_factor.copied())?;
        open_unit_interval("rate_limit.recovery_factor", rl.recovery_factor.copied())?;

        Ok(())
    }

    /// A value/source row for every field in every group.
    pub fn explain(&self) -> Vec<ExplainedField> {
        fn secs(d: &Duration) -> String {
            format!("{}s", d.as_secs_f64())
        }

        let mut rows = Vec::new();
        let mut push = |group: &'static str, option: &'static str, value: String, source: &ConfigSource| {
            rows.push(ExplainedField {
                group,
                option,
                value,
                source: source.clone(),
            });
        };

        push(
            "auth",
            "client_id",
            self.auth.client_id.get().clone().unwrap_or_else(|| "none".into()),
            self.auth.client_id.source(),
        );
        // Never echo the secret itself.
        push(
            "auth",
            "client_secret",
            if self.auth.client_secret.get().is_some() { "***".into() } else { "none".into() },
            self.auth.client_secret.source(),
        );
        push("auth", "token_url", self.auth.token_url.get().clone(), self.auth.token_url.source());

        let rqc = &self.rqc;
        push("rqc", "request_timeout", secs(rqc.request_timeout.get()), rqc.request_timeout.source());
        push("rqc", "retry_max_retries", rqc.retry_max_retries.copied().to_string(), rqc.retry_max_retries.source());
        push("rqc", "retry_initial_delay", secs(rqc.retry_initial_delay.get()), rqc.retry_initial_delay.source());
        push(
            "rqc",
            "poll_retry_max_retries",
            rqc.poll_retry_max_retries
                .copied()
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("derived:{}", rqc.effective_poll_retries())),
            rqc.poll_retry_max_retries.source(),
        );
        push("rqc", "poll_interval", secs(rqc.poll_interval.get()), rqc.poll_interval.source());
        push("rqc", "poll_max_duration", secs(rqc.poll_max_duration.get()), rqc.poll_max_duration.source());
        push("rqc", "overload_timeout", secs(rqc.overload_timeout.get()), rqc.overload_timeout.source());
        push("rqc", "max_workers", rqc.max_workers.copied().to_string(), rqc.max_workers.source());
        push("rqc", "base_url", rqc.base_url.get().clone(), rqc.base_url.source());

        let agent = &self.agent;
        push("agent", "request_timeout", secs(agent.request_timeout.get()), agent.request_timeout.source());
        push("agent", "retry_max_retries", agent.retry_max_retries.copied().to_string(), agent.retry_max_retries.source());
        push("agent", "retry_initial_delay", secs(agent.retry_initial_delay.get()), agent.retry_initial_delay.source());
        push("agent", "base_url", agent.base_url.get().clone(), agent.base_url.source());

        let rl = &self.rate_limit;
        push("rate_limit", "enabled", rl.enabled.copied().to_string(), rl.enabled.source());
        push("rate_limit", "strategy", rl.strategy.copied().to_string(), rl.strategy.source());
        push("rate_limit", "max_requests", rl.max_requests.copied().to_string(), rl.max_requests.source());
        push("rate_limit", "time_window", secs(rl.time_window.get()), rl.time_window.source());
        push(
            "rate_limit",
            "max_wait_time",
            rl.max_wait_time.copied().map(|d| secs(&d)).unwrap_or_else(|| "unlimited".into()),
            rl.max_wait_time.source(),
        );
        push("rate_limit", "min_rate_floor", rl.min_rate_floor.copied().to_string(), rl.min_rate_floor.source());
        push("rate_limit", "penalty_factor", rl.penalty_factor.copied().to_string(), rl.penalty_factor.source());
        push("rate_limit", "recovery_factor", rl.recovery_factor.copied().to_string(), rl.recovery_factor.source());

        push("sdk", "user_agent", self.sdk.user_agent.get().clone(), self.sdk.user_agent.source());

        rows
    }
}

/// One row of [`explain`] output.
#[derive(Debug, Clone)]
pub struct ExplainedField {
    pub group: &'static str,
    pub option: &'static str,
    pub value: String,
    pub source: ConfigSource,
}

// =============================================================================
// Process-wide registry
// =============================================================================

fn registry() -> &'static RwLock<Arc<Config>> {
    static REGISTRY: OnceLock<RwLock<Arc<Config>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let config = Config::from_environment().unwrap_or_else(|e| {
            // A broken environment should not poison every later read;
            // fall back to pure defaults and let configure() surface it.
            tracing::warn!("Ignoring invalid SDK environment configuration: {e}");
            Config::build(&|_| None, &HostCliUrls::default(), &Overrides::default(), false)
                .expect("default configuration is valid")
        });
        RwLock::new(Arc::new(config))
    })
}

/// Current configuration snapshot.
pub fn current() -> Arc<Config> {
    registry().read().expect("config registry lock poisoned").clone()
}

/// Apply user overrides on top of defaults (+ env when
/// `allow_env_override`, + host-CLI values) and publish the new snapshot.
pub fn configure(overrides: Overrides, allow_env_override: bool) -> Result<Arc<Config>> {
    let probe = EnvHostCliProbe::new();
    let config = Arc::new(Config::build(
        &env_var,
        &HostCliUrls::detect(&probe),
        &overrides,
        allow_env_override,
    )?);
    *registry().write().expect("config registry lock poisoned") = config.clone();
    Ok(config)
}

/// Reset to defaults + environment (+ host-CLI values).
pub fn reset() -> Arc<Config> {
    let config = Arc::new(Config::from_environment().unwrap_or_else(|e| {
        tracing::warn!("Ignoring invalid SDK environment configuration on reset: {e}");
        Config::build(&|_| None, &HostCliUrls::default(), &Overrides::default(), false)
            .expect("default configuration is valid")
    }));
    *registry().write().expect("config registry lock poisoned") = config.clone();
    config
}

/// Value/source rows for the current snapshot.
pub fn explain() -> Vec<ExplainedField> {
    current().explain()
}
