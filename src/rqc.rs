//! Remote Quick Command (RQC) client.
//!
//! RQC jobs run behind a two-phase protocol: a POST creates an execution,
//! then the client polls the execution resource until it reaches a
//! terminal status. [`RemoteQuickCommand`] drives that state machine with
//! retries around both phases, an overload watchdog for executions stuck
//! in `CREATED`, bounded-concurrency batch execution, result handlers and
//! lifecycle listeners.
//!
//! `execute` and `execute_many` never fail with an `Err`: every outcome
//! is folded into an [`RqcResponse`].

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch;
use crate::config::{self, RqcConfig};
use crate::handlers::{JsonResultHandler, ResultContext, ResultHandler};
use crate::jitter::sleep_with_jitter;
use crate::listeners::{notify_all, ListenerContext, RqcEventListener};
use crate::retry::RetryPolicy;
use crate::transport::{EnvironmentAwareTransport, HttpTransport};
use crate::{Error, Result};

/// Jitter applied to poll-interval sleeps (±10%).
const POLL_SLEEP_JITTER_FACTOR: f64 = 0.1;

// ======================
// Options
// ======================

/// Options for the create-execution phase.
#[derive(Debug, Clone)]
pub struct CreateExecutionOptions {
    /// Retry budget for failed create calls.
    pub max_retries: u32,
    /// Base for the exponential backoff between attempts.
    pub initial_delay: Duration,
    /// Per-HTTP-call timeout.
    pub request_timeout: Duration,
}

impl Default for CreateExecutionOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl CreateExecutionOptions {
    pub fn from_config(cfg: &RqcConfig) -> Self {
        Self {
            max_retries: cfg.retry_max_retries.copied(),
            initial_delay: cfg.retry_initial_delay.copied(),
            request_timeout: cfg.request_timeout.copied(),
        }
    }
}

/// Options for the get-result (polling) phase.
#[derive(Debug, Clone)]
pub struct GetResultOptions {
    /// Cadence between polls, measured from the end of the previous poll.
    pub poll_interval: Duration,
    /// Wall-clock bound on the entire polling phase.
    pub poll_max_duration: Duration,
    /// How long an execution may sit in `CREATED` before the client gives
    /// up on an overloaded server.
    pub overload_timeout: Duration,
    /// Per-HTTP-call timeout.
    pub request_timeout: Duration,
    /// Retry budget for each individual poll. Intentionally smaller than
    /// the create budget since the loop itself already re-polls.
    pub max_retries: u32,
}

impl Default for GetResultOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            poll_max_duration: Duration::from_secs(600),
            overload_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            max_retries: 1,
        }
    }
}

impl GetResultOptions {
    pub fn from_config(cfg: &RqcConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval.copied(),
            poll_max_duration: cfg.poll_max_duration.copied(),
            overload_timeout: cfg.overload_timeout.copied(),
            request_timeout: cfg.request_timeout.copied(),
            max_retries: cfg.effective_poll_retries(),
        }
    }
}

// ======================
// Data models
// ======================

/// Status of an RQC execution lifecycle.
///
/// The server may introduce new intermediate states at any time; those
/// parse as [`RqcExecutionStatus::Other`] and are treated as non-terminal
/// so polling simply continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RqcExecutionStatus {
    /// Client-side status before the request reaches the server.
    Pending,
    /// Server accepted the request but has not started work.
    Created,
    /// Server is processing the execution.
    Running,
    /// Finished successfully with a result.
    Completed,
    /// Failed on the server side.
    Failure,
    /// Client-side error (network, malformed response, handler failure)
    /// or server-reported `ERROR`.
    Error,
    /// Did not finish within the polling budget.
    Timeout,
    /// Unrecognized server-reported status (non-terminal).
    Other(String),
}

impl RqcExecutionStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_uppercase().as_str() {
            "PENDING" => RqcExecutionStatus::Pending,
            "CREATED" => RqcExecutionStatus::Created,
            "RUNNING" => RqcExecutionStatus::Running,
            "COMPLETED" => RqcExecutionStatus::Completed,
            "FAILURE" => RqcExecutionStatus::Failure,
            "ERROR" => RqcExecutionStatus::Error,
            "TIMEOUT" => RqcExecutionStatus::Timeout,
            other => RqcExecutionStatus::Other(other.to_string()),
        }
    }

    /// Server-reported statuses from which no further progress happens.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RqcExecutionStatus::Completed | RqcExecutionStatus::Failure | RqcExecutionStatus::Error
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            RqcExecutionStatus::Pending => "PENDING",
            RqcExecutionStatus::Created => "CREATED",
            RqcExecutionStatus::Running => "RUNNING",
            RqcExecutionStatus::Completed => "COMPLETED",
            RqcExecutionStatus::Failure => "FAILURE",
            RqcExecutionStatus::Error => "ERROR",
            RqcExecutionStatus::Timeout => "TIMEOUT",
            RqcExecutionStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for RqcExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A Remote Quick Command request.
#[derive(Debug, Clone)]
pub struct RqcRequest {
    /// Input data sent to the Quick Command.
    pub payload: Value,
    /// Caller-visible identifier; generated when not provided.
    pub id: String,
    /// Free-form metadata for tracking; not sent to the server.
    pub metadata: HashMap<String, Value>,
    execution_id: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
}

impl RqcRequest {
    pub fn new(payload: Value) -> Self {
        Self::with_request_id(payload, Uuid::new_v4().to_string())
    }

    pub fn with_request_id(payload: Value, id: impl Into<String>) -> Self {
        let id = id.into();
        assert!(!id.is_empty(), "Request ID can not be empty");
        Self {
            payload,
            id,
            metadata: HashMap::new(),
            execution_id: None,
            submitted_at: None,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Server-assigned execution id, set after a successful create.
    pub fn execution_id(&self) -> Option<&str> {
        self.execution_id.as_deref()
    }

    /// Submission timestamp (wall clock, for auditing), set after a
    /// successful create.
    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub(crate) fn mark_submitted(&mut self, execution_id: String) {
        assert!(!execution_id.is_empty(), "Execution ID can not be empty");
        self.execution_id = Some(execution_id);
        self.submitted_at = Some(Utc::now());
    }

    /// Body shape the create-execution endpoint expects.
    pub fn input_data(&self) -> Value {
        json!({ "input_data": self.payload })
    }

    /// Execution id when available, request id otherwise.
    pub fn tracking_id(&self) -> &str {
        self.execution_id.as_deref().unwrap_or(&self.id)
    }
}

/// Terminal outcome of a Remote Quick Command execution.
#[derive(Debug, Clone)]
pub struct RqcResponse {
    /// The request that produced this response, audit fields included.
    pub request: RqcRequest,
    /// Terminal status: COMPLETED, FAILURE, ERROR or TIMEOUT.
    pub status: RqcExecutionStatus,
    /// Handler-processed result; only set when COMPLETED.
    pub result: Option<Value>,
    /// Human-readable failure description; set on non-COMPLETED outcomes.
    pub error: Option<String>,
    /// Entire decoded body of the final poll response.
    pub raw_response: Option<Value>,
}

impl RqcResponse {
    pub fn completed(request: RqcRequest, result: Value, raw_response: Value) -> Self {
        Self {
            request,
            status: RqcExecutionStatus::Completed,
            result: Some(result),
            error: None,
            raw_response: Some(raw_response),
        }
    }

    pub fn failure(request: RqcRequest, error: impl Into<String>, raw_response: Value) -> Self {
        Self {
            request,
            status: RqcExecutionStatus::Failure,
            result: None,
            error: Some(error.into()),
            raw_response: Some(raw_response),
        }
    }

    pub fn error(request: RqcRequest, error: impl Into<String>) -> Self {
        Self {
            request,
            status: RqcExecutionStatus::Error,
            result: None,
            error: Some(error.into()),
            raw_response: None,
        }
    }

    pub fn error_with_raw(
        request: RqcRequest,
        error: impl Into<String>,
        raw_response: Value,
    ) -> Self {
        Self {
            request,
            status: RqcExecutionStatus::Error,
            result: None,
            error: Some(error.into()),
            raw_response: Some(raw_response),
        }
    }

    pub fn timeout(request: RqcRequest, error: impl Into<String>) -> Self {
        Self {
            request,
            status: RqcExecutionStatus::Timeout,
            result: None,
            error: Some(error.into()),
            raw_response: None,
        }
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.request.execution_id()
    }

    /// The platform's uninterpreted `result` field from the raw response.
    pub fn raw_result(&self) -> Option<Value> {
        self.raw_response.as_ref().and_then(|raw| raw.get("result").cloned())
    }

    pub fn is_completed(&self) -> bool {
        self.status == RqcExecutionStatus::Completed
    }

    pub fn is_failure(&self) -> bool {
        self.status == RqcExecutionStatus::Failure
    }

    pub fn is_error(&self) -> bool {
        self.status == RqcExecutionStatus::Error
    }

    pub fn is_timeout(&self) -> bool {
        self.status == RqcExecutionStatus::Timeout
    }

    /// Summary of a non-completed outcome, for logs and file dumps.
    pub fn error_with_details(&self) -> Value {
        if self.is_completed() {
            return json!({});
        }
        json!({
            "status": self.status.as_str(),
            "error_message": self.error,
            "response_body": self.raw_response.clone().unwrap_or(json!({})),
        })
    }
}

// ======================
// Client
// ======================

/// Client for executing Remote Quick Commands.
///
/// ```rust,no_run
/// use stkai_sdk::{RemoteQuickCommand, RqcRequest};
/// use serde_json::json;
///
/// # async fn demo() {
/// let rqc = RemoteQuickCommand::new("my-quick-command");
/// let response = rqc.execute(RqcRequest::new(json!({"prompt": "Hello!"}))).await;
/// if response.is_completed() {
///     println!("{:?}", response.result);
/// }
/// # }
/// ```
pub struct RemoteQuickCommand {
    slug_name: String,
    base_url: String,
    create_options: CreateExecutionOptions,
    get_result_options: GetResultOptions,
    max_workers: usize,
    transport: Arc<dyn HttpTransport>,
    listeners: Vec<Arc<dyn RqcEventListener>>,
    result_handler: Arc<dyn ResultHandler>,
}

/// Builder for [`RemoteQuickCommand`]; unset options fall back to the
/// configuration registry.
pub struct RemoteQuickCommandBuilder {
    slug_name: String,
    base_url: Option<String>,
    create_options: Option<CreateExecutionOptions>,
    get_result_options: Option<GetResultOptions>,
    max_workers: Option<usize>,
    transport: Option<Arc<dyn HttpTransport>>,
    listeners: Vec<Arc<dyn RqcEventListener>>,
    result_handler: Option<Arc<dyn ResultHandler>>,
}

impl RemoteQuickCommandBuilder {
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn create_execution_options(mut self, options: CreateExecutionOptions) -> Self {
        self.create_options = Some(options);
        self
    }

    pub fn get_result_options(mut self, options: GetResultOptions) -> Self {
        self.get_result_options = Some(options);
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        assert!(max_workers > 0, "max_workers must be greater than 0");
        self.max_workers = Some(max_workers);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register a lifecycle listener; call repeatedly to register several.
    pub fn listener(mut self, listener: Arc<dyn RqcEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Replace the default [`JsonResultHandler`].
    pub fn result_handler(mut self, handler: Arc<dyn ResultHandler>) -> Self {
        self.result_handler = Some(handler);
        self
    }

    pub fn build(self) -> RemoteQuickCommand {
        let cfg = config::current();
        RemoteQuickCommand {
            slug_name: self.slug_name,
            base_url: self.base_url.unwrap_or_else(|| cfg.rqc.base_url.get().clone()),
            create_options: self
                .create_options
                .unwrap_or_else(|| CreateExecutionOptions::from_config(&cfg.rqc)),
            get_result_options: self
                .get_result_options
                .unwrap_or_else(|| GetResultOptions::from_config(&cfg.rqc)),
            max_workers: self.max_workers.unwrap_or_else(|| cfg.rqc.max_workers.copied()),
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(EnvironmentAwareTransport::new())),
            listeners: self.listeners,
            result_handler: self.result_handler.unwrap_or_else(|| Arc::new(JsonResultHandler)),
        }
    }
}

impl RemoteQuickCommand {
    /// Client with registry defaults and the environment-aware transport.
    pub fn new(slug_name: impl Into<String>) -> Self {
        Self::builder(slug_name).build()
    }

    pub fn builder(slug_name: impl Into<String>) -> RemoteQuickCommandBuilder {
        let slug_name = slug_name.into();
        assert!(!slug_name.is_empty(), "RQC slug_name can not be empty");
        RemoteQuickCommandBuilder {
            slug_name,
            base_url: None,
            create_options: None,
            get_result_options: None,
            max_workers: None,
            transport: None,
            listeners: Vec::new(),
            result_handler: None,
        }
    }

    pub fn slug_name(&self) -> &str {
        &self.slug_name
    }

    // ======================
    // Public API
    // ======================

    /// Execute a single Quick Command and wait for its terminal outcome.
    pub async fn execute(&self, request: RqcRequest) -> RqcResponse {
        info!(
            "{} | RQC | Starting execution (slug='{}')",
            short_id(&request.id),
            self.slug_name
        );
        let response = self.execute_workflow(request, &self.result_handler).await;
        info!(
            "{} | RQC | Execution finished with status: {}",
            short_id(&response.request.id),
            response.status
        );
        response
    }

    /// Execute with a one-off result handler instead of the configured one.
    pub async fn execute_with(
        &self,
        request: RqcRequest,
        handler: Arc<dyn ResultHandler>,
    ) -> RqcResponse {
        self.execute_workflow(request, &handler).await
    }

    /// Execute many Quick Commands with at most `max_workers` in flight.
    ///
    /// Responses come back in input order once every request has one;
    /// worker panics become ERROR responses.
    pub async fn execute_many(&self, requests: Vec<RqcRequest>) -> Vec<RqcResponse> {
        if requests.is_empty() {
            return Vec::new();
        }

        info!(
            "RQC-Batch | Starting batch execution of {} requests (max_workers={}, slug='{}')",
            requests.len(),
            self.max_workers,
            self.slug_name
        );

        let responses = batch::execute_bounded(
            requests,
            self.max_workers,
            |request| self.execute_workflow(request, &self.result_handler),
            |request, message| {
                error!(
                    "{} | RQC | Batch worker panicked: {message}",
                    short_id(&request.id)
                );
                RqcResponse::error(request, format!("Batch worker panicked: {message}"))
            },
        )
        .await;

        let mut totals: BTreeMap<&str, usize> = BTreeMap::new();
        for response in &responses {
            *totals.entry(response.status.as_str()).or_default() += 1;
        }
        info!("RQC-Batch | Batch finished with {} responses", responses.len());
        for (status, total) in totals {
            info!("RQC-Batch |   {status}: {total}");
        }
        responses
    }

    // ======================
    // Workflow
    // ======================

    async fn execute_workflow(
        &self,
        mut request: RqcRequest,
        handler: &Arc<dyn ResultHandler>,
    ) -> RqcResponse {
        let mut context = ListenerContext::new();

        self.notify(request.tracking_id(), "on_before_execute", |l| {
            l.on_before_execute(&request, &mut context)
        });

        // Phase 1: create the remote execution.
        self.notify(request.tracking_id(), "on_create_execution_start", |l| {
            l.on_create_execution_start(&request, &mut context)
        });
        let created = self.create_execution(&mut request).await;
        self.notify(request.tracking_id(), "on_create_execution_end", |l| {
            l.on_create_execution_end(&request, &mut context)
        });

        let execution_id = match created {
            Ok(execution_id) => execution_id,
            Err(e) => {
                error!("{} | RQC | Failed to create execution: {e}", short_id(&request.id));
                self.notify(request.tracking_id(), "on_status_change", |l| {
                    l.on_status_change(
                        &request,
                        &RqcExecutionStatus::Pending,
                        &RqcExecutionStatus::Error,
                        &mut context,
                    )
                });
                let response = RqcResponse::error(request, format!("Failed to create execution: {e}"));
                self.notify(response.request.tracking_id(), "on_after_execute", |l| {
                    l.on_after_execute(&response.request, &response, &mut context)
                });
                return response;
            }
        };

        self.notify(request.tracking_id(), "on_status_change", |l| {
            l.on_status_change(
                &request,
                &RqcExecutionStatus::Pending,
                &RqcExecutionStatus::Created,
                &mut context,
            )
        });

        // Phase 2: poll until a terminal outcome.
        self.notify(request.tracking_id(), "on_get_result_start", |l| {
            l.on_get_result_start(&request, &mut context)
        });
        let response = self
            .poll_until_done(request, &execution_id, handler.as_ref(), &mut context)
            .await;
        self.notify(response.request.tracking_id(), "on_get_result_end", |l| {
            l.on_get_result_end(&response.request, &response, &mut context)
        });
        self.notify(response.request.tracking_id(), "on_after_execute", |l| {
            l.on_after_execute(&response.request, &response, &mut context)
        });
        response
    }

    /// Create the execution, retrying transient failures.
    async fn create_execution(&self, request: &mut RqcRequest) -> Result<String> {
        let url = format!(
            "{}/v1/quick-commands/create-execution/{}",
            self.base_url.trim_end_matches('/'),
            self.slug_name
        );
        let body = request.input_data();
        let request_id = request.id.clone();
        let timeout = self.create_options.request_timeout;
        let policy = RetryPolicy::new(self.create_options.max_retries, self.create_options.initial_delay);

        let execution_id: String = policy
            .run(|ctx| {
                let transport = Arc::clone(&self.transport);
                let url = url.clone();
                let body = body.clone();
                let request_id = request_id.clone();
                async move {
                    info!(
                        "{} | RQC | Creating execution (attempt {}/{})...",
                        short_id(&request_id),
                        ctx.attempt,
                        ctx.max_attempts
                    );
                    let response = transport.post(&url, &body, timeout).await?;
                    let response = response.error_for_status()?;
                    let value: Value = response.json()?;
                    parse_execution_id(&value).ok_or_else(|| Error::MalformedResponse {
                        message: "No `execution_id` returned in the create-execution response"
                            .to_string(),
                    })
                }
            })
            .await?;

        request.mark_submitted(execution_id.clone());
        info!(
            "{} | RQC | Execution successfully created ({execution_id})",
            short_id(&request.id)
        );
        Ok(execution_id)
    }

    /// Poll the execution resource until it reaches a terminal state.
    async fn poll_until_done(
        &self,
        request: RqcRequest,
        execution_id: &str,
        handler: &dyn ResultHandler,
        context: &mut ListenerContext,
    ) -> RqcResponse {
        let options = &self.get_result_options;
        let started = Instant::now();
        // PENDING -> CREATED was already announced before this phase.
        let mut last_status = RqcExecutionStatus::Created;
        let mut created_since: Option<Instant> = None;
        let poll_policy = RetryPolicy::new(options.max_retries, self.create_options.initial_delay);
        let no_cache_headers: Vec<(String, String)> = vec![
            ("Cache-Control".to_string(), "no-cache".to_string()),
            ("Pragma".to_string(), "no-cache".to_string()),
        ];

        info!("{execution_id} | RQC | Starting polling loop...");

        loop {
            if started.elapsed() > options.poll_max_duration {
                let message = format!(
                    "Timeout after {}s waiting for the execution to complete. Last status: `{last_status}`.",
                    options.poll_max_duration.as_secs_f64()
                );
                error!("{execution_id} | RQC | {message}");
                self.notify(execution_id, "on_status_change", |l| {
                    l.on_status_change(&request, &last_status, &RqcExecutionStatus::Timeout, context)
                });
                return RqcResponse::timeout(request, message);
            }

            let poll_result: Result<Value> = poll_policy
                .run(|_ctx| {
                    let transport = Arc::clone(&self.transport);
                    let base_url = self.base_url.clone();
                    let headers = no_cache_headers.clone();
                    let execution_id = execution_id.to_string();
                    let timeout = options.request_timeout;
                    async move {
                        // Cache-busting query param; some proxies ignore the
                        // no-cache headers on GET.
                        let nocache: u32 = rand::thread_rng().gen_range(0..1_000_000);
                        let url = format!(
                            "{}/v1/quick-commands/callback/{}?nocache={}",
                            base_url.trim_end_matches('/'),
                            execution_id,
                            nocache
                        );
                        let response = transport.get(&url, &headers, timeout).await?;
                        let response = response.error_for_status()?;
                        response.json::<Value>()
                    }
                })
                .await;

            let response_data = match poll_result {
                Ok(data) => data,
                Err(e) => {
                    error!("{execution_id} | RQC | Error during polling: {e}");
                    return RqcResponse::error(request, format!("Error during polling: {e}"));
                }
            };

            let status = match response_data.pointer("/progress/status").and_then(Value::as_str) {
                Some(raw) => RqcExecutionStatus::parse(raw),
                None => {
                    error!("{execution_id} | RQC | Poll response is missing `progress.status`");
                    return RqcResponse::error_with_raw(
                        request,
                        "Malformed poll response: missing `progress.status` field",
                        response_data,
                    );
                }
            };

            if status != last_status {
                info!("{execution_id} | RQC | Current status: {status}");
                self.notify(execution_id, "on_status_change", |l| {
                    l.on_status_change(&request, &last_status, &status, context)
                });
                last_status = status.clone();
            }

            match &status {
                RqcExecutionStatus::Completed => {
                    info!("{execution_id} | RQC | Processing the execution result...");
                    let raw_result = response_data.get("result").cloned().unwrap_or(Value::Null);
                    let handler_context = ResultContext::new(
                        request.id.clone(),
                        Some(execution_id.to_string()),
                        raw_result,
                        response_data.clone(),
                    );
                    match handler.handle(&handler_context) {
                        Ok(processed) => {
                            info!("{execution_id} | RQC | Execution finished with status: {status}");
                            return RqcResponse::completed(request, processed, response_data);
                        }
                        Err(e) => {
                            // The job itself completed; failing to shape its
                            // result is a client-side ERROR outcome.
                            error!("{execution_id} | RQC | Result handler failed: {e}");
                            return RqcResponse::error_with_raw(
                                request,
                                format!("Error while processing the result: {e}"),
                                response_data,
                            );
                        }
                    }
                }
                RqcExecutionStatus::Failure => {
                    error!("{execution_id} | RQC | Execution failed on the server side");
                    return RqcResponse::failure(
                        request,
                        "Execution failed on the server side with status 'FAILURE'",
                        response_data,
                    );
                }
                RqcExecutionStatus::Error => {
                    error!("{execution_id} | RQC | Execution finished with server status 'ERROR'");
                    return RqcResponse::error_with_raw(
                        request,
                        "Execution finished on the server side with status 'ERROR'",
                        response_data,
                    );
                }
                RqcExecutionStatus::Created => {
                    let since = *created_since.get_or_insert_with(Instant::now);
                    let elapsed_in_created = since.elapsed();
                    if elapsed_in_created > options.overload_timeout {
                        let message = format!(
                            "Execution stuck in CREATED status for {:.2}s. The server may be overloaded (queue backpressure).",
                            elapsed_in_created.as_secs_f64()
                        );
                        error!("{execution_id} | RQC | {message}");
                        self.notify(execution_id, "on_status_change", |l| {
                            l.on_status_change(
                                &request,
                                &last_status,
                                &RqcExecutionStatus::Timeout,
                                context,
                            )
                        });
                        return RqcResponse::timeout(request, message);
                    }
                    warn!(
                        "{execution_id} | RQC | Execution still in CREATED status ({:.2}s/{:.2}s). Possible server overload...",
                        elapsed_in_created.as_secs_f64(),
                        options.overload_timeout.as_secs_f64()
                    );
                    sleep_with_jitter(options.poll_interval, POLL_SLEEP_JITTER_FACTOR).await;
                }
                _ => {
                    debug!(
                        "{execution_id} | RQC | Execution still running ({last_status}); next poll in ~{}s",
                        options.poll_interval.as_secs_f64()
                    );
                    sleep_with_jitter(options.poll_interval, POLL_SLEEP_JITTER_FACTOR).await;
                }
            }
        }
    }

    fn notify(&self, tracking_id: &str, event: &str, invoke: impl FnMut(&dyn RqcEventListener)) {
        notify_all(&self.listeners, tracking_id, event, invoke);
    }
}

/// The create endpoint answers with the execution id, either bare or
/// wrapped in an object.
fn parse_execution_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => match map.get("execution_id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        },
        _ => None,
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(26).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_known_and_unknown() {
        assert_eq!(RqcExecutionStatus::parse("completed"), RqcExecutionStatus::Completed);
        assert_eq!(RqcExecutionStatus::parse("CREATED"), RqcExecutionStatus::Created);
        assert_eq!(
            RqcExecutionStatus::parse("preparing"),
            RqcExecutionStatus::Other("PREPARING".to_string())
        );
        assert!(!RqcExecutionStatus::parse("PREPARING").is_terminal());
        assert!(RqcExecutionStatus::Completed.is_terminal());
        assert!(RqcExecutionStatus::Failure.is_terminal());
        assert!(RqcExecutionStatus::Error.is_terminal());
        assert!(!RqcExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn test_parse_execution_id_shapes() {
        assert_eq!(parse_execution_id(&json!("e1")), Some("e1".to_string()));
        assert_eq!(parse_execution_id(&json!({"execution_id": "e2"})), Some("e2".to_string()));
        assert_eq!(parse_execution_id(&json!("")), None);
        assert_eq!(parse_execution_id(&json!({"execution_id": ""})), None);
        assert_eq!(parse_execution_id(&json!({"other": "x"})), None);
        assert_eq!(parse_execution_id(&json!(42)), None);
    }

    #[test]
    fn test_request_audit_fields() {
        let mut request = RqcRequest::new(json!({"x": 1}));
        assert!(request.execution_id().is_none());
        assert!(request.submitted_at().is_none());
        assert_eq!(request.tracking_id(), request.id);

        request.mark_submitted("e1".to_string());
        assert_eq!(request.execution_id(), Some("e1"));
        assert!(request.submitted_at().is_some());
        assert_eq!(request.tracking_id(), "e1");
    }

    #[test]
    fn test_request_input_data_shape() {
        let request = RqcRequest::new(json!({"prompt": "hi"}));
        assert_eq!(request.input_data(), json!({"input_data": {"prompt": "hi"}}));
    }

    #[test]
    fn test_response_predicates_and_raw_result() {
        let request = RqcRequest::new(json!({"x": 1}));
        let response = RqcResponse::completed(
            request.clone(),
            json!({"y": 2}),
            json!({"result": "{\"y\": 2}", "progress": {"status": "COMPLETED"}}),
        );
        assert!(response.is_completed());
        assert_eq!(response.raw_result(), Some(json!("{\"y\": 2}")));
        assert_eq!(response.error_with_details(), json!({}));

        let response = RqcResponse::timeout(request, "took too long");
        assert!(response.is_timeout());
        let details = response.error_with_details();
        assert_eq!(details["status"], json!("TIMEOUT"));
        assert_eq!(details["error_message"], json!("took too long"));
    }
}
