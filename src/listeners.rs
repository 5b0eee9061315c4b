//! Lifecycle event listeners for Remote Quick Command executions.
//!
//! Listeners are read-only observers of the execution state machine: they
//! can log, collect metrics or notify, but they do not influence the
//! outcome. A listener that panics is contained and logged; a faulty
//! observer must never corrupt an execution.
//!
//! The `context` map is shared across all notifications of a single
//! execution, so a listener can stash per-call state (e.g. a start
//! timestamp in `on_before_execute`, read back in `on_after_execute`).

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, warn};

use crate::rqc::{RqcExecutionStatus, RqcRequest, RqcResponse};

/// Mutable per-execution scratch space shared by all listener calls.
pub type ListenerContext = HashMap<String, Value>;

/// Observer of the RQC execution lifecycle.
///
/// Every method has a default empty implementation; implement only the
/// hooks you care about. Listeners are invoked synchronously in
/// registration order and must be safe for concurrent use when the batch
/// executor is in play.
pub trait RqcEventListener: Send + Sync {
    /// Before anything is sent.
    fn on_before_execute(&self, _request: &RqcRequest, _context: &mut ListenerContext) {}

    /// On every status transition, including the terminal one.
    fn on_status_change(
        &self,
        _request: &RqcRequest,
        _old_status: &RqcExecutionStatus,
        _new_status: &RqcExecutionStatus,
        _context: &mut ListenerContext,
    ) {
    }

    /// After the terminal outcome, success or not.
    fn on_after_execute(
        &self,
        _request: &RqcRequest,
        _response: &RqcResponse,
        _context: &mut ListenerContext,
    ) {
    }

    /// Entering the create-execution phase.
    fn on_create_execution_start(&self, _request: &RqcRequest, _context: &mut ListenerContext) {}

    /// Leaving the create-execution phase (the request carries the
    /// execution id on success).
    fn on_create_execution_end(&self, _request: &RqcRequest, _context: &mut ListenerContext) {}

    /// Entering the polling phase.
    fn on_get_result_start(&self, _request: &RqcRequest, _context: &mut ListenerContext) {}

    /// Leaving the polling phase with its outcome.
    fn on_get_result_end(
        &self,
        _request: &RqcRequest,
        _response: &RqcResponse,
        _context: &mut ListenerContext,
    ) {
    }
}

/// Invoke `event` on every listener, containing panics.
pub(crate) fn notify_all(
    listeners: &[Arc<dyn RqcEventListener>],
    tracking_id: &str,
    event: &str,
    mut invoke: impl FnMut(&dyn RqcEventListener),
) {
    for listener in listeners {
        let outcome = catch_unwind(AssertUnwindSafe(|| invoke(listener.as_ref())));
        if outcome.is_err() {
            warn!("{tracking_id} | RQC | Event listener `{event}` panicked; continuing");
        }
    }
}

// =============================================================================
// Built-in: file logging
// =============================================================================

/// Persists request and response JSON to disk for debugging.
///
/// Files land in the configured directory as
/// `{tracking_id}-request.json` and
/// `{tracking_id}-response-{status}.json`, where the tracking id is the
/// execution id when available and the request id otherwise.
pub struct FileLoggingListener {
    output_dir: PathBuf,
}

impl FileLoggingListener {
    /// Create the listener, creating `output_dir` if needed.
    pub fn new(output_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    fn sanitized_tracking_id(request: &RqcRequest) -> String {
        request
            .tracking_id()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '$' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn save_json(path: &Path, data: &Value) {
        let serialized = match serde_json::to_string_pretty(data) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to serialize JSON for {}: {e}", path.display());
                return;
            }
        };
        if let Err(e) = std::fs::write(path, serialized) {
            error!("Failed to write JSON file {}: {e}", path.display());
        }
    }
}

impl RqcEventListener for FileLoggingListener {
    fn on_status_change(
        &self,
        request: &RqcRequest,
        old_status: &RqcExecutionStatus,
        _new_status: &RqcExecutionStatus,
        _context: &mut ListenerContext,
    ) {
        // The first transition out of PENDING is the moment the request
        // payload is final (execution id included when creation worked).
        if *old_status == RqcExecutionStatus::Pending {
            let file = self
                .output_dir
                .join(format!("{}-request.json", Self::sanitized_tracking_id(request)));
            Self::save_json(&file, &request.input_data());
        }
    }

    fn on_after_execute(
        &self,
        request: &RqcRequest,
        response: &RqcResponse,
        _context: &mut ListenerContext,
    ) {
        let payload = if response.is_completed() {
            response.raw_response.clone().unwrap_or(Value::Null)
        } else {
            response.error_with_details()
        };
        let file = self.output_dir.join(format!(
            "{}-response-{}.json",
            Self::sanitized_tracking_id(request),
            response.status
        ));
        Self::save_json(&file, &payload);
    }
}
