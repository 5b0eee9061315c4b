//! Result handlers: post-processing for raw platform results.
//!
//! A handler turns the platform's raw `result` field into the value that
//! lands on the response envelope. Handlers compose linearly with
//! [`ChainedResultHandler`]; each link sees the previous link's output as
//! its `raw_result` with the `handled` flag set.
//!
//! Handler failures become [`Error::Handler`]: never retried, and the
//! owning client flips the call's outcome to ERROR.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::{Error, Result};

/// Everything a handler gets to look at while processing one result.
#[derive(Debug, Clone)]
pub struct ResultContext {
    /// Id of the originating request.
    pub request_id: String,
    /// Server-assigned execution id, when the protocol has one.
    pub execution_id: Option<String>,
    /// The value being processed: the platform's raw result for the first
    /// handler in a chain, the previous handler's output afterwards.
    pub raw_result: Value,
    /// The entire decoded response body.
    pub raw_response: Value,
    /// Whether an earlier handler in the chain already ran.
    pub handled: bool,
}

impl ResultContext {
    pub fn new(
        request_id: impl Into<String>,
        execution_id: Option<String>,
        raw_result: Value,
        raw_response: Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            execution_id,
            raw_result,
            raw_response,
            handled: false,
        }
    }

    /// Context for the next link of a chain.
    fn chained(&self, output: Value) -> Self {
        Self {
            request_id: self.request_id.clone(),
            execution_id: self.execution_id.clone(),
            raw_result: output,
            raw_response: self.raw_response.clone(),
            handled: true,
        }
    }

    /// Best id for log correlation: execution id when present.
    pub fn tracking_id(&self) -> &str {
        self.execution_id.as_deref().unwrap_or(&self.request_id)
    }
}

/// Transforms a raw result into the envelope's `result` value.
///
/// Handlers run on the worker that produced the response, so they must be
/// safe for concurrent invocation when batch execution is in play.
pub trait ResultHandler: Send + Sync {
    fn handle(&self, context: &ResultContext) -> Result<Value>;
}

/// Identity handler: the raw result passes through untouched.
#[derive(Debug, Clone, Default)]
pub struct RawResultHandler;

impl ResultHandler for RawResultHandler {
    fn handle(&self, context: &ResultContext) -> Result<Value> {
        Ok(context.raw_result.clone())
    }
}

/// Parses string results as JSON.
///
/// Accepts raw JSON strings and JSON wrapped in markdown code fences
/// (```json ... ```). Already-structured values come back as deep copies;
/// null and empty strings pass through unchanged. Idempotent: running the
/// parsed output through again returns the same value.
#[derive(Debug, Clone, Default)]
pub struct JsonResultHandler;

impl ResultHandler for JsonResultHandler {
    fn handle(&self, context: &ResultContext) -> Result<Value> {
        let raw = &context.raw_result;
        let text = match raw {
            Value::Null => return Ok(Value::Null),
            Value::String(s) if s.is_empty() => return Ok(raw.clone()),
            Value::String(s) => s,
            // Already structured.
            _ => return Ok(raw.clone()),
        };

        let sanitized = text.replace("```json", "").replace("```", "");
        let sanitized = sanitized.trim();

        serde_json::from_str(sanitized).map_err(|e| {
            let preview: String = text.lines().take(3).collect::<Vec<_>>().join(" | ");
            warn!(
                "{} | Result not in JSON format. Preview: {preview}",
                context.tracking_id()
            );
            Error::Handler {
                message: format!("Cannot parse result as JSON: {e}"),
            }
        })
    }
}

impl JsonResultHandler {
    /// JSON parsing followed by `other`: the common "parse, then shape"
    /// pipeline.
    pub fn chain_with(other: Arc<dyn ResultHandler>) -> ChainedResultHandler {
        let json: Arc<dyn ResultHandler> = Arc::new(JsonResultHandler);
        ChainedResultHandler::of(vec![json, other])
    }
}

/// Runs handlers in sequence, feeding each one the previous output.
///
/// The last handler's output becomes the envelope result.
pub struct ChainedResultHandler {
    handlers: Vec<Arc<dyn ResultHandler>>,
}

impl ChainedResultHandler {
    pub fn of(handlers: Vec<Arc<dyn ResultHandler>>) -> Self {
        Self { handlers }
    }
}

impl ResultHandler for ChainedResultHandler {
    fn handle(&self, context: &ResultContext) -> Result<Value> {
        let mut current = context.clone();
        let mut output = current.raw_result.clone();
        for handler in &self.handlers {
            output = handler.handle(&current)?;
            current = current.chained(output.clone());
        }
        Ok(output)
    }
}
