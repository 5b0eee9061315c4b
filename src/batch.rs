//! Bounded-concurrency batch executor shared by the RQC and Agent clients.
//!
//! Workers run as futures polled on the caller's task (no spawning), so
//! at most `max_workers` are in flight at once, results come back in
//! input order, and task-local state such as the active conversation
//! scope is visible to every worker.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::stream::{self, StreamExt};
use futures::FutureExt;

/// Run `run` over every request with at most `max_workers` concurrent
/// invocations.
///
/// Returns one response per request, in input order, and only once every
/// request has produced one. A panicking worker is converted into a
/// response via `on_panic`; the executor itself never fails.
pub(crate) async fn execute_bounded<Req, Resp, F, Fut>(
    requests: Vec<Req>,
    max_workers: usize,
    run: F,
    on_panic: impl Fn(Req, String) -> Resp,
) -> Vec<Resp>
where
    Req: Clone,
    F: Fn(Req) -> Fut,
    Fut: Future<Output = Resp>,
{
    stream::iter(requests.into_iter().map(|request| {
        let fallback = request.clone();
        let worker = run(request);
        async move {
            AssertUnwindSafe(worker)
                .catch_unwind()
                .await
                .map_err(|panic| (fallback, panic_message(panic)))
        }
    }))
    .buffered(max_workers.max(1))
    .collect::<Vec<_>>()
    .await
    .into_iter()
    .map(|outcome| match outcome {
        Ok(response) => response,
        Err((request, message)) => on_panic(request, message),
    })
    .collect()
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
