//! End-to-end Remote Quick Command scenarios against a scripted transport.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use stkai_sdk::{
    CreateExecutionOptions, GetResultOptions, JsonResultHandler, ListenerContext,
    RemoteQuickCommand, RqcEventListener, RqcExecutionStatus, RqcRequest, RqcResponse,
};
use support::MockTransport;
use tokio::time::Instant;

fn fast_poll_options() -> GetResultOptions {
    GetResultOptions {
        poll_interval: Duration::from_secs(1),
        poll_max_duration: Duration::from_secs(60),
        overload_timeout: Duration::from_secs(30),
        request_timeout: Duration::from_secs(5),
        max_retries: 1,
    }
}

fn client(transport: Arc<MockTransport>) -> RemoteQuickCommand {
    RemoteQuickCommand::builder("my-command")
        .base_url("https://rqc.test")
        .transport(transport)
        .create_execution_options(CreateExecutionOptions {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(5),
        })
        .get_result_options(fast_poll_options())
        .build()
}

#[tokio::test(start_paused = true)]
async fn happy_path_returns_parsed_result() {
    let transport = Arc::new(MockTransport::new());
    transport.push_post(200, json!("e1"));
    transport.push_get(200, json!({"progress": {"status": "RUNNING"}}));
    transport.push_get(200, json!({"progress": {"status": "COMPLETED"}, "result": "{\"y\": 2}"}));

    let rqc = client(transport.clone());
    let started = Instant::now();
    let response = rqc
        .execute(RqcRequest::with_request_id(json!({"x": 1}), "r1"))
        .await;

    assert!(response.is_completed(), "unexpected: {:?}", response.error);
    assert_eq!(response.result, Some(json!({"y": 2})));
    assert_eq!(response.raw_result(), Some(json!("{\"y\": 2}")));
    assert_eq!(response.execution_id(), Some("e1"));
    assert!(response.request.submitted_at().is_some());

    // One RUNNING poll, one sleep, one COMPLETED poll.
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert!(started.elapsed() <= Duration::from_millis(2500));
    assert_eq!(transport.post_count(), 1);
    assert_eq!(transport.get_count(), 2);

    let create_url = transport.post_urls.lock().unwrap()[0].clone();
    assert_eq!(create_url, "https://rqc.test/v1/quick-commands/create-execution/my-command");
    let poll_url = transport.get_urls.lock().unwrap()[0].clone();
    assert!(poll_url.starts_with("https://rqc.test/v1/quick-commands/callback/e1?nocache="));
    let body = transport.post_bodies.lock().unwrap()[0].clone();
    assert_eq!(body, json!({"input_data": {"x": 1}}));
}

#[tokio::test(start_paused = true)]
async fn transient_create_failure_is_retried() {
    let transport = Arc::new(MockTransport::new());
    transport.push_post(503, json!({"error": "unavailable"}));
    transport.push_post(200, json!({"execution_id": "e1"}));
    transport.push_get(200, json!({"progress": {"status": "COMPLETED"}, "result": "{}"}));

    let rqc = client(transport.clone());
    let started = Instant::now();
    let response = rqc.execute(RqcRequest::new(json!({"x": 1}))).await;

    assert!(response.is_completed(), "unexpected: {:?}", response.error);
    assert_eq!(transport.post_count(), 2);
    // The retry backed off for at least the initial delay.
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn client_error_on_create_is_not_retried() {
    let transport = Arc::new(MockTransport::new());
    transport.push_post(404, json!({"error": "no such command"}));

    let rqc = client(transport.clone());
    let response = rqc.execute(RqcRequest::new(json!({"x": 1}))).await;

    assert!(response.is_error());
    assert!(response.error.as_deref().unwrap().contains("Failed to create execution"));
    assert_eq!(transport.post_count(), 1);
    assert_eq!(transport.get_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_execution_id_is_a_malformed_response() {
    let transport = Arc::new(MockTransport::new());
    transport.push_post(200, json!({"something_else": true}));

    let rqc = client(transport.clone());
    let response = rqc.execute(RqcRequest::new(json!({"x": 1}))).await;

    assert!(response.is_error());
    assert!(response.error.as_deref().unwrap().contains("execution_id"));
    assert_eq!(transport.get_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stuck_in_created_trips_the_overload_watchdog() {
    let transport = Arc::new(MockTransport::new());
    transport.push_post(200, json!("e2"));
    transport.set_sticky_get(200, json!({"progress": {"status": "CREATED"}}));

    let rqc = RemoteQuickCommand::builder("my-command")
        .base_url("https://rqc.test")
        .transport(transport.clone())
        .create_execution_options(CreateExecutionOptions {
            max_retries: 0,
            initial_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(5),
        })
        .get_result_options(GetResultOptions {
            poll_interval: Duration::from_millis(500),
            poll_max_duration: Duration::from_secs(600),
            overload_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            max_retries: 0,
        })
        .build();

    let started = Instant::now();
    let response = rqc.execute(RqcRequest::new(json!({"x": 1}))).await;

    assert!(response.is_timeout());
    assert!(response.error.as_deref().unwrap().contains("overloaded"));
    // The watchdog fires around overload_timeout, well before
    // poll_max_duration.
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() <= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn unknown_status_is_non_terminal() {
    let transport = Arc::new(MockTransport::new());
    transport.push_post(200, json!("e1"));
    transport.push_get(200, json!({"progress": {"status": "PREPARING"}}));
    transport.push_get(200, json!({"progress": {"status": "COMPLETED"}, "result": "{\"ok\": true}"}));

    let rqc = client(transport.clone());
    let response = rqc.execute(RqcRequest::new(json!({"x": 1}))).await;

    assert!(response.is_completed());
    assert_eq!(response.result, Some(json!({"ok": true})));
}

#[tokio::test(start_paused = true)]
async fn poll_budget_expiry_is_a_timeout() {
    let transport = Arc::new(MockTransport::new());
    transport.push_post(200, json!("e1"));
    transport.set_sticky_get(200, json!({"progress": {"status": "RUNNING"}}));

    let rqc = RemoteQuickCommand::builder("my-command")
        .base_url("https://rqc.test")
        .transport(transport.clone())
        .create_execution_options(CreateExecutionOptions {
            max_retries: 0,
            initial_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(5),
        })
        .get_result_options(GetResultOptions {
            poll_interval: Duration::from_secs(1),
            poll_max_duration: Duration::from_secs(3),
            overload_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
            max_retries: 0,
        })
        .build();

    let response = rqc.execute(RqcRequest::new(json!({"x": 1}))).await;

    assert!(response.is_timeout());
    assert!(response.error.as_deref().unwrap().contains("Timeout after"));
    assert!(response.error.as_deref().unwrap().contains("RUNNING"));
}

#[tokio::test(start_paused = true)]
async fn server_failure_status_maps_to_failure() {
    let transport = Arc::new(MockTransport::new());
    transport.push_post(200, json!("e1"));
    transport.push_get(200, json!({"progress": {"status": "FAILURE"}, "detail": "boom"}));

    let rqc = client(transport.clone());
    let response = rqc.execute(RqcRequest::new(json!({"x": 1}))).await;

    assert!(response.is_failure());
    assert_eq!(response.raw_response.as_ref().unwrap()["detail"], json!("boom"));
}

#[tokio::test(start_paused = true)]
async fn handler_failure_flips_completed_to_error() {
    let transport = Arc::new(MockTransport::new());
    transport.push_post(200, json!("e1"));
    transport.push_get(
        200,
        json!({"progress": {"status": "COMPLETED"}, "result": "plain prose, not json"}),
    );

    let rqc = RemoteQuickCommand::builder("my-command")
        .base_url("https://rqc.test")
        .transport(transport.clone())
        .create_execution_options(CreateExecutionOptions::default())
        .get_result_options(fast_poll_options())
        .result_handler(Arc::new(JsonResultHandler))
        .build();

    let response = rqc.execute(RqcRequest::new(json!({"x": 1}))).await;

    assert!(response.is_error());
    assert!(response.error.as_deref().unwrap().contains("processing the result"));
    // The raw body survives for debugging even though the outcome flipped.
    assert!(response.raw_response.is_some());
}

#[tokio::test(start_paused = true)]
async fn transient_poll_failure_is_retried_within_the_poll_budget() {
    let transport = Arc::new(MockTransport::new());
    transport.push_post(200, json!("e1"));
    transport.push_get(503, json!({"error": "blip"}));
    transport.push_get(200, json!({"progress": {"status": "COMPLETED"}, "result": "{}"}));

    let rqc = client(transport.clone());
    let response = rqc.execute(RqcRequest::new(json!({"x": 1}))).await;

    assert!(response.is_completed(), "unexpected: {:?}", response.error);
    assert_eq!(transport.get_count(), 2);
}

struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RqcEventListener for RecordingListener {
    fn on_before_execute(&self, _request: &RqcRequest, context: &mut ListenerContext) {
        context.insert("started".into(), json!(true));
        self.events.lock().unwrap().push("before_execute".into());
    }

    fn on_status_change(
        &self,
        _request: &RqcRequest,
        old_status: &RqcExecutionStatus,
        new_status: &RqcExecutionStatus,
        _context: &mut ListenerContext,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(format!("status:{old_status}->{new_status}"));
    }

    fn on_after_execute(
        &self,
        _request: &RqcRequest,
        response: &RqcResponse,
        context: &mut ListenerContext,
    ) {
        // The context written in on_before_execute is visible here.
        assert_eq!(context.get("started"), Some(&json!(true)));
        self.events
            .lock()
            .unwrap()
            .push(format!("after_execute:{}", response.status));
    }

    fn on_create_execution_start(&self, _request: &RqcRequest, _context: &mut ListenerContext) {
        self.events.lock().unwrap().push("create_start".into());
    }

    fn on_create_execution_end(&self, request: &RqcRequest, _context: &mut ListenerContext) {
        self.events
            .lock()
            .unwrap()
            .push(format!("create_end:{}", request.execution_id().unwrap_or("none")));
    }

    fn on_get_result_start(&self, _request: &RqcRequest, _context: &mut ListenerContext) {
        self.events.lock().unwrap().push("get_result_start".into());
    }

    fn on_get_result_end(
        &self,
        _request: &RqcRequest,
        response: &RqcResponse,
        _context: &mut ListenerContext,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(format!("get_result_end:{}", response.status));
    }
}

#[tokio::test(start_paused = true)]
async fn listeners_see_the_full_lifecycle_in_order() {
    let transport = Arc::new(MockTransport::new());
    transport.push_post(200, json!("e1"));
    transport.push_get(200, json!({"progress": {"status": "RUNNING"}}));
    transport.push_get(200, json!({"progress": {"status": "COMPLETED"}, "result": "{}"}));

    let listener = Arc::new(RecordingListener { events: Mutex::new(Vec::new()) });
    let rqc = RemoteQuickCommand::builder("my-command")
        .base_url("https://rqc.test")
        .transport(transport)
        .create_execution_options(CreateExecutionOptions::default())
        .get_result_options(fast_poll_options())
        .listener(listener.clone())
        .build();

    let response = rqc.execute(RqcRequest::new(json!({"x": 1}))).await;
    assert!(response.is_completed());

    let events = listener.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "before_execute",
            "create_start",
            "create_end:e1",
            "status:PENDING->CREATED",
            "get_result_start",
            "status:CREATED->RUNNING",
            "status:RUNNING->COMPLETED",
            "get_result_end:COMPLETED",
            "after_execute:COMPLETED",
        ]
    );
}
