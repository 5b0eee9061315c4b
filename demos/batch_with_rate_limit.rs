//! Batch execution behind the adaptive rate limiter.
//!
//! Run with: cargo run --example batch_with_rate_limit

use serde_json::json;
use stkai_sdk::config::{Overrides, RateLimitOverrides};
use stkai_sdk::{RateLimitPreset, RateLimitStrategy, RemoteQuickCommand, RqcRequest};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    stkai_sdk::config::configure(
        Overrides {
            rate_limit: Some(RateLimitOverrides {
                enabled: Some(true),
                strategy: Some(RateLimitStrategy::Adaptive),
                preset: Some(RateLimitPreset::Balanced),
                max_requests: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        },
        true,
    )
    .expect("valid configuration");

    let rqc = RemoteQuickCommand::builder("demo-quick-command")
        .max_workers(4)
        .build();

    let requests: Vec<RqcRequest> = (0..10)
        .map(|n| RqcRequest::new(json!({"prompt": format!("Task #{n}")})))
        .collect();

    let responses = rqc.execute_many(requests).await;

    for response in &responses {
        println!(
            "{} -> {} ({})",
            response.request.id,
            response.status,
            response.error.as_deref().unwrap_or("ok")
        );
    }
}
