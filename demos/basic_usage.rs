//! Minimal Remote Quick Command round trip.
//!
//! Credentials come from the environment:
//!   STKAI_AUTH_CLIENT_ID / STKAI_AUTH_CLIENT_SECRET
//!
//! Run with: cargo run --example basic_usage

use serde_json::json;
use stkai_sdk::{RemoteQuickCommand, RqcRequest};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stkai_sdk=info".into()),
        )
        .init();

    let rqc = RemoteQuickCommand::new("demo-quick-command");
    let request = RqcRequest::new(json!({
        "prompt": "Summarize the SOLID principles in one sentence each."
    }));

    println!("Executing quick command '{}'...", rqc.slug_name());
    let response = rqc.execute(request).await;

    println!("Status: {}", response.status);
    if response.is_completed() {
        println!("Result: {:#?}", response.result);
    } else {
        println!("Error: {}", response.error.as_deref().unwrap_or("unknown"));
    }

    // Show where every effective setting came from.
    println!("\nEffective configuration:");
    for row in stkai_sdk::config::explain() {
        println!("  {}.{} = {} ({})", row.group, row.option, row.value, row.source);
    }
}
