//! Multi-turn Agent chat inside a conversation scope.
//!
//! Run with: cargo run --example agent_conversation_demo

use stkai_sdk::{conversation, Agent, ChatRequest, Conversation};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let agent = Agent::new("demo-agent");

    conversation::scope(Conversation::new(), async {
        let first = agent.chat(ChatRequest::new("What is Rust's ownership model?")).await;
        println!("First reply: {}", first.message.as_deref().unwrap_or("<none>"));

        // The follow-up rides the conversation captured from the first
        // reply; no id threading needed.
        let second = agent.chat(ChatRequest::new("How does borrowing fit in?")).await;
        println!("Second reply: {}", second.message.as_deref().unwrap_or("<none>"));

        if let Some(active) = conversation::current() {
            println!("Conversation id: {:?}", active.id());
        }
    })
    .await;
}
