//! Conversation scoping for Agent chats.
//!
//! A [`Conversation`] tracks the platform-assigned `conversation_id` so
//! consecutive chats share context without threading the id by hand:
//!
//! ```rust,no_run
//! use stkai_sdk::{conversation, Agent, ChatRequest, Conversation};
//!
//! # async fn demo(agent: Agent) {
//! conversation::scope(Conversation::new(), async {
//!     let first = agent.chat(ChatRequest::new("Hello")).await;
//!     // The id captured from `first` rides along automatically.
//!     let second = agent.chat(ChatRequest::new("Follow up")).await;
//!     # let _ = (first, second);
//! })
//! .await;
//! # }
//! ```
//!
//! Scopes are task-local regions: they nest (innermost wins) and detach
//! on exit. For concurrent `chat_many` batches, pre-seed the id with
//! [`Conversation::with_generated_id`] so workers do not race to capture
//! the server-assigned one.

use std::future::Future;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Shared conversation state for a scoped region.
///
/// Cloning is shallow: clones observe and update the same id, which is
/// what lets a response captured on one worker enrich the next request on
/// another.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    id: Arc<Mutex<Option<String>>>,
}

impl Conversation {
    /// Empty conversation; the id is captured from the first successful
    /// chat inside the scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversation pre-seeded with a caller-provided id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Arc::new(Mutex::new(Some(id.into()))),
        }
    }

    /// Conversation pre-seeded with a freshly generated id.
    ///
    /// Useful with `chat_many`, where concurrent requests would otherwise
    /// race to capture the first server-assigned id.
    pub fn with_generated_id() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// The current conversation id, if one is set or was captured.
    pub fn id(&self) -> Option<String> {
        self.id.lock().expect("conversation lock poisoned").clone()
    }

    /// Whether an id is already present.
    pub fn has_id(&self) -> bool {
        self.id.lock().expect("conversation lock poisoned").is_some()
    }

    /// Capture `id` unless one is already set; returns the winning id.
    pub(crate) fn set_if_absent(&self, id: &str) -> String {
        let mut current = self.id.lock().expect("conversation lock poisoned");
        match current.as_ref() {
            Some(existing) => existing.clone(),
            None => {
                *current = Some(id.to_string());
                id.to_string()
            }
        }
    }
}

tokio::task_local! {
    static CURRENT_CONVERSATION: Conversation;
}

/// Run `future` with `conversation` installed as the active scope.
///
/// Agent chats inside the region are enriched with the conversation id
/// (explicit request ids win) and the first successful response's id is
/// captured. Scopes nest (the innermost one wins) and the previous
/// scope is restored when the future completes.
pub async fn scope<F: Future>(conversation: Conversation, future: F) -> F::Output {
    CURRENT_CONVERSATION.scope(conversation, future).await
}

/// The active conversation, when inside a [`scope`] region.
pub fn current() -> Option<Conversation> {
    CURRENT_CONVERSATION.try_with(Conversation::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_scope_means_no_conversation() {
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn test_scope_installs_and_detaches() {
        let conversation = Conversation::with_id("c1");
        scope(conversation, async {
            let active = current().expect("scope must be active");
            assert_eq!(active.id().as_deref(), Some("c1"));
        })
        .await;
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn test_nested_scopes_innermost_wins() {
        scope(Conversation::with_id("outer"), async {
            scope(Conversation::with_id("inner"), async {
                assert_eq!(current().unwrap().id().as_deref(), Some("inner"));
            })
            .await;
            // Outer scope is restored after the inner region exits.
            assert_eq!(current().unwrap().id().as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_capture_is_first_write_wins() {
        let conversation = Conversation::new();
        assert!(!conversation.has_id());

        let clone = conversation.clone();
        assert_eq!(clone.set_if_absent("c1"), "c1");
        // Later captures lose, including through other clones.
        assert_eq!(conversation.set_if_absent("c2"), "c1");
        assert_eq!(conversation.id().as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_generated_id_is_available_up_front() {
        let conversation = Conversation::with_generated_id();
        assert!(conversation.has_id());
    }
}
