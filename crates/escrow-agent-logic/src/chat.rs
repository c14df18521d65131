//! Chat-platform port
//!
//! The orchestrator never touches the chat transport directly — it goes
//! through this narrow send/edit/fetch surface so the same core drives a
//! console adapter, a Discord adapter, or a test double.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Reference to a message the bot sent (for later edits and reachability checks)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel_id: String,
    pub message_id: String,
}

#[async_trait]
pub trait ChatPort: Send + Sync {
    /// Send a message into a channel, returning a reference for later edits
    async fn send(&self, channel_id: &str, text: &str) -> Result<MessageRef>;

    /// Edit a previously sent message in place
    async fn edit(&self, msg: &MessageRef, text: &str) -> Result<()>;

    /// Fetch a message's current text; None when deleted or unreachable
    async fn fetch(&self, msg: &MessageRef) -> Result<Option<String>>;

    /// Open (or create) a private session channel for the given participants
    async fn open_session(&self, participants: &[&str]) -> Result<String>;

    /// Whether an existing session channel is still reachable
    async fn session_reachable(&self, session_id: &str) -> Result<bool>;

    /// Whether the given user id belongs to an automated account (another
    /// bot) — such counterparties are rejected during negotiation
    async fn is_automated_user(&self, user_id: &str) -> Result<bool>;
}
