//! Console chat adapter
//!
//! Renders chat traffic to stdout and keeps enough state in memory to honor
//! message edits and session reachability checks. Automated-account lookups
//! come from a fixed deny list supplied at startup.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use escrow_agent_logic::chat::{ChatPort, MessageRef};

#[derive(Default)]
struct ConsoleState {
    messages: HashMap<String, String>,
    sessions: HashSet<String>,
    next_message: u64,
    next_session: u64,
}

pub struct ConsoleChat {
    automated: HashSet<String>,
    state: Mutex<ConsoleState>,
}

impl ConsoleChat {
    pub fn new(automated_users: &[&str]) -> Self {
        Self {
            automated: automated_users.iter().map(|s| s.to_string()).collect(),
            state: Mutex::new(ConsoleState::default()),
        }
    }
}

#[async_trait]
impl ChatPort for ConsoleChat {
    async fn send(&self, channel_id: &str, text: &str) -> Result<MessageRef> {
        let mut state = self.state.lock().unwrap();
        state.next_message += 1;
        let msg = MessageRef {
            channel_id: channel_id.to_string(),
            message_id: format!("msg-{}", state.next_message),
        };
        state
            .messages
            .insert(msg.message_id.clone(), text.to_string());
        println!("[{}] {}", channel_id, text);
        Ok(msg)
    }

    async fn edit(&self, msg: &MessageRef, text: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .messages
            .insert(msg.message_id.clone(), text.to_string());
        println!("[{}] (edit {}) {}", msg.channel_id, msg.message_id, text);
        Ok(())
    }

    async fn fetch(&self, msg: &MessageRef) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .messages
            .get(&msg.message_id)
            .cloned())
    }

    async fn open_session(&self, participants: &[&str]) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        let id = format!("session-{}", state.next_session);
        state.sessions.insert(id.clone());
        println!("[{}] Session opened for {}", id, participants.join(", "));
        Ok(id)
    }

    async fn session_reachable(&self, session_id: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().sessions.contains(session_id))
    }

    async fn is_automated_user(&self, user_id: &str) -> Result<bool> {
        Ok(self.automated.contains(user_id))
    }
}
