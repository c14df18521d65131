//! Shared test doubles for the ledger and chat ports

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::chat::{ChatPort, MessageRef};
use crate::ledger::{ChainEvent, LedgerClient, LedgerLog, SubscriptionId, TxHandle, TxReceipt};

/// One recorded state-changing call
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub contract: String,
    pub method: String,
    pub args: Vec<Value>,
    pub tx_id: String,
}

struct Subscription {
    contract: String,
    event: String,
    resource_filter: Option<String>,
    sink: mpsc::UnboundedSender<ChainEvent>,
}

#[derive(Default)]
struct MockLedgerState {
    reads: HashMap<(String, String, String), Value>,
    writes: Vec<RecordedWrite>,
    receipts: HashMap<String, TxReceipt>,
    has_code: HashSet<String>,
    subscriptions: HashMap<u64, Subscription>,
    next_tx: u64,
    next_sub: u64,
    fail_confirmations: u32,
    fail_writes: u32,
}

/// Programmable in-memory ledger double
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<MockLedgerState>,
}

fn read_key(contract: &str, method: &str, args: &[Value]) -> (String, String, String) {
    (
        contract.to_string(),
        method.to_string(),
        serde_json::to_string(args).unwrap_or_default(),
    )
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read(&self, contract: &str, method: &str, args: &[Value], value: Value) {
        self.state
            .lock()
            .unwrap()
            .reads
            .insert(read_key(contract, method, args), value);
    }

    pub fn set_has_code(&self, address: &str) {
        self.state.lock().unwrap().has_code.insert(address.to_string());
    }

    /// Queue a receipt for the next submitted write (FIFO per tx id)
    pub fn set_receipt_logs(&self, tx_id: &str, logs: Vec<LedgerLog>) {
        let receipt = TxReceipt {
            tx_id: tx_id.to_string(),
            success: true,
            logs,
            error: None,
        };
        self.state
            .lock()
            .unwrap()
            .receipts
            .insert(tx_id.to_string(), receipt);
    }

    /// Fail the next `n` wait_for_confirmation calls with a transport error
    pub fn fail_confirmations(&self, n: u32) {
        self.state.lock().unwrap().fail_confirmations = n;
    }

    /// Fail the next `n` write calls with a transport error
    pub fn fail_writes(&self, n: u32) {
        self.state.lock().unwrap().fail_writes = n;
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn write_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|w| w.method == method)
            .count()
    }

    /// The tx id the next write will be assigned
    pub fn next_tx_id(&self) -> String {
        format!("tx-{}", self.state.lock().unwrap().next_tx + 1)
    }

    /// Deliver an event to all matching live subscriptions
    pub fn emit(&self, contract: &str, event: &str, resource_id: &str, args: Value) {
        let state = self.state.lock().unwrap();
        for sub in state.subscriptions.values() {
            if sub.contract != contract || sub.event != event {
                continue;
            }
            if let Some(filter) = &sub.resource_filter {
                if filter != resource_id {
                    continue;
                }
            }
            let _ = sub.sink.send(ChainEvent {
                event: event.to_string(),
                resource_id: resource_id.to_string(),
                args: args.clone(),
            });
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn read(&self, contract: &str, method: &str, args: &[Value]) -> Result<Value> {
        let state = self.state.lock().unwrap();
        Ok(state
            .reads
            .get(&read_key(contract, method, args))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn write(&self, contract: &str, method: &str, args: &[Value]) -> Result<TxHandle> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(anyhow!("ledger unavailable"));
        }
        state.next_tx += 1;
        let tx_id = format!("tx-{}", state.next_tx);
        state.writes.push(RecordedWrite {
            contract: contract.to_string(),
            method: method.to_string(),
            args: args.to_vec(),
            tx_id: tx_id.clone(),
        });
        Ok(TxHandle {
            command_id: format!("cmd-{}", tx_id),
            tx_id,
        })
    }

    async fn wait_for_confirmation(&self, handle: &TxHandle) -> Result<TxReceipt> {
        let mut state = self.state.lock().unwrap();
        if state.fail_confirmations > 0 {
            state.fail_confirmations -= 1;
            return Err(anyhow!("confirmation stream dropped"));
        }
        Ok(state
            .receipts
            .get(&handle.tx_id)
            .cloned()
            .unwrap_or(TxReceipt {
                tx_id: handle.tx_id.clone(),
                success: true,
                logs: Vec::new(),
                error: None,
            }))
    }

    async fn subscribe(
        &self,
        contract: &str,
        event: &str,
        resource_filter: Option<&str>,
        sink: mpsc::UnboundedSender<ChainEvent>,
    ) -> Result<SubscriptionId> {
        let mut state = self.state.lock().unwrap();
        state.next_sub += 1;
        let id = state.next_sub;
        state.subscriptions.insert(
            id,
            Subscription {
                contract: contract.to_string(),
                event: event.to_string(),
                resource_filter: resource_filter.map(|s| s.to_string()),
                sink,
            },
        );
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.state.lock().unwrap().subscriptions.remove(&id.0);
        Ok(())
    }

    async fn has_code(&self, address: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().has_code.contains(address))
    }
}

#[derive(Default)]
struct MockChatState {
    messages: HashMap<String, String>,
    sends: Vec<(MessageRef, String)>,
    edits: Vec<(MessageRef, String)>,
    sessions: HashSet<String>,
    unreachable_sessions: HashSet<String>,
    automated: HashSet<String>,
    next_message: u64,
    next_session: u64,
    fail_sends: u32,
}

/// Recording in-memory chat double
#[derive(Default)]
pub struct MockChat {
    state: Mutex<MockChatState>,
}

impl MockChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_automated(&self, user_id: &str) {
        self.state.lock().unwrap().automated.insert(user_id.to_string());
    }

    pub fn mark_session_unreachable(&self, session_id: &str) {
        self.state
            .lock()
            .unwrap()
            .unreachable_sessions
            .insert(session_id.to_string());
    }

    /// Fail the next `n` send calls with a transport error
    pub fn fail_sends(&self, n: u32) {
        self.state.lock().unwrap().fail_sends = n;
    }

    pub fn sends(&self) -> Vec<(MessageRef, String)> {
        self.state.lock().unwrap().sends.clone()
    }

    pub fn edits(&self) -> Vec<(MessageRef, String)> {
        self.state.lock().unwrap().edits.clone()
    }

    pub fn edit_count_for(&self, msg: &MessageRef) -> usize {
        self.state
            .lock()
            .unwrap()
            .edits
            .iter()
            .filter(|(m, _)| m == msg)
            .count()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }
}

#[async_trait]
impl ChatPort for MockChat {
    async fn send(&self, channel_id: &str, text: &str) -> Result<MessageRef> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(anyhow!("chat unavailable"));
        }
        state.next_message += 1;
        let msg = MessageRef {
            channel_id: channel_id.to_string(),
            message_id: format!("msg-{}", state.next_message),
        };
        state
            .messages
            .insert(msg.message_id.clone(), text.to_string());
        state.sends.push((msg.clone(), text.to_string()));
        Ok(msg)
    }

    async fn edit(&self, msg: &MessageRef, text: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .messages
            .insert(msg.message_id.clone(), text.to_string());
        state.edits.push((msg.clone(), text.to_string()));
        Ok(())
    }

    async fn fetch(&self, msg: &MessageRef) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().messages.get(&msg.message_id).cloned())
    }

    async fn open_session(&self, _participants: &[&str]) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        let id = format!("sess-{}", state.next_session);
        state.sessions.insert(id.clone());
        Ok(id)
    }

    async fn session_reachable(&self, session_id: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.sessions.contains(session_id)
            && !state.unreachable_sessions.contains(session_id))
    }

    async fn is_automated_user(&self, user_id: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().automated.contains(user_id))
    }
}
