//! Abstract ledger client
//!
//! The core is agnostic to the concrete chain: everything goes through this
//! trait (read / write / wait-for-confirmation / subscribe). A production
//! deployment plugs in an RPC-backed implementation; tests and local runs
//! use an in-process simulator.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Handle for a submitted, not-yet-confirmed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxHandle {
    pub tx_id: String,
    /// Client-chosen idempotency key, echoed by the ledger
    pub command_id: String,
}

/// One decoded (or partially decoded) event log from a receipt.
///
/// `event`/`args` are present when the client's ABI matched the emitted
/// event; `indexed` always carries the raw indexed fields so callers can
/// still recover ids from logs the ABI no longer matches.
#[derive(Debug, Clone, Default)]
pub struct LedgerLog {
    pub event: Option<String>,
    pub args: Value,
    pub indexed: Vec<String>,
}

/// Confirmed transaction outcome
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub tx_id: String,
    pub success: bool,
    pub logs: Vec<LedgerLog>,
    pub error: Option<String>,
}

/// A state-changing event observed via subscription
#[derive(Debug, Clone)]
pub struct ChainEvent {
    pub event: String,
    pub resource_id: String,
    pub args: Value,
}

/// Opaque subscription identifier for unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Read-only contract call
    async fn read(&self, contract: &str, method: &str, args: &[Value]) -> Result<Value>;

    /// Submit a state-changing transaction; returns once broadcast
    async fn write(&self, contract: &str, method: &str, args: &[Value]) -> Result<TxHandle>;

    /// Wait for a broadcast transaction to confirm.
    ///
    /// Bounded only by the ledger call itself — the caller decides whether
    /// to hold locks for the duration.
    async fn wait_for_confirmation(&self, handle: &TxHandle) -> Result<TxReceipt>;

    /// Subscribe to `event` on `contract`, optionally filtered to one
    /// resource id. Events are delivered through `sink`.
    async fn subscribe(
        &self,
        contract: &str,
        event: &str,
        resource_filter: Option<&str>,
        sink: mpsc::UnboundedSender<ChainEvent>,
    ) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    /// Whether the address carries on-chain code (contract account)
    async fn has_code(&self, address: &str) -> Result<bool>;
}

/// Settlement addresses are 0x-prefixed 20-byte hex
pub fn is_valid_address(s: &str) -> bool {
    let Some(hex) = s.strip_prefix("0x") else {
        return false;
    };
    hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

/// Resource ids share the address shape on this ledger
pub fn is_id_shaped(s: &str) -> bool {
    is_valid_address(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address(
            "0x00112233445566778899aabbccddeeff00112233"
        ));
        assert!(!is_valid_address("00112233445566778899aabbccddeeff00112233"));
        assert!(!is_valid_address("0x0011"));
        assert!(!is_valid_address(
            "0x00112233445566778899aabbccddeeff0011223g"
        ));
    }
}
