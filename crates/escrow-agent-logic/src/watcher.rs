//! Ledger watcher: per-escrow event subscription with backfill
//!
//! Subscriptions may be armed after the awaited transition already fired
//! (bot restart, watcher opened from a reconciled escrow id), so `watch`
//! can immediately read current on-chain state and synthesize one event for
//! it. Because the same transition can then arrive twice — once synthesized,
//! once live — every event is applied idempotently: the trade store's
//! `transition` reports `AlreadyAt` for re-deliveries and the applier skips
//! the presentation edit for them.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::chat::ChatPort;
use crate::fees;
use crate::ledger::{ChainEvent, LedgerClient, SubscriptionId};
use crate::store::{TradeStore, TransitionOutcome};
use crate::types::TradeStatus;

/// Status-change event emitted by the escrow manager contract
pub const STATUS_EVENT: &str = "EscrowStatusChanged";
/// Manager read returning an escrow's current lifecycle status
pub const STATUS_ACCESSOR: &str = "statusOf";

/// Where an event came from (for logging; application is source-agnostic)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Live,
    Backfill,
}

/// One state-changing escrow event, decoded
#[derive(Debug, Clone)]
pub struct EscrowEvent {
    pub escrow_id: String,
    pub status: TradeStatus,
    pub source: EventSource,
}

/// Whether a watch should keep running after an event was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFlow {
    Continue,
    /// The escrow reached a terminal status; no further events can follow
    Stop,
}

/// Consumer of watcher events; must be idempotent under re-delivery
#[async_trait]
pub trait EscrowEventSink: Send + Sync {
    async fn apply(&self, event: EscrowEvent) -> Result<SinkFlow>;
}

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Read current state on arm and synthesize one event if it is already
    /// past Created
    pub backfill_on_start: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            backfill_on_start: true,
        }
    }
}

/// Handle for one armed watch; dropping it does NOT stop the task —
/// call `unwatch` to tear down cleanly.
pub struct WatchHandle {
    escrow_id: String,
    subscription: SubscriptionId,
    ledger: Arc<dyn LedgerClient>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// True once the watch task ended on its own (terminal status reached,
    /// or the event channel closed)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn unwatch(self) {
        if let Err(e) = self.ledger.unsubscribe(self.subscription).await {
            warn!("[{}] Unsubscribe failed: {}", self.escrow_id, e);
        }
        self.task.abort();
        debug!("[{}] Watch stopped", self.escrow_id);
    }
}

/// Arms per-escrow subscriptions against the manager contract
pub struct LedgerWatcher {
    ledger: Arc<dyn LedgerClient>,
    manager: String,
}

impl LedgerWatcher {
    pub fn new(ledger: Arc<dyn LedgerClient>, manager: &str) -> Self {
        Self {
            ledger,
            manager: manager.to_string(),
        }
    }

    /// Subscribe to status changes for one escrow id.
    ///
    /// Subscription is armed before the backfill read, so a transition
    /// firing in between is seen on one path or the other (and deduplicated
    /// by the sink's idempotent application, never lost).
    pub async fn watch(
        &self,
        escrow_id: &str,
        sink: Arc<dyn EscrowEventSink>,
        options: WatchOptions,
    ) -> Result<WatchHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChainEvent>();
        let subscription = self
            .ledger
            .subscribe(&self.manager, STATUS_EVENT, Some(escrow_id), tx)
            .await
            .context("Failed to subscribe to escrow status events")?;

        let mut terminal = false;
        if options.backfill_on_start {
            match self.read_current_status(escrow_id).await {
                Ok(TradeStatus::Created) => {
                    debug!("[{}] Backfill: still at created, nothing to synthesize", escrow_id);
                }
                Ok(status) => {
                    info!("[{}] Backfill: on-chain already at {}", escrow_id, status);
                    match sink
                        .apply(EscrowEvent {
                            escrow_id: escrow_id.to_string(),
                            status,
                            source: EventSource::Backfill,
                        })
                        .await
                    {
                        Ok(SinkFlow::Continue) => {}
                        Ok(SinkFlow::Stop) => terminal = true,
                        Err(e) => error!("[{}] Backfill apply failed: {}", escrow_id, e),
                    }
                }
                Err(e) => {
                    // Not fatal — the live subscription is already armed
                    warn!("[{}] Backfill read failed: {}", escrow_id, e);
                }
            }
        }

        if terminal {
            // Nothing further can fire; release the subscription now
            if let Err(e) = self.ledger.unsubscribe(subscription).await {
                warn!("[{}] Unsubscribe failed: {}", escrow_id, e);
            }
        }

        let escrow = escrow_id.to_string();
        let ledger = self.ledger.clone();
        let task = tokio::spawn(async move {
            if terminal {
                return;
            }
            while let Some(event) = rx.recv().await {
                let status = match decode_status_event(&event) {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("[{}] Undecodable status event: {}", escrow, e);
                        continue;
                    }
                };
                // Apply errors are logged, not retried — the caller can
                // re-arm with backfill to recover a missed application
                match sink
                    .apply(EscrowEvent {
                        escrow_id: escrow.clone(),
                        status,
                        source: EventSource::Live,
                    })
                    .await
                {
                    Ok(SinkFlow::Continue) => {}
                    Ok(SinkFlow::Stop) => {
                        if let Err(e) = ledger.unsubscribe(subscription).await {
                            warn!("[{}] Unsubscribe failed: {}", escrow, e);
                        }
                        info!("[{}] Watch closed at terminal status {}", escrow, status);
                        return;
                    }
                    Err(e) => error!("[{}] Event apply failed for {}: {}", escrow, status, e),
                }
            }
            debug!("[{}] Event channel closed", escrow);
        });

        Ok(WatchHandle {
            escrow_id: escrow_id.to_string(),
            subscription,
            ledger: self.ledger.clone(),
            task,
        })
    }

    async fn read_current_status(&self, escrow_id: &str) -> Result<TradeStatus> {
        let value = self
            .ledger
            .read(
                &self.manager,
                STATUS_ACCESSOR,
                &[serde_json::Value::String(escrow_id.to_string())],
            )
            .await?;
        let label = value
            .as_str()
            .ok_or_else(|| anyhow!("Non-string status for {}: {}", escrow_id, value))?;
        TradeStatus::parse(label).ok_or_else(|| anyhow!("Unknown status label '{}'", label))
    }
}

fn decode_status_event(event: &ChainEvent) -> Result<TradeStatus> {
    let label = event
        .args
        .get("status")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("Event missing 'status' argument: {}", event.args))?;
    TradeStatus::parse(label).ok_or_else(|| anyhow!("Unknown status label '{}'", label))
}

/// Standard sink: one DB transition plus one status-message edit per
/// distinct state. Re-deliveries hit `AlreadyAt` and edit nothing.
pub struct TradeEventApplier {
    pub trades: Arc<dyn TradeStore>,
    pub chat: Arc<dyn ChatPort>,
}

#[async_trait]
impl EscrowEventSink for TradeEventApplier {
    async fn apply(&self, event: EscrowEvent) -> Result<SinkFlow> {
        let outcome = self
            .trades
            .transition(&event.escrow_id, event.status)
            .await
            .with_context(|| format!("Status transition for {}", event.escrow_id))?;

        match outcome {
            TransitionOutcome::Applied => {
                info!(
                    "[{}] {} ({:?})",
                    event.escrow_id, event.status, event.source
                );
                let record = self
                    .trades
                    .get(&event.escrow_id)
                    .await?
                    .ok_or_else(|| anyhow!("Trade {} vanished after transition", event.escrow_id))?;
                if let Some(msg) = &record.status_message {
                    let text = format!(
                        "Escrow {} — {} | buyer pays {} | seller receives {}",
                        record.escrow_id,
                        record.status,
                        fees::format_base_units(fees::buyer_total(record.base_amount, record.fee_bps)),
                        fees::format_base_units(fees::seller_payout(record.base_amount, record.fee_bps)),
                    );
                    self.chat.edit(msg, &text).await.context("Status message edit")?;
                }
            }
            TransitionOutcome::AlreadyAt => {
                debug!(
                    "[{}] Re-delivery of {} ({:?}) — already applied",
                    event.escrow_id, event.status, event.source
                );
            }
            TransitionOutcome::Rejected { from } => {
                warn!(
                    "[{}] Ignoring illegal transition {} -> {} ({:?})",
                    event.escrow_id, from, event.status, event.source
                );
            }
        }
        Ok(if event.status.is_terminal() {
            SinkFlow::Stop
        } else {
            SinkFlow::Continue
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessageRef;
    use crate::store::MemoryStore;
    use crate::testing::{MockChat, MockLedger};
    use crate::types::TradeRecord;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    const MANAGER: &str = "0x00000000000000000000000000000000000000ff";
    const ESCROW: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    async fn setup() -> (Arc<MockLedger>, Arc<MemoryStore>, Arc<MockChat>, MessageRef) {
        let ledger = Arc::new(MockLedger::new());
        let store = Arc::new(MemoryStore::new());
        let chat = Arc::new(MockChat::new());
        let msg = chat.send("sess-1", "Escrow created").await.unwrap();
        let now = Utc::now();
        store
            .upsert(&TradeRecord {
                escrow_id: ESCROW.into(),
                buyer_id: "alice".into(),
                seller_id: "bob".into(),
                buyer_address: "0x1111111111111111111111111111111111111111".into(),
                seller_address: "0x2222222222222222222222222222222222222222".into(),
                base_amount: 1_000_000,
                fee_bps: 250,
                status: TradeStatus::Created,
                delivered_at: None,
                accrued_fees: 50_000,
                session_id: Some("sess-1".into()),
                status_message: Some(msg.clone()),
                created_by: "alice".into(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        (ledger, store, chat, msg)
    }

    fn watcher(ledger: &Arc<MockLedger>) -> LedgerWatcher {
        LedgerWatcher::new(ledger.clone() as Arc<dyn LedgerClient>, MANAGER)
    }

    fn applier(store: &Arc<MemoryStore>, chat: &Arc<MockChat>) -> Arc<TradeEventApplier> {
        Arc::new(TradeEventApplier {
            trades: store.clone(),
            chat: chat.clone(),
        })
    }

    #[tokio::test]
    async fn test_live_event_applies_once() {
        let (ledger, store, chat, msg) = setup().await;
        ledger.set_read(MANAGER, STATUS_ACCESSOR, &[json!(ESCROW)], json!("created"));

        let handle = watcher(&ledger)
            .watch(ESCROW, applier(&store, &chat), WatchOptions::default())
            .await
            .unwrap();

        ledger.emit(MANAGER, STATUS_EVENT, ESCROW, json!({ "status": "funded" }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = TradeStore::get(&*store, ESCROW).await.unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Funded);
        assert_eq!(chat.edit_count_for(&msg), 1);
        handle.unwatch().await;
        assert_eq!(ledger.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_backfill_synthesizes_missed_transition() {
        let (ledger, store, chat, msg) = setup().await;
        // Funding confirmed before the watcher was armed
        ledger.set_read(MANAGER, STATUS_ACCESSOR, &[json!(ESCROW)], json!("funded"));

        let handle = watcher(&ledger)
            .watch(ESCROW, applier(&store, &chat), WatchOptions::default())
            .await
            .unwrap();

        let record = TradeStore::get(&*store, ESCROW).await.unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Funded);
        assert_eq!(chat.edit_count_for(&msg), 1);
        handle.unwatch().await;
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let (ledger, store, chat, msg) = setup().await;
        ledger.set_read(MANAGER, STATUS_ACCESSOR, &[json!(ESCROW)], json!("funded"));

        // Backfill applies funded once...
        let handle = watcher(&ledger)
            .watch(ESCROW, applier(&store, &chat), WatchOptions::default())
            .await
            .unwrap();
        // ...then the same event arrives live
        ledger.emit(MANAGER, STATUS_EVENT, ESCROW, json!({ "status": "funded" }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Exactly one status edit and one DB transition, not two
        let record = TradeStore::get(&*store, ESCROW).await.unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Funded);
        assert_eq!(chat.edit_count_for(&msg), 1);
        handle.unwatch().await;
    }

    #[tokio::test]
    async fn test_no_backfill_when_still_created() {
        let (ledger, store, chat, msg) = setup().await;
        ledger.set_read(MANAGER, STATUS_ACCESSOR, &[json!(ESCROW)], json!("created"));

        let handle = watcher(&ledger)
            .watch(
                ESCROW,
                applier(&store, &chat),
                WatchOptions {
                    backfill_on_start: true,
                },
            )
            .await
            .unwrap();

        let record = TradeStore::get(&*store, ESCROW).await.unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Created);
        assert_eq!(chat.edit_count_for(&msg), 0);
        handle.unwatch().await;
    }

    #[tokio::test]
    async fn test_watch_tears_down_at_terminal_status() {
        let (ledger, store, chat, msg) = setup().await;
        ledger.set_read(MANAGER, STATUS_ACCESSOR, &[json!(ESCROW)], json!("created"));

        let handle = watcher(&ledger)
            .watch(ESCROW, applier(&store, &chat), WatchOptions::default())
            .await
            .unwrap();
        assert_eq!(ledger.subscription_count(), 1);

        ledger.emit(MANAGER, STATUS_EVENT, ESCROW, json!({ "status": "completed" }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = TradeStore::get(&*store, ESCROW).await.unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Completed);
        assert_eq!(chat.edit_count_for(&msg), 1);
        // The task released its own subscription and ended
        assert_eq!(ledger.subscription_count(), 0);
        assert!(handle.is_finished());
        handle.unwatch().await;
    }

    #[tokio::test]
    async fn test_backfill_of_terminal_status_holds_no_subscription() {
        let (ledger, store, chat, _msg) = setup().await;
        ledger.set_read(MANAGER, STATUS_ACCESSOR, &[json!(ESCROW)], json!("cancelled"));

        let handle = watcher(&ledger)
            .watch(ESCROW, applier(&store, &chat), WatchOptions::default())
            .await
            .unwrap();

        let record = TradeStore::get(&*store, ESCROW).await.unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Cancelled);
        assert_eq!(ledger.subscription_count(), 0);
        handle.unwatch().await;
    }

    #[tokio::test]
    async fn test_events_scoped_to_watched_escrow() {
        let (ledger, store, chat, msg) = setup().await;
        ledger.set_read(MANAGER, STATUS_ACCESSOR, &[json!(ESCROW)], json!("created"));

        let handle = watcher(&ledger)
            .watch(ESCROW, applier(&store, &chat), WatchOptions::default())
            .await
            .unwrap();

        // Another escrow's event must not leak into this watch
        ledger.emit(
            MANAGER,
            STATUS_EVENT,
            "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            json!({ "status": "funded" }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = TradeStore::get(&*store, ESCROW).await.unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Created);
        assert_eq!(chat.edit_count_for(&msg), 0);
        handle.unwatch().await;
    }
}
