//! Persisted negotiation + trade record stores
//!
//! `NegotiationStore` holds one row per participant (the twin pair lives as
//! two rows); `TradeStore` holds one row per created escrow. Both are
//! strongly consistent per key against the backing store. Atomicity across
//! a twin pair's two rows is not provided — each party writes only its own
//! per-party fields, and shared fields are write-once, so per-row atomicity
//! is sufficient.
//!
//! Merge semantics: create-if-absent, then shallow-merge of the patch's
//! `Some` fields. Shared fields (terms, escrow id, locked identities) are
//! write-once — merging a *different* value over an existing one is rejected
//! as a divergent write rather than silently last-write-wins; rewriting the
//! same value is idempotent. Agreement flags move false→true only, except
//! through the explicit fresh-session reset.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::info;

use crate::chat::MessageRef;
use crate::types::{NegotiationPatch, NegotiationRecord, Role, TradeRecord, TradeStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Both parties wrote different values to a write-once shared field
    #[error("divergent write to shared field '{field}': '{existing}' vs '{incoming}'")]
    DivergentSharedField {
        field: &'static str,
        existing: String,
        incoming: String,
    },
    /// Agreement flags only move false→true outside a fresh-session reset
    #[error("agreement flag '{field}' cannot move true→false without a session reset")]
    AgreementRegression { field: &'static str },
    /// Backing store unavailable or corrupt — transient, retryable
    #[error("store backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of an idempotent trade status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Status advanced and the row was updated
    Applied,
    /// Row already at the target status — re-delivery, nothing written
    AlreadyAt,
    /// Transition not legal from the current status
    Rejected { from: TradeStatus },
}

#[async_trait]
pub trait NegotiationStore: Send + Sync {
    async fn get(&self, user_id: &str) -> StoreResult<Option<NegotiationRecord>>;

    /// Create a fresh record for `user_id`, replacing any existing one
    async fn start(&self, user_id: &str) -> StoreResult<NegotiationRecord>;

    /// Create-if-absent, then shallow-merge the patch's defined fields
    async fn merge(&self, user_id: &str, patch: NegotiationPatch) -> StoreResult<NegotiationRecord>;

    async fn clear(&self, user_id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn upsert(&self, record: &TradeRecord) -> StoreResult<()>;

    async fn get(&self, escrow_id: &str) -> StoreResult<Option<TradeRecord>>;

    /// Idempotently advance the trade status. Sets `delivered_at` when the
    /// target is Delivered. Missing rows are a backend error.
    async fn transition(&self, escrow_id: &str, to: TradeStatus) -> StoreResult<TransitionOutcome>;
}

// ============================================================================
// Patch application (shared by both backends)
// ============================================================================

fn check_shared(
    field: &'static str,
    existing: &Option<String>,
    incoming: &Option<String>,
) -> StoreResult<()> {
    if let (Some(old), Some(new)) = (existing, incoming) {
        if old != new {
            return Err(StoreError::DivergentSharedField {
                field,
                existing: old.clone(),
                incoming: new.clone(),
            });
        }
    }
    Ok(())
}

/// Apply a patch to a record in memory, enforcing write-once shared fields
/// and the false→true agreement rule.
pub fn apply_patch(
    mut record: NegotiationRecord,
    patch: NegotiationPatch,
) -> StoreResult<NegotiationRecord> {
    check_shared("description", &record.description, &patch.description)?;
    check_shared("escrow_id", &record.escrow_id, &patch.escrow_id)?;
    check_shared("buyer_id", &record.buyer_id, &patch.buyer_id)?;
    check_shared("seller_id", &record.seller_id, &patch.seller_id)?;
    if let (Some(old), Some(new)) = (record.price, patch.price) {
        if old != new {
            return Err(StoreError::DivergentSharedField {
                field: "price",
                existing: old.to_string(),
                incoming: new.to_string(),
            });
        }
    }

    if patch.reset_agreements {
        record.buyer_agreed = false;
        record.seller_agreed = false;
    } else {
        if record.buyer_agreed && patch.buyer_agreed == Some(false) {
            return Err(StoreError::AgreementRegression {
                field: "buyer_agreed",
            });
        }
        if record.seller_agreed && patch.seller_agreed == Some(false) {
            return Err(StoreError::AgreementRegression {
                field: "seller_agreed",
            });
        }
    }

    if let Some(v) = patch.role {
        record.role = Some(v);
    }
    if let Some(v) = patch.counterparty_id {
        record.counterparty_id = Some(v);
    }
    if let Some(v) = patch.description {
        record.description = Some(v);
    }
    if let Some(v) = patch.price {
        record.price = Some(v);
    }
    if let Some(v) = patch.buyer_agreed {
        record.buyer_agreed = v;
    }
    if let Some(v) = patch.seller_agreed {
        record.seller_agreed = v;
    }
    if let Some(v) = patch.buyer_address {
        record.buyer_address = Some(v);
    }
    if let Some(v) = patch.seller_address {
        record.seller_address = Some(v);
    }
    if let Some(v) = patch.buyer_id {
        record.buyer_id = Some(v);
    }
    if let Some(v) = patch.seller_id {
        record.seller_id = Some(v);
    }
    if let Some(v) = patch.session_id {
        record.session_id = Some(v);
    }
    if let Some(v) = patch.status_message {
        record.status_message = Some(v);
    }
    if let Some(v) = patch.escrow_id {
        record.escrow_id = Some(v);
    }
    if let Some(v) = patch.watcher_started {
        record.watcher_started = v;
    }
    record.updated_at = Utc::now();
    Ok(record)
}

// ============================================================================
// In-memory backend (tests, demos)
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    negotiations: Mutex<HashMap<String, NegotiationRecord>>,
    trades: Mutex<HashMap<String, TradeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NegotiationStore for MemoryStore {
    async fn get(&self, user_id: &str) -> StoreResult<Option<NegotiationRecord>> {
        Ok(self.negotiations.lock().unwrap().get(user_id).cloned())
    }

    async fn start(&self, user_id: &str) -> StoreResult<NegotiationRecord> {
        let record = NegotiationRecord::new(user_id);
        self.negotiations
            .lock()
            .unwrap()
            .insert(user_id.to_string(), record.clone());
        Ok(record)
    }

    async fn merge(&self, user_id: &str, patch: NegotiationPatch) -> StoreResult<NegotiationRecord> {
        let mut map = self.negotiations.lock().unwrap();
        let current = map
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| NegotiationRecord::new(user_id));
        let merged = apply_patch(current, patch)?;
        map.insert(user_id.to_string(), merged.clone());
        Ok(merged)
    }

    async fn clear(&self, user_id: &str) -> StoreResult<()> {
        self.negotiations.lock().unwrap().remove(user_id);
        Ok(())
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn upsert(&self, record: &TradeRecord) -> StoreResult<()> {
        self.trades
            .lock()
            .unwrap()
            .insert(record.escrow_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, escrow_id: &str) -> StoreResult<Option<TradeRecord>> {
        Ok(self.trades.lock().unwrap().get(escrow_id).cloned())
    }

    async fn transition(&self, escrow_id: &str, to: TradeStatus) -> StoreResult<TransitionOutcome> {
        let mut map = self.trades.lock().unwrap();
        let record = map
            .get_mut(escrow_id)
            .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("unknown escrow {}", escrow_id)))?;
        if record.status == to {
            return Ok(TransitionOutcome::AlreadyAt);
        }
        if !record.status.can_transition_to(to) {
            return Ok(TransitionOutcome::Rejected {
                from: record.status,
            });
        }
        record.status = to;
        if to == TradeStatus::Delivered {
            record.delivered_at = Some(Utc::now());
        }
        record.updated_at = Utc::now();
        Ok(TransitionOutcome::Applied)
    }
}

// ============================================================================
// SQLite backend
// ============================================================================

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and run schema setup. `url` is a sqlx SQLite URL
    /// (e.g. `sqlite://escrow-agent.db` or `sqlite::memory:`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Backend(e.into()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        info!("SQLite store ready at {}", url);
        Ok(store)
    }

    async fn init(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS negotiations (
                user_id TEXT PRIMARY KEY,
                role TEXT,
                counterparty_id TEXT,
                description TEXT,
                price TEXT,
                buyer_agreed INTEGER NOT NULL DEFAULT 0,
                seller_agreed INTEGER NOT NULL DEFAULT 0,
                buyer_address TEXT,
                seller_address TEXT,
                buyer_id TEXT,
                seller_id TEXT,
                session_id TEXT,
                status_channel_id TEXT,
                status_message_id TEXT,
                escrow_id TEXT,
                watcher_started INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trades (
                escrow_id TEXT PRIMARY KEY,
                buyer_id TEXT NOT NULL,
                seller_id TEXT NOT NULL,
                buyer_address TEXT NOT NULL,
                seller_address TEXT NOT NULL,
                base_amount TEXT NOT NULL,
                fee_bps INTEGER NOT NULL,
                status TEXT NOT NULL,
                delivered_at TEXT,
                accrued_fees TEXT NOT NULL,
                session_id TEXT,
                status_channel_id TEXT,
                status_message_id TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_negotiation<'e, E>(executor: E, r: &NegotiationRecord) -> StoreResult<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            "INSERT INTO negotiations (
                user_id, role, counterparty_id, description, price,
                buyer_agreed, seller_agreed, buyer_address, seller_address,
                buyer_id, seller_id, session_id,
                status_channel_id, status_message_id,
                escrow_id, watcher_started, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                role = excluded.role,
                counterparty_id = excluded.counterparty_id,
                description = excluded.description,
                price = excluded.price,
                buyer_agreed = excluded.buyer_agreed,
                seller_agreed = excluded.seller_agreed,
                buyer_address = excluded.buyer_address,
                seller_address = excluded.seller_address,
                buyer_id = excluded.buyer_id,
                seller_id = excluded.seller_id,
                session_id = excluded.session_id,
                status_channel_id = excluded.status_channel_id,
                status_message_id = excluded.status_message_id,
                escrow_id = excluded.escrow_id,
                watcher_started = excluded.watcher_started,
                updated_at = excluded.updated_at",
        )
        .bind(&r.user_id)
        .bind(r.role.map(|role| role.as_str()))
        .bind(&r.counterparty_id)
        .bind(&r.description)
        .bind(r.price.map(|p| p.to_string()))
        .bind(r.buyer_agreed)
        .bind(r.seller_agreed)
        .bind(&r.buyer_address)
        .bind(&r.seller_address)
        .bind(&r.buyer_id)
        .bind(&r.seller_id)
        .bind(&r.session_id)
        .bind(r.status_message.as_ref().map(|m| m.channel_id.clone()))
        .bind(r.status_message.as_ref().map(|m| m.message_id.clone()))
        .bind(&r.escrow_id)
        .bind(r.watcher_started)
        .bind(r.created_at.to_rfc3339())
        .bind(r.updated_at.to_rfc3339())
        .execute(executor)
        .await?;
        Ok(())
    }
}

fn parse_timestamp(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("bad timestamp '{}': {}", s, e)))
}

fn message_ref_from_columns(
    channel: Option<String>,
    message: Option<String>,
) -> Option<MessageRef> {
    match (channel, message) {
        (Some(channel_id), Some(message_id)) => Some(MessageRef {
            channel_id,
            message_id,
        }),
        _ => None,
    }
}

fn negotiation_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<NegotiationRecord> {
    let price: Option<String> = row.try_get("price")?;
    let price = match price {
        Some(p) => Some(
            Decimal::from_str(&p)
                .map_err(|e| StoreError::Backend(anyhow::anyhow!("bad price '{}': {}", p, e)))?,
        ),
        None => None,
    };
    let role: Option<String> = row.try_get("role")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(NegotiationRecord {
        user_id: row.try_get("user_id")?,
        role: role.as_deref().and_then(Role::parse),
        counterparty_id: row.try_get("counterparty_id")?,
        description: row.try_get("description")?,
        price,
        buyer_agreed: row.try_get("buyer_agreed")?,
        seller_agreed: row.try_get("seller_agreed")?,
        buyer_address: row.try_get("buyer_address")?,
        seller_address: row.try_get("seller_address")?,
        buyer_id: row.try_get("buyer_id")?,
        seller_id: row.try_get("seller_id")?,
        session_id: row.try_get("session_id")?,
        status_message: message_ref_from_columns(
            row.try_get("status_channel_id")?,
            row.try_get("status_message_id")?,
        ),
        escrow_id: row.try_get("escrow_id")?,
        watcher_started: row.try_get("watcher_started")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_units(s: &str) -> StoreResult<u128> {
    s.parse::<u128>()
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("bad amount '{}': {}", s, e)))
}

fn trade_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<TradeRecord> {
    let status: String = row.try_get("status")?;
    let status = TradeStatus::parse(&status)
        .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("unknown status '{}'", status)))?;
    let base_amount: String = row.try_get("base_amount")?;
    let accrued_fees: String = row.try_get("accrued_fees")?;
    let delivered_at: Option<String> = row.try_get("delivered_at")?;
    let delivered_at = match delivered_at {
        Some(ts) => Some(parse_timestamp(&ts)?),
        None => None,
    };
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let fee_bps: i64 = row.try_get("fee_bps")?;
    Ok(TradeRecord {
        escrow_id: row.try_get("escrow_id")?,
        buyer_id: row.try_get("buyer_id")?,
        seller_id: row.try_get("seller_id")?,
        buyer_address: row.try_get("buyer_address")?,
        seller_address: row.try_get("seller_address")?,
        base_amount: parse_units(&base_amount)?,
        fee_bps: fee_bps as u32,
        status,
        delivered_at,
        accrued_fees: parse_units(&accrued_fees)?,
        session_id: row.try_get("session_id")?,
        status_message: message_ref_from_columns(
            row.try_get("status_channel_id")?,
            row.try_get("status_message_id")?,
        ),
        created_by: row.try_get("created_by")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl NegotiationStore for SqliteStore {
    async fn get(&self, user_id: &str) -> StoreResult<Option<NegotiationRecord>> {
        let row = sqlx::query("SELECT * FROM negotiations WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(negotiation_from_row).transpose()
    }

    async fn start(&self, user_id: &str) -> StoreResult<NegotiationRecord> {
        let record = NegotiationRecord::new(user_id);
        Self::upsert_negotiation(&self.pool, &record).await?;
        Ok(record)
    }

    async fn merge(&self, user_id: &str, patch: NegotiationPatch) -> StoreResult<NegotiationRecord> {
        // Read-modify-write inside one transaction; SQLite serializes
        // writers so the merge is atomic per key.
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM negotiations WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        let current = match row.as_ref() {
            Some(row) => negotiation_from_row(row)?,
            None => NegotiationRecord::new(user_id),
        };
        let merged = apply_patch(current, patch)?;
        Self::upsert_negotiation(&mut *tx, &merged).await?;
        tx.commit().await?;
        Ok(merged)
    }

    async fn clear(&self, user_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM negotiations WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TradeStore for SqliteStore {
    async fn upsert(&self, r: &TradeRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO trades (
                escrow_id, buyer_id, seller_id, buyer_address, seller_address,
                base_amount, fee_bps, status, delivered_at, accrued_fees,
                session_id, status_channel_id, status_message_id,
                created_by, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(escrow_id) DO UPDATE SET
                status = excluded.status,
                delivered_at = excluded.delivered_at,
                accrued_fees = excluded.accrued_fees,
                session_id = excluded.session_id,
                status_channel_id = excluded.status_channel_id,
                status_message_id = excluded.status_message_id,
                updated_at = excluded.updated_at",
        )
        .bind(&r.escrow_id)
        .bind(&r.buyer_id)
        .bind(&r.seller_id)
        .bind(&r.buyer_address)
        .bind(&r.seller_address)
        .bind(r.base_amount.to_string())
        .bind(r.fee_bps as i64)
        .bind(r.status.as_str())
        .bind(r.delivered_at.map(|d| d.to_rfc3339()))
        .bind(r.accrued_fees.to_string())
        .bind(&r.session_id)
        .bind(r.status_message.as_ref().map(|m| m.channel_id.clone()))
        .bind(r.status_message.as_ref().map(|m| m.message_id.clone()))
        .bind(&r.created_by)
        .bind(r.created_at.to_rfc3339())
        .bind(r.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, escrow_id: &str) -> StoreResult<Option<TradeRecord>> {
        let row = sqlx::query("SELECT * FROM trades WHERE escrow_id = ?")
            .bind(escrow_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    async fn transition(&self, escrow_id: &str, to: TradeStatus) -> StoreResult<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM trades WHERE escrow_id = ?")
            .bind(escrow_id)
            .fetch_optional(&mut *tx)
            .await?;
        let record = match row.as_ref() {
            Some(row) => trade_from_row(row)?,
            None => {
                return Err(StoreError::Backend(anyhow::anyhow!(
                    "unknown escrow {}",
                    escrow_id
                )))
            }
        };
        if record.status == to {
            return Ok(TransitionOutcome::AlreadyAt);
        }
        if !record.status.can_transition_to(to) {
            return Ok(TransitionOutcome::Rejected {
                from: record.status,
            });
        }
        let delivered_at = if to == TradeStatus::Delivered {
            Some(Utc::now().to_rfc3339())
        } else {
            record.delivered_at.map(|d| d.to_rfc3339())
        };
        sqlx::query(
            "UPDATE trades SET status = ?, delivered_at = ?, updated_at = ? WHERE escrow_id = ?",
        )
        .bind(to.as_str())
        .bind(delivered_at)
        .bind(Utc::now().to_rfc3339())
        .bind(escrow_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(TransitionOutcome::Applied)
    }
}
