//! Trade lifecycle orchestrator
//!
//! Drives a negotiation from role selection through escrow creation and the
//! lock-guarded deliver/approve/cancel entry points. Every handler returns
//! exactly one user-visible reply, success or failure; transient failures
//! are rendered into that reply, and a broadcast whose confirmation wait
//! failed is reported as needing reconciliation, never asserted as success.
//!
//! Negotiation state lives as a twin pair of records (one per participant).
//! Every step writes through both twins; shared fields are write-once at the
//! store layer, so a divergent submission from the counterparty is rejected
//! there and surfaced as a friendly reply here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::chat::ChatPort;
use crate::config::AgentConfig;
use crate::derive::{derive_escrow_id, DeriveError};
use crate::dispatch::{ActionKind, Interaction};
use crate::fees::{self, AMOUNT_SCALE};
use crate::ledger::{is_valid_address, LedgerClient, TxReceipt};
use crate::lock::{ActionLocks, LockKey, LockOutcome};
use crate::quotes::QuoteService;
use crate::store::{NegotiationStore, StoreError, TradeStore};
use crate::types::{NegotiationPatch, NegotiationRecord, Role, TradeRecord, TradeStatus};
use crate::watcher::{LedgerWatcher, TradeEventApplier, WatchHandle, WatchOptions};

/// Escrow manager methods the orchestrator submits
pub const CREATE_METHOD: &str = "createEscrow";
pub const DELIVER_METHOD: &str = "markDelivered";
pub const APPROVE_METHOD: &str = "approve";
pub const CANCEL_METHOD: &str = "cancel";

/// Orchestrator tunables, usually taken from [`AgentConfig`]
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub manager_address: String,
    pub operator_address: String,
    pub fee_receiver_address: String,
    pub min_price: Decimal,
    pub fee_bps: u32,
    pub operator_share_bps: u32,
    pub lock_ttl: Duration,
    pub cooldown: Duration,
    pub reject_contract_addresses: bool,
    pub backfill_on_start: bool,
}

impl From<&AgentConfig> for OrchestratorSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            manager_address: config.manager_address.clone(),
            operator_address: config.operator_address.clone(),
            fee_receiver_address: config.fee_receiver_address.clone(),
            min_price: config.min_price,
            fee_bps: config.fee_bps,
            operator_share_bps: config.operator_share_bps,
            lock_ttl: Duration::from_millis(config.lock_ttl_ms),
            cooldown: Duration::from_millis(config.cooldown_ms),
            reject_contract_addresses: config.reject_contract_addresses,
            backfill_on_start: config.backfill_on_start,
        }
    }
}

/// Outcome of submit + confirmation wait
enum Confirmation {
    Confirmed(TxReceipt),
    /// Broadcast went out but the confirmation wait failed — the tx may
    /// have landed, so this is never treated as a clean failure
    Unconfirmed { tx_id: String },
}

pub struct Orchestrator {
    negotiations: Arc<dyn NegotiationStore>,
    trades: Arc<dyn TradeStore>,
    chat: Arc<dyn ChatPort>,
    ledger: Arc<dyn LedgerClient>,
    quotes: Arc<QuoteService>,
    locks: ActionLocks,
    watcher: LedgerWatcher,
    watches: tokio::sync::Mutex<HashMap<String, WatchHandle>>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        negotiations: Arc<dyn NegotiationStore>,
        trades: Arc<dyn TradeStore>,
        chat: Arc<dyn ChatPort>,
        ledger: Arc<dyn LedgerClient>,
        quotes: Arc<QuoteService>,
        settings: OrchestratorSettings,
    ) -> Self {
        let watcher = LedgerWatcher::new(ledger.clone(), &settings.manager_address);
        Self {
            negotiations,
            trades,
            chat,
            ledger,
            quotes,
            locks: ActionLocks::new(),
            watcher,
            watches: tokio::sync::Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// Handle one inbound interaction, producing exactly one reply.
    pub async fn handle(&self, interaction: Interaction) -> String {
        let kind = interaction.kind();
        let user = interaction.user_id().to_string();
        let result = match interaction {
            Interaction::SelectRole { user_id, role, .. } => {
                self.select_role(&user_id, role).await
            }
            Interaction::SelectCounterparty {
                user_id,
                counterparty_id,
                ..
            } => self.select_counterparty(&user_id, &counterparty_id).await,
            Interaction::SubmitTerms {
                user_id,
                description,
                price,
                ..
            } => self.submit_terms(&user_id, &description, &price).await,
            Interaction::SetAddress {
                user_id, address, ..
            } => self.set_address(&user_id, &address).await,
            Interaction::Agree { user_id, .. } => self.agree(&user_id).await,
            Interaction::MarkDelivered { user_id, .. } => self.mark_delivered(&user_id).await,
            Interaction::Approve { user_id, .. } => self.approve(&user_id).await,
            Interaction::Cancel { user_id, .. } => self.cancel(&user_id).await,
            Interaction::Quote { pair, .. } => self.quote(&pair).await,
        };
        match result {
            Ok(reply) => reply,
            Err(e) => {
                error!("[{}] {} failed: {:#}", user, kind, e);
                format!("Could not complete '{}' right now, please try again.", kind)
            }
        }
    }

    // ------------------------------------------------------------------
    // Negotiation steps
    // ------------------------------------------------------------------

    async fn select_role(&self, user_id: &str, role: Role) -> Result<String> {
        if let Some(rec) = self.negotiations.get(user_id).await? {
            // A pairing fixes both sides' roles; re-selecting after it would
            // let the twins end up on the same side
            if rec.counterparty_id.is_some() || rec.buyer_id.is_some() {
                return Ok(
                    "Roles are locked for this negotiation. Cancel it to start over.".to_string(),
                );
            }
        }
        self.negotiations
            .merge(
                user_id,
                NegotiationPatch {
                    role: Some(role),
                    ..Default::default()
                },
            )
            .await?;
        info!("[{}] Selected role {}", user_id, role);
        Ok(format!(
            "You are negotiating as the {}. Now pick your counterparty.",
            role
        ))
    }

    async fn select_counterparty(&self, user_id: &str, counterparty_id: &str) -> Result<String> {
        if counterparty_id == user_id {
            return Ok("You cannot trade with yourself.".to_string());
        }
        if self.chat.is_automated_user(counterparty_id).await? {
            return Ok(format!(
                "{} is an automated account and cannot take part in a trade.",
                counterparty_id
            ));
        }
        let Some(rec) = self.negotiations.get(user_id).await? else {
            return Ok("Select your role first.".to_string());
        };
        let Some(role) = rec.role else {
            return Ok("Select your role first.".to_string());
        };

        // Mirror the selection onto the counterparty's twin record so both
        // sides see a symmetric pairing
        self.negotiations
            .merge(
                user_id,
                NegotiationPatch {
                    counterparty_id: Some(counterparty_id.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        self.negotiations
            .merge(
                counterparty_id,
                NegotiationPatch {
                    role: Some(role.complement()),
                    counterparty_id: Some(user_id.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        info!(
            "[{}] Paired with {} as {}",
            user_id, counterparty_id, role
        );
        Ok(format!(
            "Trading with {} (they take the {} side). Submit your terms next.",
            counterparty_id,
            role.complement()
        ))
    }

    async fn submit_terms(&self, user_id: &str, description: &str, price: &str) -> Result<String> {
        let Some(rec) = self.negotiations.get(user_id).await? else {
            return Ok("Select a role and counterparty first.".to_string());
        };
        let (Some(role), Some(counterparty)) = (rec.role, rec.counterparty_id.clone()) else {
            return Ok("Select a role and counterparty first.".to_string());
        };
        if description.trim().is_empty() {
            return Ok("The item description cannot be empty.".to_string());
        }

        let Ok(mut parsed) = price.parse::<Decimal>() else {
            return Ok(format!("'{}' is not a valid price.", price));
        };
        if parsed < self.settings.min_price {
            return Ok(format!(
                "The minimum price is {}.",
                self.settings.min_price
            ));
        }
        let base = match fees::to_base_units(parsed) {
            Ok(base) => base,
            Err(e) => return Ok(format!("{}.", e)),
        };
        parsed.rescale(AMOUNT_SCALE);

        let patch = NegotiationPatch {
            description: Some(description.trim().to_string()),
            price: Some(parsed),
            ..Default::default()
        };
        let merged = match self.merge_both(user_id, &counterparty, patch).await {
            Ok(merged) => merged,
            Err(StoreError::DivergentSharedField { field, existing, .. }) => {
                return Ok(format!(
                    "Terms are already locked in ({} is '{}'). Cancel the negotiation to change them.",
                    field, existing
                ));
            }
            Err(e) => return Err(e.into()),
        };

        // Session creation is idempotent: reuse a still-reachable session,
        // otherwise open a fresh one, lock the identity pair and reset both
        // agreement flags
        let session_reused = match &merged.session_id {
            Some(session) => self.chat.session_reachable(session).await?,
            None => false,
        };
        if !session_reused {
            let session = self
                .chat
                .open_session(&[user_id, &counterparty])
                .await
                .context("Failed to open a negotiation session")?;
            let (buyer_id, seller_id) = match role {
                Role::Buyer => (user_id.to_string(), counterparty.clone()),
                Role::Seller => (counterparty.clone(), user_id.to_string()),
            };
            self.merge_both(
                user_id,
                &counterparty,
                NegotiationPatch {
                    session_id: Some(session.clone()),
                    buyer_id: Some(buyer_id),
                    seller_id: Some(seller_id),
                    reset_agreements: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(anyhow::Error::from)?;
            info!("[{}] Session {} opened with {}", user_id, session, counterparty);
        }

        let breakdown =
            fees::settlement_breakdown(base, self.settings.fee_bps, self.settings.operator_share_bps);
        Ok(format!(
            "Terms recorded: '{}' at {}. {}. Both parties: set your settlement address, then agree.",
            description.trim(),
            fees::format_base_units(base),
            breakdown.render()
        ))
    }

    async fn set_address(&self, user_id: &str, address: &str) -> Result<String> {
        let Some(rec) = self.negotiations.get(user_id).await? else {
            return Ok("Start a negotiation before setting an address.".to_string());
        };
        let (Some(role), Some(counterparty)) = (rec.role, rec.counterparty_id.clone()) else {
            return Ok("Start a negotiation before setting an address.".to_string());
        };
        if !is_valid_address(address) {
            return Ok(format!(
                "'{}' is not a valid settlement address (expected 0x + 40 hex characters).",
                address
            ));
        }
        if self.settings.reject_contract_addresses && self.ledger.has_code(address).await? {
            return Ok(format!(
                "{} is a contract address. Use a personal wallet address.",
                address
            ));
        }

        let patch = match role {
            Role::Buyer => NegotiationPatch {
                buyer_address: Some(address.to_string()),
                ..Default::default()
            },
            Role::Seller => NegotiationPatch {
                seller_address: Some(address.to_string()),
                ..Default::default()
            },
        };
        self.merge_both(user_id, &counterparty, patch)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(format!("Settlement address recorded for the {}.", role))
    }

    async fn agree(&self, user_id: &str) -> Result<String> {
        let Some(rec) = self.negotiations.get(user_id).await? else {
            return Ok("Nothing to agree to yet.".to_string());
        };
        let (Some(role), Some(counterparty)) = (rec.role, rec.counterparty_id.clone()) else {
            return Ok("Nothing to agree to yet.".to_string());
        };
        if rec.price.is_none() {
            return Ok("Agree once terms have been submitted.".to_string());
        }
        if rec.own_address().is_none() {
            return Ok("Set your settlement address before agreeing.".to_string());
        }
        if let Some(escrow_id) = &rec.escrow_id {
            return Ok(format!("The escrow is already live: {}.", escrow_id));
        }

        let patch = match role {
            Role::Buyer => NegotiationPatch {
                buyer_agreed: Some(true),
                ..Default::default()
            },
            Role::Seller => NegotiationPatch {
                seller_agreed: Some(true),
                ..Default::default()
            },
        };
        let merged = self
            .merge_both(user_id, &counterparty, patch)
            .await
            .map_err(anyhow::Error::from)?;

        if merged.ready_to_settle() {
            // Second agreement arms creation — no separate button for this
            self.create_escrow(user_id, merged).await
        } else {
            Ok("Agreement recorded. Waiting for your counterparty.".to_string())
        }
    }

    // ------------------------------------------------------------------
    // Escrow creation
    // ------------------------------------------------------------------

    async fn create_escrow(&self, user_id: &str, rec: NegotiationRecord) -> Result<String> {
        let buyer_address = rec
            .buyer_address
            .clone()
            .ok_or_else(|| anyhow!("ready record missing buyer address"))?;
        let seller_address = rec
            .seller_address
            .clone()
            .ok_or_else(|| anyhow!("ready record missing seller address"))?;
        if buyer_address == seller_address {
            // Correction prompt, never a transaction
            return Ok(
                "Buyer and seller settlement addresses are identical. Each party must set \
                 their own address before the escrow can be created."
                    .to_string(),
            );
        }
        let price = rec
            .price
            .ok_or_else(|| anyhow!("ready record missing price"))?;
        let base = fees::to_base_units(price)?;
        let counterparty = rec
            .counterparty_id
            .clone()
            .ok_or_else(|| anyhow!("ready record missing counterparty"))?;
        let session = rec
            .session_id
            .clone()
            .ok_or_else(|| anyhow!("ready record missing session"))?;

        let key: LockKey = (ActionKind::CreateEscrow, session.clone());
        let creation = self.create_escrow_locked(
            user_id,
            &counterparty,
            &session,
            &buyer_address,
            &seller_address,
            base,
        );
        let outcome = self
            .locks
            .with_lock_then_cooldown(&key, self.settings.lock_ttl, self.settings.cooldown, || {
                creation
            })
            .await?;
        match outcome {
            LockOutcome::Completed(reply) => Ok(reply),
            LockOutcome::Denied { remaining_ms } => Ok(format!(
                "Escrow creation is already in progress. Try again in {}ms.",
                remaining_ms
            )),
        }
    }

    /// Body of the creation critical section: at most one invocation per
    /// session runs at a time, and the lock is held through confirmation.
    async fn create_escrow_locked(
        &self,
        user_id: &str,
        counterparty: &str,
        session: &str,
        buyer_address: &str,
        seller_address: &str,
        base: u128,
    ) -> Result<String> {
        // Re-read under the lock: a racing second Agree may have finished
        // creation while this caller waited
        if let Some(current) = self.negotiations.get(user_id).await? {
            if let Some(escrow_id) = &current.escrow_id {
                return Ok(format!("The escrow is already live: {}.", escrow_id));
            }
        }

        let fee_bps = self.settings.fee_bps;
        let args = vec![
            json!(buyer_address),
            json!(seller_address),
            json!(base.to_string()),
            json!(fee_bps),
            json!(self.settings.operator_share_bps),
            json!(self.settings.operator_address),
            json!(self.settings.fee_receiver_address),
        ];
        let receipt = match self.submit_and_confirm(CREATE_METHOD, &args).await? {
            Confirmation::Confirmed(receipt) => receipt,
            Confirmation::Unconfirmed { tx_id } => {
                warn!("[{}] Creation tx {} unconfirmed", session, tx_id);
                return Ok(format!(
                    "The escrow creation transaction was broadcast but its confirmation \
                     could not be observed (tx {}). Do not retry — the trade needs manual \
                     reconciliation.",
                    tx_id
                ));
            }
        };
        if !receipt.success {
            return Ok(format!(
                "Escrow creation failed on-chain: {}. You can try again shortly.",
                receipt.error.as_deref().unwrap_or("unknown error")
            ));
        }

        let escrow_id = match derive_escrow_id(
            self.ledger.as_ref(),
            &receipt,
            &self.settings.manager_address,
            buyer_address,
        )
        .await
        {
            Ok(id) => id,
            Err(DeriveError::Undeterminable { tx_id }) => {
                return Ok(format!(
                    "The escrow was created but its id could not be determined from \
                     transaction {}. The trade needs manual reconciliation.",
                    tx_id
                ));
            }
            Err(DeriveError::Ledger { tx_id, source }) => {
                return Err(source.context(format!("deriving escrow id for {}", tx_id)));
            }
        };
        info!("[{}] Escrow {} created", session, escrow_id);

        // Persist the id before any further bookkeeping: once it is on the
        // twins, a retried Agree short-circuits at the under-lock re-read
        // instead of submitting a second creation transaction
        if let Err(e) = self
            .merge_both(
                user_id,
                counterparty,
                NegotiationPatch {
                    escrow_id: Some(escrow_id.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            error!(
                "[{}] Escrow {} created but its id was not recorded: {:#}",
                session, escrow_id, e
            );
            return Ok(format!(
                "The escrow was created as {} but its id could not be recorded. \
                 Do not retry — the trade needs manual reconciliation.",
                escrow_id
            ));
        }

        match self
            .finish_creation(
                user_id,
                counterparty,
                session,
                buyer_address,
                seller_address,
                base,
                &escrow_id,
            )
            .await
        {
            Ok(reply) => Ok(reply),
            Err(e) => {
                error!(
                    "[{}] Escrow {} is live but its bookkeeping failed: {:#}",
                    session, escrow_id, e
                );
                Ok(format!(
                    "Escrow {} is live, but posting its status failed. It will not be \
                     created twice; check the escrow status directly.",
                    escrow_id
                ))
            }
        }
    }

    /// Bookkeeping after a confirmed creation whose id is already persisted:
    /// status message, trade row, twin linkage, watcher. Failures here are
    /// reported to the user but never retried as a fresh creation.
    #[allow(clippy::too_many_arguments)]
    async fn finish_creation(
        &self,
        user_id: &str,
        counterparty: &str,
        session: &str,
        buyer_address: &str,
        seller_address: &str,
        base: u128,
        escrow_id: &str,
    ) -> Result<String> {
        let fee_bps = self.settings.fee_bps;
        let breakdown =
            fees::settlement_breakdown(base, fee_bps, self.settings.operator_share_bps);
        let status_text = format!("Escrow {} — created | {}", escrow_id, breakdown.render());
        let status_message = self
            .chat
            .send(session, &status_text)
            .await
            .context("Failed to post the escrow status message")?;

        let now = chrono::Utc::now();
        let (buyer_id, seller_id) = {
            let rec = self
                .negotiations
                .get(user_id)
                .await?
                .ok_or_else(|| anyhow!("negotiation record vanished during creation"))?;
            (
                rec.buyer_id
                    .ok_or_else(|| anyhow!("identity pair not locked"))?,
                rec.seller_id
                    .ok_or_else(|| anyhow!("identity pair not locked"))?,
            )
        };
        self.trades
            .upsert(&TradeRecord {
                escrow_id: escrow_id.to_string(),
                buyer_id,
                seller_id,
                buyer_address: buyer_address.to_string(),
                seller_address: seller_address.to_string(),
                base_amount: base,
                fee_bps,
                status: TradeStatus::Created,
                delivered_at: None,
                accrued_fees: breakdown.fee_pool,
                session_id: Some(session.to_string()),
                status_message: Some(status_message.clone()),
                created_by: user_id.to_string(),
                created_at: now,
                updated_at: now,
            })
            .await
            .map_err(anyhow::Error::from)?;

        self.merge_both(
            user_id,
            counterparty,
            NegotiationPatch {
                status_message: Some(status_message),
                watcher_started: Some(true),
                ..Default::default()
            },
        )
        .await
        .map_err(anyhow::Error::from)?;

        self.ensure_watch(escrow_id).await?;

        Ok(format!(
            "Escrow {} is live. {}. The buyer can now fund it on-chain.",
            escrow_id,
            breakdown.render()
        ))
    }

    /// Arm (or re-arm) the watcher for one escrow id.
    pub async fn ensure_watch(&self, escrow_id: &str) -> Result<()> {
        let mut watches = self.watches.lock().await;
        // Watch tasks end themselves once a trade goes terminal; drop their
        // spent handles so the map does not grow for the process lifetime
        watches.retain(|_, handle| !handle.is_finished());
        if watches.contains_key(escrow_id) {
            return Ok(());
        }
        let sink = Arc::new(TradeEventApplier {
            trades: self.trades.clone(),
            chat: self.chat.clone(),
        });
        let handle = self
            .watcher
            .watch(
                escrow_id,
                sink,
                WatchOptions {
                    backfill_on_start: self.settings.backfill_on_start,
                },
            )
            .await?;
        watches.insert(escrow_id.to_string(), handle);
        Ok(())
    }

    /// Stop all armed watches (shutdown path).
    pub async fn stop_watches(&self) {
        let mut watches = self.watches.lock().await;
        for (_, handle) in watches.drain() {
            handle.unwatch().await;
        }
    }

    // ------------------------------------------------------------------
    // Post-creation entry points
    // ------------------------------------------------------------------

    async fn mark_delivered(&self, user_id: &str) -> Result<String> {
        let (rec, escrow_id) = match self.live_escrow(user_id).await? {
            Ok(pair) => pair,
            Err(reply) => return Ok(reply),
        };
        if rec.role != Some(Role::Seller) {
            return Ok("Only the seller can mark the trade delivered.".to_string());
        }
        self.guarded_escrow_action(
            ActionKind::MarkDelivered,
            &escrow_id,
            DELIVER_METHOD,
            "Delivery recorded. Waiting for the buyer's approval.",
        )
        .await
    }

    async fn approve(&self, user_id: &str) -> Result<String> {
        let (rec, escrow_id) = match self.live_escrow(user_id).await? {
            Ok(pair) => pair,
            Err(reply) => return Ok(reply),
        };
        if rec.role != Some(Role::Buyer) {
            return Ok("Only the buyer can approve and release the funds.".to_string());
        }
        self.guarded_escrow_action(
            ActionKind::Approve,
            &escrow_id,
            APPROVE_METHOD,
            "Approval submitted. Funds release once the transaction settles.",
        )
        .await
    }

    async fn cancel(&self, user_id: &str) -> Result<String> {
        let Some(rec) = self.negotiations.get(user_id).await? else {
            return Ok("There is no negotiation to cancel.".to_string());
        };
        match &rec.escrow_id {
            Some(escrow_id) => {
                let escrow_id = escrow_id.clone();
                self.guarded_escrow_action(
                    ActionKind::Cancel,
                    &escrow_id,
                    CANCEL_METHOD,
                    "Cancellation submitted.",
                )
                .await
            }
            None => {
                // Nothing on-chain yet: drop both twins
                self.negotiations.clear(user_id).await?;
                if let Some(counterparty) = &rec.counterparty_id {
                    self.negotiations.clear(counterparty).await?;
                }
                Ok("Negotiation cancelled.".to_string())
            }
        }
    }

    async fn quote(&self, pair: &str) -> Result<String> {
        match self.quotes.quote(pair).await {
            Ok(price) => Ok(format!("{} is trading around {}.", pair, price)),
            Err(_) => Ok(format!(
                "No quote is available for {} right now.",
                pair
            )),
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Fetch the caller's record and its live escrow id, or the reply to
    /// send when there is none.
    async fn live_escrow(
        &self,
        user_id: &str,
    ) -> Result<std::result::Result<(NegotiationRecord, String), String>> {
        let Some(rec) = self.negotiations.get(user_id).await? else {
            return Ok(Err("You have no active trade.".to_string()));
        };
        match rec.escrow_id.clone() {
            Some(escrow_id) => Ok(Ok((rec, escrow_id))),
            None => Ok(Err("The escrow has not been created yet.".to_string())),
        }
    }

    /// Submit a single-argument escrow action under its action lock and
    /// hold the lock through confirmation.
    async fn guarded_escrow_action(
        &self,
        action: ActionKind,
        escrow_id: &str,
        method: &str,
        success_reply: &str,
    ) -> Result<String> {
        let key: LockKey = (action, escrow_id.to_string());
        let args = vec![json!(escrow_id)];
        let outcome = self
            .locks
            .with_lock_then_cooldown(&key, self.settings.lock_ttl, self.settings.cooldown, || async move {
                match self.submit_and_confirm(method, &args).await? {
                    Confirmation::Confirmed(receipt) if receipt.success => {
                        Ok(success_reply.to_string())
                    }
                    Confirmation::Confirmed(receipt) => Ok(format!(
                        "The {} transaction failed on-chain: {}.",
                        method,
                        receipt.error.as_deref().unwrap_or("unknown error")
                    )),
                    Confirmation::Unconfirmed { tx_id } => Ok(format!(
                        "The {} transaction was broadcast but its confirmation could not \
                         be observed (tx {}). Check the escrow status before retrying.",
                        method, tx_id
                    )),
                }
            })
            .await?;
        match outcome {
            LockOutcome::Completed(reply) => Ok(reply),
            LockOutcome::Denied { remaining_ms } => Ok(format!(
                "That action is already in progress. Try again in {}ms.",
                remaining_ms
            )),
        }
    }

    async fn submit_and_confirm(&self, method: &str, args: &[Value]) -> Result<Confirmation> {
        let handle = self
            .ledger
            .write(&self.settings.manager_address, method, args)
            .await
            .with_context(|| format!("Failed to submit {}", method))?;
        match self.ledger.wait_for_confirmation(&handle).await {
            Ok(receipt) => Ok(Confirmation::Confirmed(receipt)),
            Err(e) => {
                warn!("Confirmation wait for {} failed: {:#}", handle.tx_id, e);
                Ok(Confirmation::Unconfirmed {
                    tx_id: handle.tx_id,
                })
            }
        }
    }

    /// Merge the same patch into both twins, returning the caller's merged
    /// record.
    async fn merge_both(
        &self,
        user_id: &str,
        counterparty: &str,
        patch: NegotiationPatch,
    ) -> Result<NegotiationRecord, StoreError> {
        let merged = self.negotiations.merge(user_id, patch.clone()).await?;
        self.negotiations.merge(counterparty, patch).await?;
        Ok(merged)
    }
}
