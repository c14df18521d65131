//! In-process simulated escrow ledger
//!
//! Implements `LedgerClient` against an in-memory escrow manager so the full
//! pipeline (creation, watching, deliver/approve/cancel) runs locally with
//! no chain. Funding is a buyer-side on-chain action the bot never submits,
//! so the simulator exposes `fund` for the console to trigger directly.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use escrow_agent_logic::derive::{CREATION_EVENT, EXISTS_ACCESSOR, LATEST_ACCESSOR};
use escrow_agent_logic::fees;
use escrow_agent_logic::ledger::{
    ChainEvent, LedgerClient, LedgerLog, SubscriptionId, TxHandle, TxReceipt,
};
use escrow_agent_logic::orchestrator::{
    APPROVE_METHOD, CANCEL_METHOD, CREATE_METHOD, DELIVER_METHOD,
};
use escrow_agent_logic::types::TradeStatus;
use escrow_agent_logic::watcher::{STATUS_ACCESSOR, STATUS_EVENT};

struct SimEscrow {
    buyer: String,
    seller: String,
    amount: u128,
    fee_bps: u32,
    operator_share_bps: u32,
    operator: String,
    fee_receiver: String,
    status: TradeStatus,
}

struct Subscription {
    contract: String,
    event: String,
    resource_filter: Option<String>,
    sink: mpsc::UnboundedSender<ChainEvent>,
}

#[derive(Default)]
struct SimState {
    escrows: IndexMap<String, SimEscrow>,
    receipts: HashMap<String, TxReceipt>,
    subscriptions: HashMap<u64, Subscription>,
    next_tx: u64,
    next_sub: u64,
    next_escrow: u64,
}

pub struct SimLedger {
    manager: String,
    state: Mutex<SimState>,
}

impl SimLedger {
    pub fn new(manager: &str) -> Self {
        Self {
            manager: manager.to_string(),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Buyer-side funding action: Created -> Funded, with the status event.
    pub fn fund(&self, escrow_id: &str) -> Result<()> {
        self.advance(escrow_id, TradeStatus::Funded)
    }

    fn advance(&self, escrow_id: &str, to: TradeStatus) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let escrow = state
                .escrows
                .get_mut(escrow_id)
                .ok_or_else(|| anyhow!("unknown escrow {}", escrow_id))?;
            if !escrow.status.can_transition_to(to) {
                bail!("escrow {} is {}, cannot move to {}", escrow_id, escrow.status, to);
            }
            escrow.status = to;
            if to == TradeStatus::Completed {
                let pool = fees::fee_pool(escrow.amount, escrow.fee_bps);
                let (operator_cut, receiver_cut) =
                    fees::split_fee_pool(pool, escrow.operator_share_bps);
                info!(
                    "[sim] Escrow {} settled: {} to seller {}, {} to operator {}, {} to fee receiver {}",
                    escrow_id,
                    fees::format_base_units(fees::seller_payout(escrow.amount, escrow.fee_bps)),
                    escrow.seller,
                    fees::format_base_units(operator_cut),
                    escrow.operator,
                    fees::format_base_units(receiver_cut),
                    escrow.fee_receiver,
                );
            }
        }
        info!("[sim] Escrow {} -> {}", escrow_id, to);
        self.emit_status(escrow_id, to);
        Ok(())
    }

    fn emit_status(&self, escrow_id: &str, status: TradeStatus) {
        let state = self.state.lock().unwrap();
        for sub in state.subscriptions.values() {
            if sub.contract != self.manager || sub.event != STATUS_EVENT {
                continue;
            }
            if let Some(filter) = &sub.resource_filter {
                if filter != escrow_id {
                    continue;
                }
            }
            let _ = sub.sink.send(ChainEvent {
                event: STATUS_EVENT.to_string(),
                resource_id: escrow_id.to_string(),
                args: json!({ "status": status.as_str() }),
            });
        }
    }

    fn arg_str(args: &[Value], index: usize, name: &str) -> Result<String> {
        args.get(index)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("missing '{}' argument", name))
    }

    fn create(&self, args: &[Value]) -> Result<(String, TxReceipt, String)> {
        let buyer = Self::arg_str(args, 0, "buyer")?;
        let seller = Self::arg_str(args, 1, "seller")?;
        let amount: u128 = Self::arg_str(args, 2, "amount")?
            .parse()
            .map_err(|_| anyhow!("amount must be integer base units"))?;
        let fee_bps = args
            .get(3)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow!("missing 'fee_bps' argument"))? as u32;
        let operator_share_bps = args
            .get(4)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow!("missing 'operator_share_bps' argument"))?
            as u32;
        let operator = Self::arg_str(args, 5, "operator")?;
        let fee_receiver = Self::arg_str(args, 6, "fee_receiver")?;

        let mut state = self.state.lock().unwrap();
        state.next_escrow += 1;
        let escrow_id = format!("0x{:040x}", 0xe5c0_0000_u64 + state.next_escrow);
        state.escrows.insert(
            escrow_id.clone(),
            SimEscrow {
                buyer: buyer.clone(),
                seller: seller.clone(),
                amount,
                fee_bps,
                operator_share_bps,
                operator,
                fee_receiver,
                status: TradeStatus::Created,
            },
        );

        state.next_tx += 1;
        let tx_id = format!("sim-tx-{}", state.next_tx);
        let receipt = TxReceipt {
            tx_id: tx_id.clone(),
            success: true,
            logs: vec![LedgerLog {
                event: Some(CREATION_EVENT.to_string()),
                args: json!({ "escrow": escrow_id, "buyer": buyer, "seller": seller }),
                indexed: vec![escrow_id.clone(), buyer, seller],
            }],
            error: None,
        };
        state.receipts.insert(tx_id.clone(), receipt.clone());
        Ok((tx_id, receipt, escrow_id))
    }

    fn action_receipt(&self, escrow_id: &str, to: TradeStatus) -> (String, TxReceipt) {
        let result = self.advance(escrow_id, to);
        let mut state = self.state.lock().unwrap();
        state.next_tx += 1;
        let tx_id = format!("sim-tx-{}", state.next_tx);
        let receipt = match result {
            Ok(()) => TxReceipt {
                tx_id: tx_id.clone(),
                success: true,
                logs: Vec::new(),
                error: None,
            },
            Err(e) => TxReceipt {
                tx_id: tx_id.clone(),
                success: false,
                logs: Vec::new(),
                error: Some(e.to_string()),
            },
        };
        state.receipts.insert(tx_id.clone(), receipt.clone());
        (tx_id, receipt)
    }
}

#[async_trait]
impl LedgerClient for SimLedger {
    async fn read(&self, contract: &str, method: &str, args: &[Value]) -> Result<Value> {
        if contract != self.manager {
            bail!("unknown contract {}", contract);
        }
        let state = self.state.lock().unwrap();
        match method {
            STATUS_ACCESSOR => {
                let id = Self::arg_str(args, 0, "escrow")?;
                Ok(state
                    .escrows
                    .get(&id)
                    .map(|e| json!(e.status.as_str()))
                    .unwrap_or(Value::Null))
            }
            EXISTS_ACCESSOR => {
                let id = Self::arg_str(args, 0, "escrow")?;
                Ok(json!(state.escrows.contains_key(&id)))
            }
            LATEST_ACCESSOR => {
                let owner = Self::arg_str(args, 0, "owner")?;
                Ok(state
                    .escrows
                    .iter()
                    .rev()
                    .find(|(_, e)| e.buyer == owner)
                    .map(|(id, _)| json!(id))
                    .unwrap_or(Value::Null))
            }
            _ => bail!("unknown read method {}", method),
        }
    }

    async fn write(&self, contract: &str, method: &str, args: &[Value]) -> Result<TxHandle> {
        if contract != self.manager {
            bail!("unknown contract {}", contract);
        }
        let tx_id = match method {
            CREATE_METHOD => {
                let (tx_id, _, escrow_id) = self.create(args)?;
                debug!("[sim] {} created by tx {}", escrow_id, tx_id);
                tx_id
            }
            DELIVER_METHOD => {
                let id = Self::arg_str(args, 0, "escrow")?;
                self.action_receipt(&id, TradeStatus::Delivered).0
            }
            APPROVE_METHOD => {
                let id = Self::arg_str(args, 0, "escrow")?;
                self.action_receipt(&id, TradeStatus::Completed).0
            }
            CANCEL_METHOD => {
                let id = Self::arg_str(args, 0, "escrow")?;
                self.action_receipt(&id, TradeStatus::Cancelled).0
            }
            _ => bail!("unknown write method {}", method),
        };
        Ok(TxHandle {
            command_id: format!("cmd-{}", tx_id),
            tx_id,
        })
    }

    async fn wait_for_confirmation(&self, handle: &TxHandle) -> Result<TxReceipt> {
        self.state
            .lock()
            .unwrap()
            .receipts
            .get(&handle.tx_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown transaction {}", handle.tx_id))
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
        // Only the manager (and escrows it spawned) carry code in the sim
        let state = self.state.lock().unwrap();
        Ok(address == self.manager || state.escrows.contains_key(address))
    }
}
