//! Escrow Agent Logic - Shared trade negotiation and settlement orchestration
//!
//! This library contains the core logic shared between the console bot binary
//! and any future chat-platform front end (Discord/Telegram adapters).
//!
//! Key components:
//! - Trade lifecycle orchestrator with pluggable ports (`ChatPort`, `LedgerClient`)
//! - Twin negotiation record store (SQLite or in-memory)
//! - Ledger watcher with backfill and idempotent event application
//! - Action lock + cooldown manager for settlement-affecting transactions
//! - Basis-point fee calculator matching the escrow contract's integer math

pub mod background;
pub mod chat;
pub mod config;
pub mod derive;
pub mod dispatch;
pub mod fees;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod quotes;
pub mod store;
pub mod types;
pub mod watcher;

#[cfg(test)]
pub mod testing;
