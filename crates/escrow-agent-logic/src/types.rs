//! Shared types for the escrow agent
//!
//! Contains the negotiation record pair, trade record and lifecycle status.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::chat::MessageRef;

/// Which side of the trade a participant takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Buyer,
    Seller,
}

impl Role {
    /// The counterparty's role
    pub fn complement(self) -> Role {
        match self {
            Role::Buyer => Role::Seller,
            Role::Seller => Role::Buyer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Buyer => "buyer",
            Role::Seller => "seller",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.to_ascii_lowercase().as_str() {
            "buyer" => Some(Role::Buyer),
            "seller" => Some(Role::Seller),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escrow lifecycle status, mirroring the on-chain contract.
///
/// Status only advances; Cancelled/Disputed are absorbing alternates
/// reachable from Created/Funded/Delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Created,
    Funded,
    Delivered,
    Completed,
    Cancelled,
    Disputed,
}

impl TradeStatus {
    /// Numeric rank along the happy path (terminal alternates have none)
    fn rank(self) -> Option<u8> {
        match self {
            TradeStatus::Created => Some(0),
            TradeStatus::Funded => Some(1),
            TradeStatus::Delivered => Some(2),
            TradeStatus::Completed => Some(3),
            TradeStatus::Cancelled | TradeStatus::Disputed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradeStatus::Completed | TradeStatus::Cancelled | TradeStatus::Disputed
        )
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Forward moves along Created → Funded → Delivered → Completed (skips
    /// allowed — the watcher may observe a later state first), plus
    /// Cancelled/Disputed from any non-terminal state.
    pub fn can_transition_to(self, next: TradeStatus) -> bool {
        if self == next || self.is_terminal() {
            return false;
        }
        match next.rank() {
            Some(next_rank) => match self.rank() {
                Some(cur) => next_rank > cur,
                None => false,
            },
            // Cancelled/Disputed from any non-terminal state
            None => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TradeStatus::Created => "created",
            TradeStatus::Funded => "funded",
            TradeStatus::Delivered => "delivered",
            TradeStatus::Completed => "completed",
            TradeStatus::Cancelled => "cancelled",
            TradeStatus::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Option<TradeStatus> {
        match s {
            "created" => Some(TradeStatus::Created),
            "funded" => Some(TradeStatus::Funded),
            "delivered" => Some(TradeStatus::Delivered),
            "completed" => Some(TradeStatus::Completed),
            "cancelled" => Some(TradeStatus::Cancelled),
            "disputed" => Some(TradeStatus::Disputed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-participant negotiation state, mirrored with the counterparty's twin.
///
/// Keyed by `user_id`. Shared fields (terms, escrow id, locked identities)
/// are written once and identical across the pair; per-party fields
/// (agreement flags, addresses) are each written only by their owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationRecord {
    pub user_id: String,
    pub role: Option<Role>,
    pub counterparty_id: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub buyer_agreed: bool,
    pub seller_agreed: bool,
    pub buyer_address: Option<String>,
    pub seller_address: Option<String>,
    /// Locked identity pair — frozen once a session is created
    pub buyer_id: Option<String>,
    pub seller_id: Option<String>,
    pub session_id: Option<String>,
    pub status_message: Option<MessageRef>,
    pub escrow_id: Option<String>,
    pub watcher_started: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NegotiationRecord {
    pub fn new(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            role: None,
            counterparty_id: None,
            description: None,
            price: None,
            buyer_agreed: false,
            seller_agreed: false,
            buyer_address: None,
            seller_address: None,
            buyer_id: None,
            seller_id: None,
            session_id: None,
            status_message: None,
            escrow_id: None,
            watcher_started: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// This participant's own agreement flag
    pub fn own_agreed(&self) -> bool {
        match self.role {
            Some(Role::Buyer) => self.buyer_agreed,
            Some(Role::Seller) => self.seller_agreed,
            None => false,
        }
    }

    /// This participant's own settlement address
    pub fn own_address(&self) -> Option<&str> {
        match self.role {
            Some(Role::Buyer) => self.buyer_address.as_deref(),
            Some(Role::Seller) => self.seller_address.as_deref(),
            None => None,
        }
    }

    /// Both parties agreed and supplied addresses
    pub fn ready_to_settle(&self) -> bool {
        self.buyer_agreed
            && self.seller_agreed
            && self.buyer_address.is_some()
            && self.seller_address.is_some()
    }
}

/// Partial update for a NegotiationRecord: `Some` fields are applied,
/// `None` fields left untouched (shallow merge).
#[derive(Debug, Clone, Default)]
pub struct NegotiationPatch {
    pub role: Option<Role>,
    pub counterparty_id: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub buyer_agreed: Option<bool>,
    pub seller_agreed: Option<bool>,
    pub buyer_address: Option<String>,
    pub seller_address: Option<String>,
    pub buyer_id: Option<String>,
    pub seller_id: Option<String>,
    pub session_id: Option<String>,
    pub status_message: Option<MessageRef>,
    pub escrow_id: Option<String>,
    pub watcher_started: Option<bool>,
    /// Reset both agreement flags to false before applying the rest
    /// (fresh-session reset — the only legal false transition)
    pub reset_agreements: bool,
}

/// Persisted mirror of one created escrow, keyed by escrow id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub escrow_id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub buyer_address: String,
    pub seller_address: String,
    /// Base amount in integer base units (6 decimal places)
    pub base_amount: u128,
    pub fee_bps: u32,
    pub status: TradeStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Accrued fee pool in base units (buyer premium + seller discount)
    pub accrued_fees: u128,
    pub session_id: Option<String>,
    pub status_message: Option<MessageRef>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_complement() {
        assert_eq!(Role::Buyer.complement(), Role::Seller);
        assert_eq!(Role::Seller.complement(), Role::Buyer);
        assert_eq!(Role::parse("BUYER"), Some(Role::Buyer));
        assert_eq!(Role::parse("nope"), None);
    }

    #[test]
    fn test_status_forward_only() {
        use TradeStatus::*;
        assert!(Created.can_transition_to(Funded));
        assert!(Funded.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Completed));
        // Skips allowed (watcher may first observe a later state)
        assert!(Created.can_transition_to(Completed));
        // Never backwards, never self
        assert!(!Funded.can_transition_to(Created));
        assert!(!Funded.can_transition_to(Funded));
    }

    #[test]
    fn test_status_absorbing_alternates() {
        use TradeStatus::*;
        for from in [Created, Funded, Delivered] {
            assert!(from.can_transition_to(Cancelled));
            assert!(from.can_transition_to(Disputed));
        }
        for terminal in [Completed, Cancelled, Disputed] {
            assert!(!terminal.can_transition_to(Funded));
            assert!(!terminal.can_transition_to(Cancelled));
            assert!(!terminal.can_transition_to(Disputed));
        }
    }

    #[test]
    fn test_status_roundtrip_labels() {
        use TradeStatus::*;
        for s in [Created, Funded, Delivered, Completed, Cancelled, Disputed] {
            assert_eq!(TradeStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_record_own_fields() {
        let mut rec = NegotiationRecord::new("alice");
        rec.role = Some(Role::Seller);
        rec.seller_agreed = true;
        rec.seller_address = Some("0xabc".to_string());
        assert!(rec.own_agreed());
        assert_eq!(rec.own_address(), Some("0xabc"));
        assert!(!rec.ready_to_settle());
    }
}
