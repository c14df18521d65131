//! Interaction dispatch
//!
//! Inbound chat interactions arrive as a closed tagged union rather than
//! free-form kind strings; the UI layer registers its affordance ids at
//! startup and `validate_affordances` checks the two sets line up so a
//! button with no handler (or a handler with no button) fails fast instead
//! of surfacing as a dead click in production.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::types::Role;

/// The closed set of action kinds the orchestrator handles.
///
/// Also used as the action half of lock keys for settlement-affecting steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    SelectRole,
    SelectCounterparty,
    SubmitTerms,
    SetAddress,
    Agree,
    CreateEscrow,
    MarkDelivered,
    Approve,
    Cancel,
    Quote,
}

impl ActionKind {
    pub const ALL: [ActionKind; 10] = [
        ActionKind::SelectRole,
        ActionKind::SelectCounterparty,
        ActionKind::SubmitTerms,
        ActionKind::SetAddress,
        ActionKind::Agree,
        ActionKind::CreateEscrow,
        ActionKind::MarkDelivered,
        ActionKind::Approve,
        ActionKind::Cancel,
        ActionKind::Quote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::SelectRole => "select_role",
            ActionKind::SelectCounterparty => "select_counterparty",
            ActionKind::SubmitTerms => "submit_terms",
            ActionKind::SetAddress => "set_address",
            ActionKind::Agree => "agree",
            ActionKind::CreateEscrow => "create_escrow",
            ActionKind::MarkDelivered => "mark_delivered",
            ActionKind::Approve => "approve",
            ActionKind::Cancel => "cancel",
            ActionKind::Quote => "quote",
        }
    }

    pub fn parse(s: &str) -> Option<ActionKind> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound user interaction, already decoded by the chat adapter
#[derive(Debug, Clone)]
pub enum Interaction {
    SelectRole {
        user_id: String,
        channel_id: String,
        role: Role,
    },
    SelectCounterparty {
        user_id: String,
        channel_id: String,
        counterparty_id: String,
    },
    SubmitTerms {
        user_id: String,
        channel_id: String,
        description: String,
        price: String,
    },
    SetAddress {
        user_id: String,
        channel_id: String,
        address: String,
    },
    Agree {
        user_id: String,
        channel_id: String,
    },
    MarkDelivered {
        user_id: String,
        channel_id: String,
    },
    Approve {
        user_id: String,
        channel_id: String,
    },
    Cancel {
        user_id: String,
        channel_id: String,
    },
    Quote {
        user_id: String,
        channel_id: String,
        pair: String,
    },
}

impl Interaction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Interaction::SelectRole { .. } => ActionKind::SelectRole,
            Interaction::SelectCounterparty { .. } => ActionKind::SelectCounterparty,
            Interaction::SubmitTerms { .. } => ActionKind::SubmitTerms,
            Interaction::SetAddress { .. } => ActionKind::SetAddress,
            Interaction::Agree { .. } => ActionKind::Agree,
            Interaction::MarkDelivered { .. } => ActionKind::MarkDelivered,
            Interaction::Approve { .. } => ActionKind::Approve,
            Interaction::Cancel { .. } => ActionKind::Cancel,
            Interaction::Quote { .. } => ActionKind::Quote,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Interaction::SelectRole { user_id, .. }
            | Interaction::SelectCounterparty { user_id, .. }
            | Interaction::SubmitTerms { user_id, .. }
            | Interaction::SetAddress { user_id, .. }
            | Interaction::Agree { user_id, .. }
            | Interaction::MarkDelivered { user_id, .. }
            | Interaction::Approve { user_id, .. }
            | Interaction::Cancel { user_id, .. }
            | Interaction::Quote { user_id, .. } => user_id,
        }
    }

    pub fn channel_id(&self) -> &str {
        match self {
            Interaction::SelectRole { channel_id, .. }
            | Interaction::SelectCounterparty { channel_id, .. }
            | Interaction::SubmitTerms { channel_id, .. }
            | Interaction::SetAddress { channel_id, .. }
            | Interaction::Agree { channel_id, .. }
            | Interaction::MarkDelivered { channel_id, .. }
            | Interaction::Approve { channel_id, .. }
            | Interaction::Cancel { channel_id, .. }
            | Interaction::Quote { channel_id, .. } => channel_id,
        }
    }
}

/// Check the UI's registered affordance ids against the closed action set.
///
/// Fails when an affordance has no matching handler or an action kind has
/// no registered affordance. `CreateEscrow` is exempt from the second check:
/// creation is triggered internally by the second `Agree`, not by a button.
pub fn validate_affordances(registered: &[&str]) -> Result<()> {
    for id in registered {
        if ActionKind::parse(id).is_none() {
            bail!("UI affordance '{}' has no registered handler", id);
        }
    }
    for kind in ActionKind::ALL {
        if kind == ActionKind::CreateEscrow {
            continue;
        }
        if !registered.contains(&kind.as_str()) {
            bail!("Action '{}' has no registered UI affordance", kind.as_str());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_SET: [&str; 9] = [
        "select_role",
        "select_counterparty",
        "submit_terms",
        "set_address",
        "agree",
        "mark_delivered",
        "approve",
        "cancel",
        "quote",
    ];

    #[test]
    fn test_kind_roundtrip() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ActionKind::parse("mystery_button"), None);
    }

    #[test]
    fn test_validate_full_set() {
        validate_affordances(&FULL_SET).unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_affordance() {
        let mut set = FULL_SET.to_vec();
        set.push("mystery_button");
        assert!(validate_affordances(&set).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_affordance() {
        let set: Vec<&str> = FULL_SET.iter().copied().filter(|s| *s != "agree").collect();
        assert!(validate_affordances(&set).is_err());
    }

    #[test]
    fn test_interaction_accessors() {
        let i = Interaction::SetAddress {
            user_id: "alice".into(),
            channel_id: "chan-1".into(),
            address: "0xabc".into(),
        };
        assert_eq!(i.kind(), ActionKind::SetAddress);
        assert_eq!(i.user_id(), "alice");
        assert_eq!(i.channel_id(), "chan-1");
    }
}
