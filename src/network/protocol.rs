//! Protocol Messages
//!
//! Wire format for flow sessions between two parties.
//! All messages are serialized as JSON for debugging ease.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::hash::SecureHash;
use crate::game::payout::PayoutTable;
use crate::ledger::party::{Party, TransactionSignature};
use crate::ledger::states::StateRef;
use crate::ledger::transaction::SignedTransaction;

/// Which responder flow an inbound session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// One slot game, casino side.
    Play,
    /// Issuer cosigning a redemption.
    Redeem,
}

/// Messages exchanged inside a flow session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowMessage {
    /// Player asks for a game.
    PlayRequest {
        /// Amount the player locks.
        wager: u64,
        /// Issuer of the wagered tokens.
        issuer: Party,
        /// Requesting player.
        player: Party,
    },

    /// Casino's commitment and the stake it offers.
    CasinoCommit {
        /// Hash of the casino's secret image.
        commit_hash: SecureHash,
        /// Id the casino's commitment record will carry.
        commit_id: Uuid,
        /// Casino identity.
        casino: Party,
        /// Unlocked casino tokens to be locked.
        stake_refs: Vec<StateRef>,
        /// Amount of the casino stake.
        stake: u64,
        /// Table the game pays out against.
        paytable: PayoutTable,
    },

    /// A transaction for the counterparty to check and sign.
    ProposeTransaction {
        /// Partially signed transaction.
        tx: SignedTransaction,
    },

    /// Counterparty signature over a proposal.
    Signature {
        /// The signature.
        sig: TransactionSignature,
    },

    /// Counterparty refuses to continue.
    Reject {
        /// Human-readable reason.
        reason: String,
    },

    /// The proposal has been notarised.
    Finalised {
        /// Committed transaction id.
        tx_id: SecureHash,
    },

    /// Notarisation conflicted; restart from the request.
    Retry {
        /// Attempt that failed, counted from zero.
        attempt: u32,
    },

    /// Sender's reveal has been notarised.
    Revealed {
        /// Location of the revealed record.
        state: StateRef,
    },
}

impl FlowMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Variant name, for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PlayRequest { .. } => "play_request",
            Self::CasinoCommit { .. } => "casino_commit",
            Self::ProposeTransaction { .. } => "propose_transaction",
            Self::Signature { .. } => "signature",
            Self::Reject { .. } => "reject",
            Self::Finalised { .. } => "finalised",
            Self::Retry { .. } => "retry",
            Self::Revealed { .. } => "revealed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_is_internally_tagged() {
        let msg = FlowMessage::Retry { attempt: 2 };
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"{"type":"retry","attempt":2}"#);

        match FlowMessage::from_json(&json).unwrap() {
            FlowMessage::Retry { attempt } => assert_eq!(attempt, 2),
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_reject_roundtrip() {
        let msg = FlowMessage::Reject { reason: "insufficient funds".into() };
        let parsed = FlowMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed.kind(), "reject");
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(FlowMessage::from_json(r#"{"type":"cancel"}"#).is_err());
    }

    #[test]
    fn test_flow_kind_names() {
        assert_eq!(serde_json::to_string(&FlowKind::Redeem).unwrap(), r#""redeem""#);
    }
}
