//! Token Flows
//!
//! Issuance is unilateral: the issuer signs and notarises alone.
//! Redemption needs the issuer's consent, collected over a session.

use tracing::{info, instrument, warn};

use crate::flows::node::Node;
use crate::flows::{ensure, FlowError};
use crate::ledger::party::Party;
use crate::ledger::states::{StateAndRef, StateRef, TokenState};
use crate::ledger::transaction::{Command, SignedTransaction, TokenCommand, TransactionBuilder};
use crate::network::protocol::{FlowKind, FlowMessage};
use crate::network::session::{FlowSession, SessionError};

/// Issue tokens to each `(holder, amount)`, the node being the issuer.
#[instrument(skip_all, fields(issuer = %node.party(), grants = grants.len()))]
pub(crate) async fn issue(node: &Node, grants: &[(Party, u64)]) -> Result<SignedTransaction, FlowError> {
    let issuer = node.party().clone();
    let mut builder = TransactionBuilder::new();
    let outputs = grants
        .iter()
        .map(|(holder, amount)| builder.add_output(TokenState::unlocked(holder.clone(), issuer.clone(), *amount)))
        .collect();
    builder.add_command(TokenCommand::Issue { outputs }, vec![node.keys().public_key()]);

    let stx = builder.sign(node.keys())?;
    let id = node.notarise(&stx).await?;
    info!(tx = %id.short(), total = grants.iter().map(|(_, a)| *a).sum::<u64>(), "tokens issued");
    Ok(stx)
}

/// Redeem `amount` of our tokens with the issuer behind `issuer_handle`.
#[instrument(skip(node), fields(holder = %node.party()))]
pub(crate) async fn redeem(node: &Node, amount: u64, issuer_handle: &str) -> Result<SignedTransaction, FlowError> {
    if amount == 0 {
        return Err(FlowError::InvalidRequest("redeem amount must be positive".into()));
    }

    let issuer = node.resolve_peer(issuer_handle).await?.party;
    let session = if issuer == *node.party() {
        None
    } else {
        Some(node.open_session(issuer_handle, FlowKind::Redeem).await?)
    };

    let mut attempt = 0;
    loop {
        let inputs = node.select_tokens(&issuer, amount).await?;
        let spent: Vec<StateRef> = inputs.iter().map(|s| s.state_ref).collect();
        let result = redeem_attempt(node, session.as_ref(), &issuer, amount, inputs).await;
        node.unreserve(&spent);

        match result {
            Err(e) if e.is_conflict() && attempt < node.config().max_notary_retries => {
                warn!(attempt, "redeem conflicted, retrying with fresh tokens");
                if let Some(session) = &session {
                    session.send_message(&FlowMessage::Retry { attempt }).await?;
                }
                attempt += 1;
            }
            Err(e) if e.is_conflict() => return Err(FlowError::RetriesExhausted(attempt + 1)),
            other => return other,
        }
    }
}

async fn redeem_attempt(
    node: &Node,
    session: Option<&FlowSession>,
    issuer: &Party,
    amount: u64,
    inputs: Vec<StateAndRef>,
) -> Result<SignedTransaction, FlowError> {
    let total: u64 = inputs.iter().filter_map(|s| s.state.as_token()).map(|t| t.amount).sum();

    let mut builder = TransactionBuilder::new();
    let inputs = inputs.into_iter().map(|s| builder.add_input(s)).collect();
    let mut outputs = Vec::new();
    if total > amount {
        outputs.push(builder.add_output(TokenState::unlocked(node.party().clone(), issuer.clone(), total - amount)));
    }
    builder.add_command(
        TokenCommand::Redeem { inputs, outputs },
        vec![node.keys().public_key(), issuer.owning_key],
    );

    let mut stx = builder.sign(node.keys())?;
    if let Some(session) = session {
        session.send_message(&FlowMessage::ProposeTransaction { tx: stx.clone() }).await?;
        match session.receive_message().await? {
            FlowMessage::Signature { sig } => stx.add_signature(sig),
            FlowMessage::Reject { reason } => return Err(FlowError::CounterpartyRejected(reason)),
            other => {
                return Err(SessionError::Unexpected { expected: "signature", got: other.kind() }.into());
            }
        }
    } else {
        stx.sign_with(node.keys())?;
    }

    let id = node.notarise(&stx).await?;
    if let Some(session) = session {
        session.send_message(&FlowMessage::Finalised { tx_id: id }).await?;
    }
    info!(tx = %id.short(), amount, "tokens redeemed");
    Ok(stx)
}

/// Issuer side of a redemption: check and countersign proposals until one
/// is finalised.
#[instrument(skip_all, fields(issuer = %node.party(), holder = %session.counterparty()))]
pub(crate) async fn cosign_redemption(node: &Node, session: FlowSession) -> Result<(), FlowError> {
    for _ in 0..=node.config().max_notary_retries {
        let stx = match session.receive_message().await? {
            FlowMessage::ProposeTransaction { tx } => tx,
            other => {
                return Err(SessionError::Unexpected { expected: "propose_transaction", got: other.kind() }.into());
            }
        };

        if let Err(e) = check_redemption(node, session.counterparty(), &stx).await {
            session.send_message(&FlowMessage::Reject { reason: e.to_string() }).await?;
            return Err(e);
        }
        let sig = node.keys().sign(&stx.id()?);
        session.send_message(&FlowMessage::Signature { sig }).await?;

        match session.receive_message().await? {
            FlowMessage::Finalised { tx_id } => {
                info!(tx = %tx_id.short(), "redemption cosigned");
                return Ok(());
            }
            FlowMessage::Retry { attempt } => warn!(attempt, "holder retrying redemption"),
            other => {
                return Err(SessionError::Unexpected { expected: "finalised", got: other.kind() }.into());
            }
        }
    }
    Err(FlowError::RetriesExhausted(node.config().max_notary_retries + 1))
}

/// The issuer only ever signs pure redemptions of its own tokens held by
/// the requesting party.
async fn check_redemption(node: &Node, holder: &Party, stx: &SignedTransaction) -> Result<(), FlowError> {
    let ltx = node.verify_proposal(stx).await?;

    ensure(
        ltx.commands
            .iter()
            .all(|c| matches!(c.value, Command::Token(TokenCommand::Redeem { .. }))),
        "only redeem commands may be cosigned",
    )?;
    ensure(
        ltx.inputs.iter().all(|s| {
            s.state
                .as_token()
                .is_some_and(|t| t.issuer == *node.party() && t.holder.as_ref() == Some(holder))
        }),
        "redeemed tokens must be ours and held by the requester",
    )?;
    ensure(ltx.references.is_empty(), "redemption must not reference records")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::testing::TestNet;

    #[tokio::test]
    async fn test_issue_credits_holders() {
        let net = TestNet::new().await;
        let bank = net.bank.party().clone();
        net.bank
            .issue_tokens(&[(net.casino.party().clone(), 400), (net.player.party().clone(), 3)])
            .await
            .unwrap();

        assert_eq!(net.casino.balance(&bank).await, 400);
        assert_eq!(net.player.balance(&bank).await, 3);
    }

    #[tokio::test]
    async fn test_issue_nothing_rejected() {
        let net = TestNet::new().await;
        let err = net.bank.issue_tokens(&[]).await.unwrap_err();
        assert!(err.to_string().contains("issue must produce tokens"), "{}", err);
    }

    #[tokio::test]
    async fn test_redeem_with_issuer_cosign() {
        let net = TestNet::new().await;
        let bank = net.bank.party().clone();
        net.bank.issue_tokens(&[(net.player.party().clone(), 10)]).await.unwrap();

        net.player.redeem_tokens(4, "bank").await.unwrap();
        assert_eq!(net.player.balance(&bank).await, 6);

        net.player.redeem_tokens(6, "bank").await.unwrap();
        assert_eq!(net.player.balance(&bank).await, 0);
    }

    #[tokio::test]
    async fn test_redeem_more_than_held() {
        let net = TestNet::new().await;
        net.bank.issue_tokens(&[(net.player.party().clone(), 2)]).await.unwrap();
        assert!(matches!(
            net.player.redeem_tokens(3, "bank").await,
            Err(FlowError::InsufficientFunds { needed: 3, available: 2 })
        ));
        assert!(matches!(
            net.player.redeem_tokens(0, "bank").await,
            Err(FlowError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_issuer_redeems_own_tokens_locally() {
        let net = TestNet::new().await;
        let bank = net.bank.party().clone();
        net.bank.issue_tokens(&[(bank.clone(), 9)]).await.unwrap();
        net.bank.redeem_tokens(9, "bank").await.unwrap();
        assert_eq!(net.bank.balance(&bank).await, 0);
    }
}
