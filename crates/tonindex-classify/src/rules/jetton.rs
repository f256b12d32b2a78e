//! Jetton (fungible token) transfers, burns and mints.
//!
//! Decoded message fields follow the TEP-74 schema: `amount`, `destination`,
//! `response_destination`, `query_id`, `forward_amount`, `forward_payload`,
//! `custom_payload`, plus `jetton_master` when the decoder resolved it.

use tonindex_core::action::{ActionKind, RawActionFields};

use super::{decoded_str, ActionRule, MatchContext, RuleMatch};
use crate::registry::opcodes;

const TRANSFER_FIELDS: &[&str] = &[
    "query_id",
    "response_destination",
    "custom_payload",
    "forward_payload",
    "forward_amount",
    "comment",
    "is_encrypted_comment",
];

/// `transfer` to the sender's jetton wallet, the `internal_transfer` to the
/// receiver's wallet, and the notification/excesses that follow it.
pub struct JettonTransferRule;

impl ActionRule for JettonTransferRule {
    fn name(&self) -> &str {
        "jetton_transfer"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        if ctx.graph.opcode(anchor) != Some(opcodes::JETTON_TRANSFER) {
            return None;
        }
        let msg = ctx.graph.in_msg(anchor)?;
        let mut raw = RawActionFields {
            source: msg.source.clone(),
            source_secondary: Some(ctx.graph.account(anchor).to_string()),
            destination: msg.field_str("destination"),
            amount: msg.field_str("amount"),
            asset: msg.field_str("jetton_master"),
            ..RawActionFields::default()
        };
        for key in TRANSFER_FIELDS {
            raw.copy_from(&msg.decoded, key);
        }

        let mut nodes: Vec<usize> = ctx.initiator(anchor).into_iter().collect();
        if let Some(receiver_wallet) = ctx.free_child(anchor, opcodes::JETTON_INTERNAL_TRANSFER) {
            raw.destination_secondary = Some(ctx.graph.account(receiver_wallet).to_string());
            if raw.asset.is_none() {
                raw.asset = decoded_str(ctx, receiver_wallet, "jetton_master");
            }
            nodes.push(receiver_wallet);
            nodes.extend(tail(ctx, receiver_wallet));
        }
        Some(RuleMatch::new(ActionKind::JettonTransfer, anchor, raw).with_nodes(nodes))
    }
}

/// Notification and excesses sent by a receiving jetton wallet.
fn tail(ctx: &MatchContext<'_>, wallet: usize) -> Vec<usize> {
    ctx.graph
        .children(wallet)
        .iter()
        .copied()
        .filter(|&c| {
            ctx.is_free(c)
                && matches!(
                    ctx.graph.opcode(c),
                    Some(opcodes::JETTON_NOTIFY) | Some(opcodes::EXCESSES)
                )
        })
        .collect()
}

/// `burn` to the owner's jetton wallet and the `burn_notification` it sends
/// to the master.
pub struct JettonBurnRule;

impl ActionRule for JettonBurnRule {
    fn name(&self) -> &str {
        "jetton_burn"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        if ctx.graph.opcode(anchor) != Some(opcodes::JETTON_BURN) {
            return None;
        }
        let msg = ctx.graph.in_msg(anchor)?;
        let mut raw = RawActionFields {
            source: msg.source.clone(),
            source_secondary: Some(ctx.graph.account(anchor).to_string()),
            amount: msg.field_str("amount"),
            asset: msg.field_str("jetton_master"),
            ..RawActionFields::default()
        };

        let mut nodes: Vec<usize> = ctx.initiator(anchor).into_iter().collect();
        if let Some(master) = ctx.free_child(anchor, opcodes::JETTON_BURN_NOTIFICATION) {
            raw.asset = Some(ctx.graph.account(master).to_string());
            nodes.extend(ctx.free_subtree(master));
        }
        Some(RuleMatch::new(ActionKind::JettonBurn, anchor, raw).with_nodes(nodes))
    }
}

/// An `internal_transfer` that was not preceded by a wallet `transfer`:
/// the jetton master minting to a new or existing wallet.
pub struct JettonMintRule;

impl ActionRule for JettonMintRule {
    fn name(&self) -> &str {
        "jetton_mint"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        if ctx.graph.opcode(anchor) != Some(opcodes::JETTON_INTERNAL_TRANSFER) {
            return None;
        }
        let minter = ctx.graph.parent(anchor);
        if minter.is_some_and(|p| ctx.graph.opcode(p) == Some(opcodes::JETTON_TRANSFER)) {
            return None;
        }
        let msg = ctx.graph.in_msg(anchor)?;
        let notify = ctx.free_child(anchor, opcodes::JETTON_NOTIFY);
        let raw = RawActionFields {
            asset: msg.source.clone(),
            amount: msg.field_str("amount"),
            value: msg.value,
            destination: msg
                .field_str("destination")
                .or_else(|| notify.map(|n| ctx.graph.account(n).to_string())),
            destination_secondary: Some(ctx.graph.account(anchor).to_string()),
            ..RawActionFields::default()
        };

        let mut nodes = Vec::new();
        if let Some(p) = minter.filter(|&p| ctx.is_free(p)) {
            nodes.push(p);
            nodes.extend(ctx.initiator(p));
        }
        nodes.extend(tail(ctx, anchor));
        Some(RuleMatch::new(ActionKind::JettonMint, anchor, raw).with_nodes(nodes))
    }
}
