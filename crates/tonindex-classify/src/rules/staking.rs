//! Liquid-staking pools and validator elections.

use tonindex_core::action::{ActionKind, RawActionFields};

use super::{decoded_str, ActionRule, MatchContext, RuleMatch};
use crate::registry::{opcodes, StakingProvider};

/// Deposits to and withdrawals from a registered staking pool.
pub struct StakingRule;

impl ActionRule for StakingRule {
    fn name(&self) -> &str {
        "staking"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        let pool = ctx.graph.account(anchor);
        let provider = ctx.registry.staking_at(pool)?;
        let msg = ctx.graph.in_msg(anchor)?;
        if !msg.is_internal() || msg.bounced {
            return None;
        }
        let comment = match msg.opcode {
            None | Some(opcodes::TEXT_COMMENT) => msg.field_str("comment"),
            _ => None,
        };
        let hit = |ops: &[u32], comments: &[String]| {
            msg.opcode.is_some_and(|op| ops.contains(&op))
                || comment.as_ref().is_some_and(|c| comments.contains(c))
        };

        if hit(&provider.deposit_opcodes, &provider.deposit_comments) {
            Some(deposit(ctx, anchor, provider))
        } else if hit(&provider.withdraw_opcodes, &provider.withdraw_comments) {
            Some(withdrawal(ctx, anchor, provider))
        } else {
            None
        }
    }
}

fn pool_fields(ctx: &MatchContext<'_>, anchor: usize, provider: &StakingProvider) -> RawActionFields {
    let mut raw = RawActionFields {
        source: decoded_str(ctx, anchor, "sender").or_else(|| ctx.sender(anchor)),
        destination: Some(ctx.graph.account(anchor).to_string()),
        asset: provider.asset.clone(),
        ..RawActionFields::default()
    };
    raw.set("provider", provider.provider.as_str());
    raw
}

fn deposit(ctx: &MatchContext<'_>, anchor: usize, provider: &StakingProvider) -> RuleMatch {
    let mut raw = pool_fields(ctx, anchor, provider);
    raw.amount = ctx
        .graph
        .in_msg(anchor)
        .and_then(|m| m.field_str("amount").or_else(|| m.value.map(|v| v.to_string())));

    let descendants = ctx.free_descendants(anchor);
    let minted = descendants
        .iter()
        .copied()
        .find(|&n| ctx.graph.opcode(n) == Some(opcodes::JETTON_INTERNAL_TRANSFER))
        .and_then(|n| decoded_str(ctx, n, "amount"));
    if let Some(minted) = minted {
        raw.set("tokens_minted", minted);
    }
    let lead = ctx.initiator(anchor);
    RuleMatch::new(ActionKind::StakeDeposit, anchor, raw).with_nodes(lead.into_iter().chain(descendants))
}

/// A burn of pool tokens (or a withdraw comment). Pools that pay out at
/// once make it a withdrawal; pools that deploy a payout NFT, or pay later,
/// make it a withdrawal request.
fn withdrawal(ctx: &MatchContext<'_>, anchor: usize, provider: &StakingProvider) -> RuleMatch {
    let mut raw = pool_fields(ctx, anchor, provider);
    let burnt = decoded_str(ctx, anchor, "amount");
    let descendants = ctx.free_descendants(anchor);

    let payout_nft = descendants
        .iter()
        .copied()
        .find(|&n| ctx.graph.in_msg(n).is_some_and(|m| m.init_state.is_some()));
    let payout = descendants.iter().copied().find(|&n| {
        raw.source.as_deref() == Some(ctx.graph.account(n))
            && ctx.graph.in_msg(n).is_some_and(|m| !m.bounced && m.value.unwrap_or(0) > 0)
    });

    let kind = match (payout_nft, payout) {
        (None, Some(p)) => {
            raw.amount = ctx.graph.in_msg(p).and_then(|m| m.value).map(|v| v.to_string());
            if let Some(burnt) = burnt {
                raw.set("tokens_burnt", burnt);
            }
            ActionKind::StakeWithdrawal
        }
        (nft, _) => {
            raw.amount = burnt;
            if let Some(nft) = nft {
                raw.set("payout_nft", ctx.graph.account(nft));
            }
            ActionKind::StakeWithdrawalRequest
        }
    };
    let lead = ctx.lead_in(anchor, &[opcodes::JETTON_BURN]);
    RuleMatch::new(kind, anchor, raw).with_nodes(lead.into_iter().chain(descendants))
}

/// `new_stake` and `recover_stake` sent to the elector, with the elector's
/// reply.
pub struct ElectionRule;

impl ActionRule for ElectionRule {
    fn name(&self) -> &str {
        "election"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        if !ctx.registry.is_elector(ctx.graph.account(anchor)) {
            return None;
        }
        let msg = ctx.graph.in_msg(anchor)?;
        let (kind, reply) = match msg.opcode? {
            opcodes::ELECTOR_NEW_STAKE => (
                ActionKind::ElectionDeposit,
                ctx.free_child(anchor, opcodes::ELECTOR_NEW_STAKE_CONFIRMATION),
            ),
            opcodes::ELECTOR_RECOVER_STAKE => (
                ActionKind::ElectionRecover,
                ctx.free_child(anchor, opcodes::ELECTOR_RECOVER_STAKE_RESPONSE),
            ),
            _ => return None,
        };
        let amount = match kind {
            ActionKind::ElectionRecover => reply.and_then(|r| ctx.graph.in_msg(r)).and_then(|m| m.value),
            _ => msg.value,
        };
        let raw = RawActionFields {
            source: msg.source.clone(),
            destination: Some(ctx.graph.account(anchor).to_string()),
            amount: amount.map(|v| v.to_string()),
            ..RawActionFields::default()
        };
        let lead = ctx.initiator(anchor);
        Some(RuleMatch::new(kind, anchor, raw).with_nodes(lead.into_iter().chain(reply)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TraceGraph;
    use crate::registry::ProtocolRegistry;
    use crate::testing::TraceBuilder;

    const POOL: &str = "0:a45b17f28409229b78360e3290420f13e4fe20f90d7e2bf8c4ac6703259e22fa";
    const ELECTOR: &str = "-1:3333333333333333333333333333333333333333333333333333333333333333";

    fn run(rule: &dyn ActionRule, trace: &tonindex_core::Trace, anchor: usize) -> Option<RuleMatch> {
        let graph = TraceGraph::new(trace);
        let reg = ProtocolRegistry::mainnet();
        let claimed = vec![false; graph.len()];
        let ctx = MatchContext::new(&graph, &reg, &claimed);
        rule.try_match(&ctx, anchor)
    }

    #[test]
    fn tonstakers_deposit_mints_tokens() {
        let mut b = TraceBuilder::new();
        let w = b.external("0:user");
        let pool = b.call(w, POOL, Some(0x47d54391), 10_000_000_000);
        let _mint = b.call_with(pool, "0:user_tston", 1, |m| {
            m.with_opcode(opcodes::JETTON_INTERNAL_TRANSFER).with_field("amount", "9500000000")
        });
        let trace = b.finish();

        let m = run(&StakingRule, &trace, pool).unwrap();
        assert_eq!(m.kind, ActionKind::StakeDeposit);
        assert_eq!(m.raw.source.as_deref(), Some("0:user"));
        assert_eq!(m.raw.amount.as_deref(), Some("10000000000"));
        assert_eq!(m.raw.str("tokens_minted").as_deref(), Some("9500000000"));
        assert_eq!(m.raw.str("provider").as_deref(), Some("tonstakers"));
        assert_eq!(m.nodes.len(), 3);
    }

    fn burn_trace(instant: bool) -> (tonindex_core::Trace, usize) {
        let mut b = TraceBuilder::new();
        let w = b.external("0:user");
        let jw = b.call(w, "0:user_tston", Some(opcodes::JETTON_BURN), 1);
        let pool = b.call_with(jw, POOL, 1, |m| {
            m.with_opcode(opcodes::JETTON_BURN_NOTIFICATION)
                .with_field("amount", "3000")
                .with_field("sender", "0:user")
        });
        if instant {
            b.call(pool, "0:user", None, 3100);
        } else {
            b.call_with(pool, "0:payout_nft", 1, |mut m| {
                m.init_state = Some(tonindex_core::types::ContentBlob {
                    hash: "nft".into(),
                    boc: String::new(),
                });
                m
            });
        }
        (b.finish(), pool)
    }

    #[test]
    fn burn_with_instant_payout_is_withdrawal() {
        let (trace, pool) = burn_trace(true);
        let m = run(&StakingRule, &trace, pool).unwrap();
        assert_eq!(m.kind, ActionKind::StakeWithdrawal);
        assert_eq!(m.raw.amount.as_deref(), Some("3100"));
        assert_eq!(m.raw.str("tokens_burnt").as_deref(), Some("3000"));
        assert_eq!(m.nodes.len(), 4);
    }

    #[test]
    fn burn_with_payout_nft_is_request() {
        let (trace, pool) = burn_trace(false);
        let m = run(&StakingRule, &trace, pool).unwrap();
        assert_eq!(m.kind, ActionKind::StakeWithdrawalRequest);
        assert_eq!(m.raw.amount.as_deref(), Some("3000"));
        assert_eq!(m.raw.str("payout_nft").as_deref(), Some("0:payout_nft"));
    }

    #[test]
    fn elector_recover_takes_amount_from_response() {
        let mut b = TraceBuilder::new();
        let w = b.external("-1:validator");
        let elector = b.call(w, ELECTOR, Some(opcodes::ELECTOR_RECOVER_STAKE), 1_000_000_000);
        let reply = b.call(elector, "-1:validator", Some(opcodes::ELECTOR_RECOVER_STAKE_RESPONSE), 500_000_000_000);
        let trace = b.finish();

        let m = run(&ElectionRule, &trace, elector).unwrap();
        assert_eq!(m.kind, ActionKind::ElectionRecover);
        assert_eq!(m.raw.amount.as_deref(), Some("500000000000"));
        assert_eq!(m.nodes, vec![elector, w, reply]);
    }
}
