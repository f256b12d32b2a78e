//! DEX swaps and liquidity provision.
//!
//! A swap reaches a router either as a plain TON message carrying the swap
//! opcode, or as a jetton `transfer_notification` whose forward payload the
//! decoder exposed as `forward_opcode`. Everything from the user's wallet to
//! the router, plus the router's payout tree, is one action.

use serde_json::{json, Value};
use tonindex_core::action::{ActionKind, RawActionFields};

use super::{decoded_str, ActionRule, MatchContext, RuleMatch};
use crate::registry::{opcodes, DexDefinition};

const JETTON_HOPS: &[u32] = &[opcodes::JETTON_TRANSFER, opcodes::JETTON_INTERNAL_TRANSFER];

/// The request opcode a router acted on, looking through jetton notifications.
fn router_opcode(ctx: &MatchContext<'_>, anchor: usize) -> Option<u32> {
    let msg = ctx.graph.in_msg(anchor)?;
    match msg.opcode? {
        opcodes::JETTON_NOTIFY => msg.field_u64("forward_opcode").and_then(|op| u32::try_from(op).ok()),
        op => Some(op),
    }
}

fn is_jetton_notify(ctx: &MatchContext<'_>, anchor: usize) -> bool {
    ctx.graph.opcode(anchor) == Some(opcodes::JETTON_NOTIFY)
}

/// Fill the `in_*` swap leg (or `*_1` liquidity leg) from the router's inbound
/// message and the jetton hops leading to it.
fn incoming_leg(ctx: &MatchContext<'_>, anchor: usize, lead: &[usize]) -> (Option<String>, Option<String>, Option<String>, Option<String>) {
    let msg = ctx.graph.in_msg(anchor);
    let hop = |op: u32| lead.iter().copied().find(|&n| ctx.graph.opcode(n) == Some(op));
    if is_jetton_notify(ctx, anchor) {
        let asset = decoded_str(ctx, anchor, "jetton_master")
            .or_else(|| hop(opcodes::JETTON_INTERNAL_TRANSFER).and_then(|n| decoded_str(ctx, n, "jetton_master")));
        let amount = msg.and_then(|m| m.field_str("amount"));
        let source_wallet = hop(opcodes::JETTON_TRANSFER).map(|n| ctx.graph.account(n).to_string());
        let router_wallet = hop(opcodes::JETTON_INTERNAL_TRANSFER).map(|n| ctx.graph.account(n).to_string());
        (asset, amount, source_wallet, router_wallet)
    } else {
        let amount = msg.and_then(|m| m.field_str("amount").or_else(|| m.value.map(|v| v.to_string())));
        (None, amount, None, None)
    }
}

/// A swap at a registered router.
pub struct DexSwapRule;

impl ActionRule for DexSwapRule {
    fn name(&self) -> &str {
        "dex_swap"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        let dex = ctx.registry.dex_at(ctx.graph.account(anchor))?;
        let op = router_opcode(ctx, anchor)?;
        if !dex.swap_opcodes.contains(&op) {
            return None;
        }

        let lead = ctx.lead_in(anchor, JETTON_HOPS);
        let tree = ctx.free_descendants(anchor);
        let router = ctx.graph.account(anchor).to_string();
        let sender = decoded_str(ctx, anchor, "sender")
            .or_else(|| lead.last().map(|&n| ctx.graph.account(n).to_string()))
            .or_else(|| ctx.sender(anchor));

        let mut raw = RawActionFields {
            source: sender.clone(),
            destination: Some(router.clone()),
            ..RawActionFields::default()
        };
        raw.set("dex", dex.name.as_str());

        let (in_asset, in_amount, in_src_wallet, in_dst_wallet) = incoming_leg(ctx, anchor, &lead);
        raw.asset = in_asset.clone();
        let mut set_opt = |key: &str, value: Option<String>| {
            if let Some(v) = value {
                raw.set(key, v);
            }
        };
        set_opt("in_asset", in_asset);
        set_opt("in_amount", in_amount);
        set_opt("in_source", sender.clone());
        set_opt("in_destination", Some(router));
        set_opt("in_source_jetton_wallet", in_src_wallet);
        set_opt("in_destination_jetton_wallet", in_dst_wallet);

        let out = outgoing_leg(ctx, dex, &tree);
        set_opt("out_asset", out.asset.clone());
        set_opt("out_amount", out.amount);
        set_opt("out_source", out.source);
        set_opt("out_destination", out.destination.or(sender));
        set_opt("out_source_jetton_wallet", out.source_wallet);
        set_opt("out_destination_jetton_wallet", out.destination_wallet);
        set_opt("min_out_amount", decoded_str(ctx, anchor, "min_out"));
        raw.asset2 = out.asset;

        let peers = peer_swaps(ctx, dex, &tree);
        if !peers.is_empty() {
            raw.set("peer_swaps", Value::Array(peers));
        }
        Some(RuleMatch::new(ActionKind::JettonSwap, anchor, raw).with_nodes(lead.into_iter().chain(tree)))
    }
}

#[derive(Default)]
struct OutLeg {
    asset: Option<String>,
    amount: Option<String>,
    source: Option<String>,
    destination: Option<String>,
    source_wallet: Option<String>,
    destination_wallet: Option<String>,
}

/// The last jetton `internal_transfer` in the payout tree, or failing that
/// the router's TON payout.
fn outgoing_leg(ctx: &MatchContext<'_>, dex: &DexDefinition, tree: &[usize]) -> OutLeg {
    let jetton = tree
        .iter()
        .rev()
        .copied()
        .find(|&n| ctx.graph.opcode(n) == Some(opcodes::JETTON_INTERNAL_TRANSFER));
    if let Some(wallet) = jetton {
        let notify = ctx.graph.child_with_opcode(wallet, opcodes::JETTON_NOTIFY);
        return OutLeg {
            asset: decoded_str(ctx, wallet, "jetton_master"),
            amount: decoded_str(ctx, wallet, "amount"),
            source: ctx.graph.parent(wallet).and_then(|p| ctx.sender(p)),
            destination: notify
                .map(|n| ctx.graph.account(n).to_string())
                .or_else(|| decoded_str(ctx, wallet, "destination")),
            source_wallet: ctx.sender(wallet),
            destination_wallet: Some(ctx.graph.account(wallet).to_string()),
        };
    }
    let payout = tree
        .iter()
        .copied()
        .find(|&n| ctx.graph.opcode(n).is_some_and(|op| dex.payout_opcodes.contains(&op)));
    match payout {
        Some(p) => OutLeg {
            amount: ctx.graph.in_msg(p).and_then(|m| m.value).map(|v| v.to_string()),
            source: ctx.sender(p),
            destination: Some(ctx.graph.account(p).to_string()),
            ..OutLeg::default()
        },
        None => OutLeg::default(),
    }
}

/// One entry per pool-level hop of a multi-hop swap.
fn peer_swaps(ctx: &MatchContext<'_>, dex: &DexDefinition, tree: &[usize]) -> Vec<Value> {
    tree.iter()
        .copied()
        .filter(|&n| ctx.graph.opcode(n).is_some_and(|op| dex.pool_swap_opcodes.contains(&op)))
        .map(|n| {
            json!({
                "asset_in": decoded_str(ctx, n, "asset_in"),
                "amount_in": decoded_str(ctx, n, "amount_in"),
                "asset_out": decoded_str(ctx, n, "asset_out"),
                "amount_out": decoded_str(ctx, n, "amount_out"),
            })
        })
        .collect()
}

/// Liquidity deposits and withdrawals at a registered router or pool.
pub struct DexLiquidityRule;

impl ActionRule for DexLiquidityRule {
    fn name(&self) -> &str {
        "dex_liquidity"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        let dex = ctx.registry.dex_at(ctx.graph.account(anchor))?;
        let op = router_opcode(ctx, anchor)?;
        let kind = if dex.deposit_opcodes.contains(&op) {
            ActionKind::DexDepositLiquidity
        } else if dex.withdraw_opcodes.contains(&op) {
            ActionKind::DexWithdrawLiquidity
        } else {
            return None;
        };

        let lead = ctx.lead_in(anchor, JETTON_HOPS);
        let tree = ctx.free_descendants(anchor);
        let mut raw = RawActionFields {
            source: decoded_str(ctx, anchor, "sender")
                .or_else(|| lead.last().map(|&n| ctx.graph.account(n).to_string()))
                .or_else(|| ctx.sender(anchor)),
            destination: Some(ctx.graph.account(anchor).to_string()),
            destination_secondary: decoded_str(ctx, anchor, "liquidity_account"),
            ..RawActionFields::default()
        };
        raw.set("dex", dex.name.as_str());

        let (asset, amount, source_wallet, _) = incoming_leg(ctx, anchor, &lead);
        for (key, value) in [("asset_1", asset), ("amount_1", amount), ("user_jetton_wallet_1", source_wallet)] {
            if let Some(v) = value {
                raw.set(key, v);
            }
        }
        if let Some(decoded) = ctx.decoded(anchor) {
            for key in ["asset_2", "amount_2", "lp_tokens_minted", "lp_tokens_burnt", "tick_lower", "tick_upper"] {
                raw.copy_from(decoded, key);
            }
        }
        Some(RuleMatch::new(kind, anchor, raw).with_nodes(lead.into_iter().chain(tree)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TraceGraph;
    use crate::registry::ProtocolRegistry;
    use crate::testing::TraceBuilder;

    const TONCO: &str = "0:bffadd270a738531da7b13ba8fc403826c2586173f9ede9c316fab53bc59ac86";
    const STONFI: &str = "0:779dcc815138d9500e449c5291e7f12738c23d575b5310000f6a253bd607384e";

    fn run(trace: &tonindex_core::Trace, anchor: usize) -> Option<RuleMatch> {
        let graph = TraceGraph::new(trace);
        let reg = ProtocolRegistry::mainnet();
        let claimed = vec![false; graph.len()];
        let ctx = MatchContext::new(&graph, &reg, &claimed);
        DexSwapRule.try_match(&ctx, anchor)
    }

    /// user wallet → user jetton wallet → router jetton wallet → router →
    /// router jetton wallet (out) → user out wallet → user
    fn jetton_swap(router: &str, swap_op: u32) -> (tonindex_core::Trace, usize) {
        let mut b = TraceBuilder::new();
        let w = b.external("0:user");
        let ujw = b.call(w, "0:user_usdt", Some(opcodes::JETTON_TRANSFER), 1);
        let rjw = b.call_with(ujw, "0:router_usdt", 1, |m| {
            m.with_opcode(opcodes::JETTON_INTERNAL_TRANSFER).with_field("jetton_master", "0:usdt")
        });
        let r = b.call_with(rjw, router, 1, |m| {
            m.with_opcode(opcodes::JETTON_NOTIFY)
                .with_field("amount", "1000")
                .with_field("forward_opcode", swap_op)
                .with_field("min_out", "990")
        });
        let rjw_out = b.call(r, "0:router_not", Some(opcodes::JETTON_TRANSFER), 1);
        let ujw_out = b.call_with(rjw_out, "0:user_not", 1, |m| {
            m.with_opcode(opcodes::JETTON_INTERNAL_TRANSFER)
                .with_field("amount", "995")
                .with_field("jetton_master", "0:not")
        });
        b.call(ujw_out, "0:user", Some(opcodes::JETTON_NOTIFY), 1);
        (b.finish(), r)
    }

    #[test]
    fn jetton_to_jetton_swap_covers_all_hops() {
        let (trace, router) = jetton_swap(STONFI, 0x25938561);
        let m = run(&trace, router).unwrap();
        assert_eq!(m.kind, ActionKind::JettonSwap);
        let mut nodes = m.nodes.clone();
        nodes.sort();
        assert_eq!(nodes, (0..trace.transactions.len()).collect::<Vec<_>>());
        assert_eq!(m.raw.str("dex").as_deref(), Some("stonfi"));
        assert_eq!(m.raw.source.as_deref(), Some("0:user"));
        assert_eq!(m.raw.asset.as_deref(), Some("0:usdt"));
        assert_eq!(m.raw.asset2.as_deref(), Some("0:not"));
        assert_eq!(m.raw.str("in_amount").as_deref(), Some("1000"));
        assert_eq!(m.raw.str("out_amount").as_deref(), Some("995"));
        assert_eq!(m.raw.str("out_destination").as_deref(), Some("0:user"));
        assert_eq!(m.raw.str("in_source_jetton_wallet").as_deref(), Some("0:user_usdt"));
        assert_eq!(m.raw.str("out_destination_jetton_wallet").as_deref(), Some("0:user_not"));
    }

    #[test]
    fn tonco_swap_keeps_min_out() {
        let (trace, router) = jetton_swap(TONCO, 0xa7fb58f8);
        let m = run(&trace, router).unwrap();
        assert_eq!(m.raw.str("dex").as_deref(), Some("tonco"));
        assert_eq!(m.raw.str("min_out_amount").as_deref(), Some("990"));
    }

    #[test]
    fn wrong_opcode_at_router_is_not_a_swap() {
        let (trace, router) = jetton_swap(STONFI, 0xa7fb58f8);
        assert!(run(&trace, router).is_none());
    }
}
