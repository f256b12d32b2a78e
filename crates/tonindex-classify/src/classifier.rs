//! Trace → actions.
//!
//! Every transaction of a trace ends up in exactly one action: rules claim
//! transactions in priority order, and whatever is left becomes a
//! `tick_tock` or a diagnostic `unknown` action of its own.

use std::collections::HashSet;
use std::sync::Arc;

use rayon::prelude::*;
use tonindex_core::action::{Action, ActionDetails, ActionKind, RawActionFields};
use tonindex_core::Trace;
use tracing::{debug, trace as trace_log};

use crate::graph::TraceGraph;
use crate::registry::ProtocolRegistry;
use crate::rules::{message_fields, MatchContext, RuleMatch, RuleTable};

pub struct Classifier {
    registry: Arc<ProtocolRegistry>,
    rules: RuleTable,
}

impl Classifier {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Self::with_rules(registry, RuleTable::standard())
    }

    pub fn with_rules(registry: Arc<ProtocolRegistry>, rules: RuleTable) -> Self {
        Self { registry, rules }
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Classify one finalized trace. Swapped gas figures on its
    /// transactions are repaired in place first.
    pub fn classify(&self, trace: &mut Trace) -> Vec<Action> {
        let repaired = repair_gas(trace);
        if repaired > 0 {
            debug!(trace_id = %trace.id, repaired, "repaired swapped gas figures");
        }

        let graph = TraceGraph::new(trace);
        let mut claimed = vec![false; graph.len()];
        let mut matches: Vec<RuleMatch> = Vec::new();

        for rule in self.rules.rules() {
            for anchor in 0..graph.len() {
                if claimed[anchor] {
                    continue;
                }
                let found = {
                    let ctx = MatchContext::new(&graph, &self.registry, &claimed);
                    rule.try_match(&ctx, anchor)
                };
                let Some(mut found) = found else { continue };
                found.nodes.sort_unstable();
                found.nodes.dedup();
                if found.nodes.iter().any(|&n| n >= graph.len() || claimed[n]) {
                    trace_log!(trace_id = %trace.id, rule = rule.name(), anchor, "match overlaps claimed transactions");
                    continue;
                }
                for &n in &found.nodes {
                    claimed[n] = true;
                }
                matches.push(found);
            }
        }

        for idx in 0..graph.len() {
            if !claimed[idx] {
                matches.push(leftover(&graph, idx));
            }
        }

        matches.sort_by_key(|m| graph.tx(m.nodes[0]).tx.lt);
        let actions: Vec<Action> = matches
            .into_iter()
            .enumerate()
            .map(|(pos, m)| self.build_action(trace, &graph, pos as u32, m))
            .collect();

        let unknown = actions.iter().filter(|a| a.kind == ActionKind::Unknown).count();
        debug!(
            trace_id = %trace.id,
            state = %trace.state,
            transactions = trace.len(),
            actions = actions.len(),
            unknown,
            "classified trace"
        );
        actions
    }

    /// Classify a batch of traces on the rayon pool. Output order follows input.
    pub fn classify_all(&self, traces: &mut [Trace]) -> Vec<Vec<Action>> {
        traces.par_iter_mut().map(|t| self.classify(t)).collect()
    }

    fn build_action(&self, trace: &Trace, graph: &TraceGraph<'_>, position: u32, m: RuleMatch) -> Action {
        let txs: Vec<_> = m.nodes.iter().map(|&n| &graph.tx(n).tx).collect();
        let details = ActionDetails::from_raw(m.kind, &m.raw, self.registry.as_ref());
        let mut seen = HashSet::new();
        let accounts = txs
            .iter()
            .filter(|tx| seen.insert(tx.account.as_str()))
            .map(|tx| tx.account.clone())
            .collect();

        Action {
            trace_id: trace.id.clone(),
            action_id: position,
            kind: details.kind(),
            details,
            tx_hashes: txs.iter().map(|tx| tx.hash.clone()).collect(),
            accounts,
            start_lt: txs.iter().map(|tx| tx.lt).min().unwrap_or(0),
            end_lt: txs.iter().map(|tx| tx.lt).max().unwrap_or(0),
            start_utime: txs.iter().map(|tx| tx.now).min().unwrap_or(0),
            end_utime: txs.iter().map(|tx| tx.now).max().unwrap_or(0),
            success: graph.tx(m.anchor).tx.is_success(),
            trace_end_lt: trace.end_lt,
            trace_end_utime: trace.end_utime,
            trace_mc_seqno_end: trace.end_mc_seqno,
            trace_external_hash: trace.external_hash.clone(),
        }
    }
}

/// Swap gas fees and gas used back wherever an upstream phase stored them
/// the wrong way round. Returns how many transactions were repaired.
pub fn repair_gas(trace: &mut Trace) -> usize {
    trace
        .transactions
        .iter_mut()
        .map(|t| t.tx.repair_gas())
        .filter(|&repaired| repaired)
        .count()
}

/// A transaction no rule claimed.
fn leftover(graph: &TraceGraph<'_>, idx: usize) -> RuleMatch {
    let data = graph.tx(idx);
    if data.tx.is_tick_tock() {
        let raw = RawActionFields {
            destination: Some(data.tx.account.clone()),
            ..RawActionFields::default()
        };
        return RuleMatch::new(ActionKind::TickTock, idx, raw);
    }
    let mut raw = match &data.in_msg {
        Some(msg) => message_fields(msg, &data.tx.account),
        None => RawActionFields {
            destination: Some(data.tx.account.clone()),
            ..RawActionFields::default()
        },
    };
    raw.set("error", format!("no rule matched transaction {}", data.tx.hash));
    if let Some(msg) = &data.in_msg {
        for (key, value) in &msg.decoded {
            raw.fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    RuleMatch::new(ActionKind::Unknown, idx, raw)
}

/// Check that `actions` cover every transaction of `trace` exactly once.
pub fn verify_coverage(trace: &Trace, actions: &[Action]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for action in actions {
        for hash in &action.tx_hashes {
            if !seen.insert(hash.as_str()) {
                return Err(format!("transaction {hash} covered twice in trace {}", trace.id));
            }
        }
    }
    for hash in &trace.tx_hashes() {
        if !seen.remove(hash.as_str()) {
            return Err(format!("transaction {hash} not covered in trace {}", trace.id));
        }
    }
    match seen.into_iter().next() {
        Some(extra) => Err(format!("action references foreign transaction {extra} in trace {}", trace.id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::opcodes;
    use crate::testing::{chain, TraceBuilder};
    use tonindex_core::types::ComputePhase;
    use tonindex_core::ActionDetails as D;

    fn classifier() -> Classifier {
        Classifier::new(Arc::new(ProtocolRegistry::mainnet()))
    }

    #[test]
    fn jetton_transfer_then_unknown_hop() {
        let mut trace = chain(&[None, Some(opcodes::JETTON_TRANSFER), Some(0xdeadbeef)]);
        let actions = classifier().classify(&mut trace);
        verify_coverage(&trace, &actions).unwrap();

        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].kind, ActionKind::JettonTransfer);
        assert_eq!(actions[0].tx_hashes, vec!["tx0", "tx1"]);
        assert_eq!(actions[0].action_id, 0);
        assert_eq!(actions[1].kind, ActionKind::Unknown);
        assert_eq!(actions[1].tx_hashes, vec!["tx2"]);
        assert_eq!(actions[1].action_id, 1);
        match &actions[1].details {
            D::Unknown(u) => {
                assert_eq!(u.error, "no rule matched transaction tx2");
                assert_eq!(u.raw.opcode, Some(0xdeadbeef));
            }
            other => panic!("expected unknown details, got {other:?}"),
        }
        assert!(actions.iter().all(|a| a.trace_id == "ext0"));
        assert_eq!(actions[0].trace_external_hash.as_deref(), Some("ext0"));
    }

    #[test]
    fn swapped_gas_is_repaired_before_classification() {
        let mut b = TraceBuilder::new();
        let w = b.external("0:w");
        b.tx_mut(w).tx.descr.compute = Some(ComputePhase {
            gas_fees: 100,
            gas_used: 500,
            ..ComputePhase::default()
        });
        let mut trace = b.finish();

        let c = classifier();
        c.classify(&mut trace);
        let compute = trace.transactions[0].tx.descr.compute.clone().unwrap();
        assert_eq!((compute.gas_fees, compute.gas_used), (500, 100));

        // idempotent
        c.classify(&mut trace);
        let compute = trace.transactions[0].tx.descr.compute.clone().unwrap();
        assert_eq!((compute.gas_fees, compute.gas_used), (500, 100));
    }

    #[test]
    fn lone_tick_tock() {
        let mut b = TraceBuilder::new();
        b.tick_tock("-1:5555555555555555555555555555555555555555555555555555555555555555");
        let mut trace = b.finish();
        let actions = classifier().classify(&mut trace);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::TickTock);
        assert_eq!(actions[0].details, D::TickTock);
    }

    #[test]
    fn fan_out_wallet_covers_each_transfer_once() {
        let mut b = TraceBuilder::new();
        let w = b.external("0:w");
        let a = b.call(w, "0:a", None, 10);
        let jw = b.call(w, "0:jw", Some(opcodes::JETTON_TRANSFER), 10);
        b.call(jw, "0:rjw", Some(opcodes::JETTON_INTERNAL_TRANSFER), 10);
        b.call(a, "0:b", Some(0x12345678), 10);
        let mut trace = b.finish();

        let actions = classifier().classify(&mut trace);
        verify_coverage(&trace, &actions).unwrap();
        let kinds: Vec<_> = actions.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActionKind::JettonTransfer, ActionKind::TonTransfer, ActionKind::Unknown]);
        // the wallet transaction goes to the higher-priority rule
        assert_eq!(actions[0].tx_hashes, vec!["tx0", "tx2", "tx3"]);
        assert_eq!(actions[1].tx_hashes, vec!["tx1"]);
        assert_eq!(actions[2].tx_hashes, vec!["tx4"]);
    }

    #[test]
    fn extra_currency_transfer_is_reclassified() {
        let mut b = TraceBuilder::new();
        let w = b.external("0:w");
        b.call_with(w, "0:dst", 1, |mut m| {
            m.extra_currencies.insert(100, "5000".into());
            m
        });
        let mut trace = b.finish();
        let actions = classifier().classify(&mut trace);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::ExtraCurrencyTransfer);
    }

    #[test]
    fn tonco_swap_subtype() {
        let router = "0:bffadd270a738531da7b13ba8fc403826c2586173f9ede9c316fab53bc59ac86";
        let mut b = TraceBuilder::new();
        let w = b.external("0:user");
        let jw = b.call(w, "0:user_usdt", Some(opcodes::JETTON_TRANSFER), 1);
        let rjw = b.call(jw, "0:router_usdt", Some(opcodes::JETTON_INTERNAL_TRANSFER), 1);
        b.call_with(rjw, router, 1, |m| {
            m.with_opcode(opcodes::JETTON_NOTIFY)
                .with_field("forward_opcode", 0xa7fb58f8u32)
                .with_field("min_out", "42")
        });
        let mut trace = b.finish();

        let actions = classifier().classify(&mut trace);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::JettonSwap);
        match &actions[0].details {
            D::ToncoJettonSwap(d) => assert_eq!(d.min_out_amount.as_deref(), Some("42")),
            other => panic!("expected tonco swap, got {other:?}"),
        }
    }

    #[test]
    fn tonstakers_request_reports_tokens_burnt() {
        let pool = "0:a45b17f28409229b78360e3290420f13e4fe20f90d7e2bf8c4ac6703259e22fa";
        let mut b = TraceBuilder::new();
        let w = b.external("0:user");
        let jw = b.call_with(w, "0:user_tston", 1, |m| {
            m.with_opcode(opcodes::JETTON_BURN).with_field("amount", "700")
        });
        b.call_with(jw, pool, 1, |m| {
            m.with_opcode(opcodes::JETTON_BURN_NOTIFICATION).with_field("amount", "700")
        });
        let mut trace = b.finish();

        let actions = classifier().classify(&mut trace);
        assert_eq!(actions.len(), 1, "burn belongs to the staking action, not a jetton_burn");
        match &actions[0].details {
            D::StakeWithdrawalRequest(d) => {
                assert_eq!(d.provider.as_deref(), Some("tonstakers"));
                assert_eq!(d.tokens_burnt.as_deref(), Some("700"));
            }
            other => panic!("expected withdrawal request, got {other:?}"),
        }
    }

    #[test]
    fn evaa_liquidate_resolves_asset() {
        let evaa = "0:bcad466a47fa565750729565253cd073ca24d856804499090c2100d95c809f9e";
        let mut b = TraceBuilder::new();
        let w = b.external("0:liquidator");
        b.call_with(w, evaa, 1, |m| {
            m.with_opcode(0x3).with_field(
                "asset_id",
                "11876925370864614464799087627157805050745321306404563164673853337929163193738",
            )
        });
        let mut trace = b.finish();

        let actions = classifier().classify(&mut trace);
        match &actions[0].details {
            D::EvaaLiquidate(d) => {
                assert!(d.is_known_asset);
                assert_eq!(
                    d.asset.as_deref(),
                    Some("0:0000000000000000000000000000000000000000000000000000000000000000")
                );
            }
            other => panic!("expected evaa liquidate, got {other:?}"),
        }
    }

    #[test]
    fn classify_all_keeps_order_and_covers_everything() {
        let mut traces = vec![
            chain(&[None, Some(opcodes::JETTON_TRANSFER)]),
            chain(&[None, None, Some(0xdeadbeef), Some(0xfeedface)]),
        ];
        let out = classifier().classify_all(&mut traces);
        assert_eq!(out.len(), 2);
        for (trace, actions) in traces.iter().zip(&out) {
            verify_coverage(trace, actions).unwrap();
        }
        assert_eq!(out[1].iter().filter(|a| a.kind == ActionKind::Unknown).count(), 2);
    }

    #[test]
    fn coverage_check_detects_gaps_and_duplicates() {
        let mut trace = chain(&[None, None]);
        let mut actions = classifier().classify(&mut trace);
        verify_coverage(&trace, &actions).unwrap();

        actions[0].tx_hashes.push("tx1".into());
        assert!(verify_coverage(&trace, &actions).unwrap_err().contains("twice"));
        actions[0].tx_hashes = vec!["tx0".into()];
        assert!(verify_coverage(&trace, &actions).unwrap_err().contains("not covered"));
    }
}
