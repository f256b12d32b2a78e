//! Classification rules and the priority table that orders them.
//!
//! A rule looks at one anchor transaction and either declines or claims a
//! set of transactions (the anchor plus whatever leads into and out of it)
//! as one action. The classifier tries rules in table order; within a rule,
//! anchors are tried in logical-time order. A match that touches a
//! transaction already claimed by an earlier match is discarded.

mod dex;
mod generic;
mod jetton;
mod nft;
mod staking;

use serde_json::{Map, Value};
use tonindex_core::action::{ActionKind, RawActionFields};
use tonindex_core::types::Message;

use crate::graph::TraceGraph;
use crate::registry::ProtocolRegistry;

pub use dex::{DexLiquidityRule, DexSwapRule};
pub use generic::{CallContractRule, ContractDeployRule, OpcodeTableRule, TickTockRule, TonTransferRule};
pub use jetton::{JettonBurnRule, JettonMintRule, JettonTransferRule};
pub use nft::{DnsRule, NftDiscoveryRule, NftMintRule, NftTransferRule};
pub use staking::{ElectionRule, StakingRule};

/// Result of a successful rule match.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub kind: ActionKind,
    pub raw: RawActionFields,
    /// Transaction whose outcome decides the action's `success` flag.
    pub anchor: usize,
    /// Every transaction the action covers, anchor included.
    pub nodes: Vec<usize>,
}

impl RuleMatch {
    pub fn new(kind: ActionKind, anchor: usize, raw: RawActionFields) -> Self {
        Self {
            kind,
            raw,
            anchor,
            nodes: vec![anchor],
        }
    }

    pub fn with_nodes(mut self, nodes: impl IntoIterator<Item = usize>) -> Self {
        self.nodes.extend(nodes);
        self
    }
}

/// What a rule can see while matching: the trace graph, the registry and
/// which transactions earlier matches already claimed.
pub struct MatchContext<'a> {
    pub graph: &'a TraceGraph<'a>,
    pub registry: &'a ProtocolRegistry,
    claimed: &'a [bool],
}

impl<'a> MatchContext<'a> {
    pub fn new(graph: &'a TraceGraph<'a>, registry: &'a ProtocolRegistry, claimed: &'a [bool]) -> Self {
        Self {
            graph,
            registry,
            claimed,
        }
    }

    pub fn is_free(&self, idx: usize) -> bool {
        !self.claimed[idx]
    }

    /// Unclaimed ancestors leading into `anchor`, nearest first: parents
    /// created by one of `opcodes`, then the external-message transaction
    /// that started the chain, if any.
    pub fn lead_in(&self, anchor: usize, opcodes: &[u32]) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = self.graph.parent(anchor);
        while let Some(p) = cursor {
            if !self.is_free(p) {
                break;
            }
            if self.graph.is_external_root(p) {
                out.push(p);
                break;
            }
            match self.graph.opcode(p) {
                Some(op) if opcodes.contains(&op) => out.push(p),
                _ => break,
            }
            cursor = self.graph.parent(p);
        }
        out
    }

    /// The unclaimed wallet transaction that sent the anchor's message.
    pub fn initiator(&self, anchor: usize) -> Option<usize> {
        self.graph
            .parent(anchor)
            .filter(|&p| self.is_free(p) && self.graph.is_external_root(p))
    }

    /// `idx` and its descendants, not descending through claimed nodes.
    pub fn free_subtree(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![idx];
        while let Some(node) = stack.pop() {
            if !self.is_free(node) {
                continue;
            }
            out.push(node);
            stack.extend(self.graph.children(node).iter().rev().copied());
        }
        out
    }

    /// Free descendants of `idx` (excluding `idx`).
    pub fn free_descendants(&self, idx: usize) -> Vec<usize> {
        let mut all = self.free_subtree(idx);
        all.retain(|&n| n != idx);
        all
    }

    pub fn decoded(&self, idx: usize) -> Option<&'a Map<String, Value>> {
        self.graph.in_msg(idx).map(|m| &m.decoded)
    }

    /// Account that sent the message which created `idx`.
    pub fn sender(&self, idx: usize) -> Option<String> {
        self.graph.in_msg(idx).and_then(|m| m.source.clone())
    }

    /// Free child of `idx` created by a message with `opcode`.
    pub fn free_child(&self, idx: usize, opcode: u32) -> Option<usize> {
        self.graph
            .children(idx)
            .iter()
            .copied()
            .find(|&c| self.is_free(c) && self.graph.opcode(c) == Some(opcode))
    }
}

/// One classification pattern.
pub trait ActionRule: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Try to build an action anchored at transaction `anchor`.
    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch>;
}

/// Rules in priority order. Earlier rules win contested transactions.
pub struct RuleTable {
    rules: Vec<Box<dyn ActionRule>>,
}

impl RuleTable {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// The built-in table. Specific protocol shapes come before the generic
    /// jetton/NFT shapes they are built from, and plain transfers come last.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table
            .push(TickTockRule)
            .push(DexSwapRule)
            .push(DexLiquidityRule)
            .push(StakingRule)
            .push(ElectionRule)
            .push(DnsRule)
            .push(NftTransferRule)
            .push(NftDiscoveryRule)
            .push(NftMintRule)
            .push(OpcodeTableRule)
            .push(JettonBurnRule)
            .push(JettonTransferRule)
            .push(JettonMintRule)
            .push(ContractDeployRule)
            .push(TonTransferRule)
            .push(CallContractRule);
        table
    }

    pub fn push(&mut self, rule: impl ActionRule + 'static) -> &mut Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn rules(&self) -> &[Box<dyn ActionRule>] {
        &self.rules
    }

    pub fn names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::standard()
    }
}

// ─── Field helpers ───────────────────────────────────────────────────────────

const ROLE_COLUMNS: &[&str] = &[
    "source",
    "source_secondary",
    "destination",
    "destination_secondary",
    "asset",
    "asset_secondary",
    "asset2",
    "amount",
];

/// Raw fields for the message that created a transaction: sender,
/// receiver, opcode, value and extra currencies.
pub(crate) fn message_fields(msg: &Message, receiver: &str) -> RawActionFields {
    RawActionFields {
        source: msg.source.clone(),
        destination: Some(receiver.to_string()),
        value: msg.value,
        opcode: msg.opcode,
        extra_currencies: msg.extra_currencies.clone(),
        ..RawActionFields::default()
    }
}

/// Copy every decoded field into `raw.fields`. Decoded keys named after a
/// role column also fill that column.
pub(crate) fn absorb_decoded(raw: &mut RawActionFields, decoded: &Map<String, Value>) {
    for (key, value) in decoded {
        raw.fields.insert(key.clone(), value.clone());
        if !ROLE_COLUMNS.contains(&key.as_str()) {
            continue;
        }
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        let slot = match key.as_str() {
            "source" => &mut raw.source,
            "source_secondary" => &mut raw.source_secondary,
            "destination" => &mut raw.destination,
            "destination_secondary" => &mut raw.destination_secondary,
            "asset" => &mut raw.asset,
            "asset_secondary" => &mut raw.asset_secondary,
            "asset2" => &mut raw.asset2,
            _ => &mut raw.amount,
        };
        *slot = Some(text);
    }
}

pub(crate) fn decoded_str(ctx: &MatchContext<'_>, idx: usize, key: &str) -> Option<String> {
    ctx.graph.in_msg(idx).and_then(|m| m.field_str(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TraceBuilder;

    #[test]
    fn lead_in_stops_at_claimed_and_unlisted() {
        let mut b = TraceBuilder::new();
        let w = b.external("0:w");
        let jw = b.call(w, "0:jw", Some(0x0f8a7ea5), 10);
        let rjw = b.call(jw, "0:rjw", Some(0x178d4519), 10);
        let router = b.call(rjw, "0:router", Some(0x7362d09c), 10);
        let trace = b.finish();
        let graph = TraceGraph::new(&trace);
        let reg = ProtocolRegistry::empty();

        let none_claimed = vec![false; graph.len()];
        let ctx = MatchContext::new(&graph, &reg, &none_claimed);
        assert_eq!(ctx.lead_in(router, &[0x0f8a7ea5, 0x178d4519]), vec![rjw, jw, w]);
        assert_eq!(ctx.lead_in(router, &[0x178d4519]), vec![rjw]);
        assert_eq!(ctx.initiator(jw), Some(w));

        let mut claimed = vec![false; graph.len()];
        claimed[w] = true;
        let ctx = MatchContext::new(&graph, &reg, &claimed);
        assert_eq!(ctx.lead_in(router, &[0x0f8a7ea5, 0x178d4519]), vec![rjw, jw]);
        assert_eq!(ctx.initiator(jw), None);
    }

    #[test]
    fn free_subtree_skips_claimed_branches() {
        let mut b = TraceBuilder::new();
        let root = b.external("0:w");
        let x = b.call(root, "0:x", None, 1);
        let _xx = b.call(x, "0:xx", None, 1);
        let y = b.call(root, "0:y", None, 1);
        let trace = b.finish();
        let graph = TraceGraph::new(&trace);
        let reg = ProtocolRegistry::empty();
        let mut claimed = vec![false; graph.len()];
        claimed[x] = true;
        let ctx = MatchContext::new(&graph, &reg, &claimed);
        assert_eq!(ctx.free_subtree(root), vec![root, y]);
        assert_eq!(ctx.free_descendants(root), vec![y]);
    }

    #[test]
    fn decoded_role_columns_fill_raw() {
        let mut decoded = Map::new();
        decoded.insert("destination_secondary".into(), Value::from("0:order"));
        decoded.insert("amount".into(), Value::from(42));
        decoded.insert("query_id".into(), Value::from(7));
        let mut raw = RawActionFields::default();
        absorb_decoded(&mut raw, &decoded);
        assert_eq!(raw.destination_secondary.as_deref(), Some("0:order"));
        assert_eq!(raw.amount.as_deref(), Some("42"));
        assert_eq!(raw.u64("query_id"), Some(7));
    }

    #[test]
    fn standard_table_order() {
        let table = RuleTable::standard();
        let names = table.names();
        assert_eq!(names.first(), Some(&"tick_tock"));
        assert_eq!(names.last(), Some(&"call_contract"));
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("dex_swap") < pos("jetton_transfer"));
        assert!(pos("staking") < pos("jetton_burn"));
    }
}
