//! Shapes that need no protocol knowledge: tick-tock, deploys, plain
//! transfers, known contract calls and the registry's opcode table.

use tonindex_core::action::{ActionKind, RawActionFields};
use tonindex_core::types::AccountStatus;

use super::{absorb_decoded, message_fields, ActionRule, MatchContext, RuleMatch};
use crate::registry::opcodes;

/// A system tick-tock transaction on its own.
pub struct TickTockRule;

impl ActionRule for TickTockRule {
    fn name(&self) -> &str {
        "tick_tock"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        let tx = &ctx.graph.tx(anchor).tx;
        if !tx.is_tick_tock() {
            return None;
        }
        let raw = RawActionFields {
            destination: Some(tx.account.clone()),
            ..RawActionFields::default()
        };
        Some(RuleMatch::new(ActionKind::TickTock, anchor, raw))
    }
}

/// Registry-defined opcode rules (multisig, vesting, subscriptions, EVAA, ...).
pub struct OpcodeTableRule;

impl ActionRule for OpcodeTableRule {
    fn name(&self) -> &str {
        "opcode_table"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        let msg = ctx.graph.in_msg(anchor)?;
        let opcode = msg.opcode?;
        let account = ctx.graph.account(anchor);
        let rule = ctx
            .registry
            .opcode_rules
            .iter()
            .find(|r| r.opcode == opcode && r.applies_to(account))?;

        let mut raw = message_fields(msg, account);
        if let Some(asset) = &rule.asset {
            raw.asset = Some(asset.clone());
        }
        absorb_decoded(&mut raw, &msg.decoded);
        raw.set("rule", rule.name.as_str());

        let lead = ctx.initiator(anchor);
        Some(RuleMatch::new(rule.kind, anchor, raw).with_nodes(lead.into_iter().chain(ctx.free_descendants(anchor))))
    }
}

/// A message carrying a state init to a not-yet-active account.
pub struct ContractDeployRule;

impl ActionRule for ContractDeployRule {
    fn name(&self) -> &str {
        "contract_deploy"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        let data = ctx.graph.tx(anchor);
        let msg = data.in_msg.as_ref()?;
        msg.init_state.as_ref()?;
        if !matches!(data.tx.orig_status, AccountStatus::Uninit | AccountStatus::Nonexist) {
            return None;
        }
        let raw = message_fields(msg, &data.tx.account);
        Some(RuleMatch::new(ActionKind::ContractDeploy, anchor, raw).with_nodes(ctx.initiator(anchor)))
    }
}

/// A plain value transfer, with an optional (possibly encrypted) comment.
/// A bounce coming back from the receiver belongs to the same action.
pub struct TonTransferRule;

impl ActionRule for TonTransferRule {
    fn name(&self) -> &str {
        "ton_transfer"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        let msg = ctx.graph.in_msg(anchor)?;
        if !msg.is_internal() || msg.bounced {
            return None;
        }
        let encrypted = match msg.opcode {
            None | Some(opcodes::TEXT_COMMENT) => false,
            Some(opcodes::ENCRYPTED_COMMENT) => true,
            Some(_) => return None,
        };

        let mut raw = message_fields(msg, ctx.graph.account(anchor));
        raw.opcode = None;
        raw.set("encrypted", encrypted);
        if let Some(comment) = msg.field_str("comment") {
            raw.set("comment", comment);
        }

        let bounce = ctx
            .graph
            .children(anchor)
            .iter()
            .copied()
            .find(|&c| ctx.is_free(c) && ctx.graph.in_msg(c).is_some_and(|m| m.bounced));
        let lead = ctx.initiator(anchor);
        Some(RuleMatch::new(ActionKind::TonTransfer, anchor, raw).with_nodes(lead.into_iter().chain(bounce)))
    }
}

/// An internal message with an opcode the registry lists as a known call.
pub struct CallContractRule;

impl ActionRule for CallContractRule {
    fn name(&self) -> &str {
        "call_contract"
    }

    fn try_match(&self, ctx: &MatchContext<'_>, anchor: usize) -> Option<RuleMatch> {
        let msg = ctx.graph.in_msg(anchor)?;
        let opcode = msg.opcode?;
        if !msg.is_internal() || !ctx.registry.is_known_call_opcode(opcode) {
            return None;
        }
        let raw = message_fields(msg, ctx.graph.account(anchor));
        Some(RuleMatch::new(ActionKind::CallContract, anchor, raw).with_nodes(ctx.initiator(anchor)))
    }
}
