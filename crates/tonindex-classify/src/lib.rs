//! tonindex-classify — turns finalized traces into typed actions.
//!
//! ```text
//! Trace ─▶ TraceGraph ─▶ RuleTable (priority order) ─▶ leftovers → unknown ─▶ Vec<Action>
//!                             │
//!                       ProtocolRegistry (DEX routers, staking pools, opcode table)
//! ```
//!
//! Every transaction of a trace is covered by exactly one action.

pub mod classifier;
pub mod graph;
pub mod registry;
pub mod rules;

#[cfg(test)]
mod testing;

pub use classifier::{repair_gas, verify_coverage, Classifier};
pub use graph::TraceGraph;
pub use registry::{DexDefinition, Marketplace, OpcodeRule, ProtocolRegistry, StakingProvider};
pub use rules::{ActionRule, MatchContext, RuleMatch, RuleTable};
