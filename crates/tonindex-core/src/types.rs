//! Core record types shared across the pipeline.
//!
//! These are the decoded shapes handed over by the record source. Nothing
//! here parses raw cells; hashes and addresses are carried as opaque strings.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Raw account address in `workchain:hex` form.
pub type Address = String;

/// A shard identifier: workchain plus a 64-bit shard prefix terminated by a
/// marker bit (`0x8000_0000_0000_0000` is the whole workchain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardIdent {
    pub workchain: i32,
    pub shard: u64,
}

impl ShardIdent {
    pub const FULL: u64 = 0x8000_0000_0000_0000;

    pub const MASTERCHAIN: ShardIdent = ShardIdent {
        workchain: -1,
        shard: Self::FULL,
    };

    pub const fn new(workchain: i32, shard: u64) -> Self {
        Self { workchain, shard }
    }

    /// The unsplit shard of a workchain.
    pub const fn full(workchain: i32) -> Self {
        Self::new(workchain, Self::FULL)
    }

    pub fn is_masterchain(&self) -> bool {
        self.workchain == -1
    }

    fn lowest_bit(&self) -> u64 {
        self.shard & self.shard.wrapping_neg()
    }

    /// The shard this one was split from, `None` for the full shard.
    pub fn parent(&self) -> Option<ShardIdent> {
        let low = self.lowest_bit();
        if low == 0 || low == Self::FULL {
            return None;
        }
        Some(Self::new(self.workchain, (self.shard - low) | (low << 1)))
    }

    /// The two shards produced by splitting this one.
    pub fn children(&self) -> Option<(ShardIdent, ShardIdent)> {
        let low = self.lowest_bit();
        if low <= 1 {
            return None;
        }
        let half = low >> 1;
        Some((
            Self::new(self.workchain, self.shard - half),
            Self::new(self.workchain, self.shard + half),
        ))
    }

    /// `true` if `other` is this shard or lies inside its prefix.
    pub fn contains(&self, other: &ShardIdent) -> bool {
        if self.workchain != other.workchain {
            return false;
        }
        let low = self.lowest_bit();
        let mask = !(low.wrapping_sub(1) | low);
        (self.shard & mask) == (other.shard & mask) && other.lowest_bit() <= low
    }
}

impl fmt::Display for ShardIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:016x}", self.workchain, self.shard)
    }
}

/// A block reference: shard plus seqno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub shard: ShardIdent,
    pub seqno: u32,
}

impl BlockId {
    pub const fn new(shard: ShardIdent, seqno: u32) -> Self {
        Self { shard, seqno }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.shard, self.seqno)
    }
}

// ─── Blocks ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub root_hash: String,
    pub file_hash: String,
    /// Generation time (unix seconds).
    pub gen_utime: u32,
    pub start_lt: u64,
    pub end_lt: u64,
    /// One previous block, or two after a merge.
    pub prev_blocks: Vec<BlockId>,
    /// Masterchain block that committed this block (its own seqno for masterchain blocks).
    pub mc_seqno: u32,
    #[serde(default)]
    pub before_split: bool,
    #[serde(default)]
    pub after_split: bool,
    #[serde(default)]
    pub after_merge: bool,
    #[serde(default)]
    pub key_block: bool,
    /// Shard blocks referenced by a masterchain block; empty elsewhere.
    #[serde(default)]
    pub shard_tops: Vec<BlockId>,
    #[serde(default)]
    pub tx_count: u32,
}

// ─── Transactions ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Ordinary,
    TickTock,
    SplitPrepare,
    SplitInstall,
    MergePrepare,
    MergeInstall,
    Storage,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ordinary => "ord",
            Self::TickTock => "tick_tock",
            Self::SplitPrepare => "split_prepare",
            Self::SplitInstall => "split_install",
            Self::MergePrepare => "merge_prepare",
            Self::MergeInstall => "merge_install",
            Self::Storage => "storage",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Uninit,
    Frozen,
    Active,
    Nonexist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePhase {
    pub fees_collected: u64,
    pub fees_due: Option<u64>,
    pub status_change: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPhase {
    pub due_fees_collected: Option<u64>,
    pub credit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComputePhase {
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub success: bool,
    pub gas_fees: u64,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub exit_code: i32,
    pub vm_steps: u32,
}

impl ComputePhase {
    /// Undo the historical upstream bug that stored gas fees and gas used
    /// in each other's columns. Returns `true` if the fields were swapped.
    pub fn repair_swapped_gas(&mut self) -> bool {
        if self.gas_fees < self.gas_used {
            std::mem::swap(&mut self.gas_fees, &mut self.gas_used);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionPhase {
    pub success: bool,
    pub valid: bool,
    pub no_funds: bool,
    pub total_fwd_fees: Option<u64>,
    pub result_code: i32,
    pub tot_actions: u16,
    pub msgs_created: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceKind {
    NegativeFunds,
    NoFunds,
    Ok,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BouncePhase {
    pub kind: BounceKind,
    pub msg_fees: Option<u64>,
    pub fwd_fees: Option<u64>,
}

/// Transaction description: kind plus the phases that kind carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDescr {
    pub kind: TransactionKind,
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub destroyed: bool,
    #[serde(default)]
    pub is_tock: bool,
    pub storage: Option<StoragePhase>,
    pub credit: Option<CreditPhase>,
    pub compute: Option<ComputePhase>,
    pub action: Option<ActionPhase>,
    pub bounce: Option<BouncePhase>,
}

impl TransactionDescr {
    pub fn ordinary() -> Self {
        Self {
            kind: TransactionKind::Ordinary,
            aborted: false,
            destroyed: false,
            is_tock: false,
            storage: None,
            credit: None,
            compute: Some(ComputePhase {
                success: true,
                ..ComputePhase::default()
            }),
            action: Some(ActionPhase {
                success: true,
                valid: true,
                ..ActionPhase::default()
            }),
            bounce: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub account: Address,
    pub lt: u64,
    pub block: BlockId,
    pub mc_seqno: u32,
    /// Transaction time (unix seconds).
    pub now: u32,
    pub prev_tx_hash: Option<String>,
    pub prev_tx_lt: Option<u64>,
    pub orig_status: AccountStatus,
    pub end_status: AccountStatus,
    pub total_fees: u64,
    pub state_hash_before: String,
    pub state_hash_after: String,
    pub descr: TransactionDescr,
}

impl Transaction {
    pub fn is_tick_tock(&self) -> bool {
        self.descr.kind == TransactionKind::TickTock
    }

    /// Compute succeeded and the action phase (if any) did not fail.
    pub fn is_success(&self) -> bool {
        if self.descr.aborted {
            return false;
        }
        let compute_ok = self
            .descr
            .compute
            .as_ref()
            .map(|c| c.skipped || c.success)
            .unwrap_or(true);
        let action_ok = self.descr.action.as_ref().map(|a| a.success).unwrap_or(true);
        compute_ok && action_ok
    }

    /// Apply [`ComputePhase::repair_swapped_gas`] to this transaction.
    pub fn repair_gas(&mut self) -> bool {
        self.descr
            .compute
            .as_mut()
            .map(ComputePhase::repair_swapped_gas)
            .unwrap_or(false)
    }
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// Direction of a message relative to the transaction it is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

/// An opaque serialized content blob (body or init state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlob {
    pub hash: String,
    /// Base64 bag of cells.
    pub boc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub hash: String,
    /// Transaction this record is attached to.
    pub tx_hash: String,
    pub direction: Direction,
    /// `None` for external inbound messages.
    pub source: Option<Address>,
    /// `None` for external outbound messages (logs).
    pub destination: Option<Address>,
    /// Value in nanotons; `None` for external messages.
    pub value: Option<u64>,
    /// Extra-currency id → decimal amount.
    #[serde(default)]
    pub extra_currencies: BTreeMap<u32, String>,
    #[serde(default)]
    pub fwd_fee: Option<u64>,
    #[serde(default)]
    pub ihr_fee: Option<u64>,
    #[serde(default)]
    pub created_lt: Option<u64>,
    #[serde(default)]
    pub created_at: Option<u32>,
    pub opcode: Option<u32>,
    #[serde(default)]
    pub bounce: bool,
    #[serde(default)]
    pub bounced: bool,
    pub body: Option<ContentBlob>,
    pub init_state: Option<ContentBlob>,
    /// Fields extracted from the body by the upstream decoder.
    #[serde(default)]
    pub decoded: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    /// An internal message carrying `value` nanotons.
    pub fn internal(
        hash: impl Into<String>,
        source: impl Into<Address>,
        destination: impl Into<Address>,
        value: u64,
    ) -> Self {
        Self {
            hash: hash.into(),
            tx_hash: String::new(),
            direction: Direction::Out,
            source: Some(source.into()),
            destination: Some(destination.into()),
            value: Some(value),
            extra_currencies: BTreeMap::new(),
            fwd_fee: None,
            ihr_fee: None,
            created_lt: None,
            created_at: None,
            opcode: None,
            bounce: true,
            bounced: false,
            body: None,
            init_state: None,
            decoded: serde_json::Map::new(),
        }
    }

    /// An external inbound message addressed to `destination`.
    pub fn external_in(hash: impl Into<String>, destination: impl Into<Address>) -> Self {
        Self {
            source: None,
            value: None,
            direction: Direction::In,
            bounce: false,
            ..Self::internal(hash, "", destination, 0)
        }
    }

    pub fn with_opcode(mut self, opcode: u32) -> Self {
        self.opcode = Some(opcode);
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.decoded.insert(key.to_string(), value.into());
        self
    }

    /// Re-attach this message to `tx_hash` with the given direction.
    pub fn attached(mut self, tx_hash: impl Into<String>, direction: Direction) -> Self {
        self.tx_hash = tx_hash.into();
        self.direction = direction;
        self
    }

    pub fn is_external_in(&self) -> bool {
        self.source.is_none()
    }

    pub fn is_external_out(&self) -> bool {
        self.destination.is_none()
    }

    pub fn is_internal(&self) -> bool {
        self.source.is_some() && self.destination.is_some()
    }

    pub fn has_extra_currencies(&self) -> bool {
        !self.extra_currencies.is_empty()
    }

    /// A decoded field as a string (numbers are rendered in decimal).
    pub fn field_str(&self, key: &str) -> Option<String> {
        match self.decoded.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn field_u64(&self, key: &str) -> Option<u64> {
        match self.decoded.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn field_bool(&self, key: &str) -> Option<bool> {
        self.decoded.get(key)?.as_bool()
    }
}

// ─── Attached records ────────────────────────────────────────────────────────

/// A transaction with its inbound and outbound messages attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionData {
    pub tx: Transaction,
    pub in_msg: Option<Message>,
    pub out_msgs: Vec<Message>,
}

impl TransactionData {
    pub fn hash(&self) -> &str {
        &self.tx.hash
    }

    /// All message records attached to this transaction.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.in_msg.iter().chain(self.out_msgs.iter())
    }

    /// Outbound messages that will be consumed by another transaction.
    pub fn internal_out(&self) -> impl Iterator<Item = &Message> {
        self.out_msgs.iter().filter(|m| m.is_internal())
    }
}

/// A block with its transactions attached, ordered by logical time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockData {
    pub block: Block,
    pub transactions: Vec<TransactionData>,
}

impl BlockData {
    pub fn id(&self) -> BlockId {
        self.block.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_split_and_merge_math() {
        let full = ShardIdent::full(0);
        let (left, right) = full.children().unwrap();
        assert_eq!(left.shard, 0x4000_0000_0000_0000);
        assert_eq!(right.shard, 0xc000_0000_0000_0000);
        assert_eq!(left.parent(), Some(full));
        assert_eq!(right.parent(), Some(full));
        assert_eq!(full.parent(), None);
        assert!(full.contains(&left));
        assert!(!left.contains(&right));
        assert!(left.contains(&left));
    }

    #[test]
    fn shard_display() {
        assert_eq!(ShardIdent::MASTERCHAIN.to_string(), "-1:8000000000000000");
        let id = BlockId::new(ShardIdent::full(0), 42);
        assert_eq!(id.to_string(), "(0:8000000000000000,42)");
    }

    #[test]
    fn gas_swap_repaired() {
        let mut phase = ComputePhase {
            gas_fees: 100,
            gas_used: 500,
            ..ComputePhase::default()
        };
        assert!(phase.repair_swapped_gas());
        assert_eq!(phase.gas_fees, 500);
        assert_eq!(phase.gas_used, 100);
        // Already consistent values are left alone.
        assert!(!phase.repair_swapped_gas());
        assert_eq!(phase.gas_fees, 500);
    }

    #[test]
    fn decoded_field_access() {
        let msg = Message::internal("m", "0:aa", "0:bb", 1)
            .with_field("amount", "1000000000000000000000")
            .with_field("query_id", 7);
        assert_eq!(msg.field_str("amount").as_deref(), Some("1000000000000000000000"));
        assert_eq!(msg.field_u64("query_id"), Some(7));
        assert!(msg.is_internal());
    }

    #[test]
    fn external_message_shape() {
        let msg = Message::external_in("ext", "0:aa");
        assert!(msg.is_external_in());
        assert!(!msg.is_internal());
        assert_eq!(msg.value, None);
        assert_eq!(msg.direction, Direction::In);
    }
}
