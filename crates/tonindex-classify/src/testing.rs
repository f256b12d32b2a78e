//! Trace fixtures for classifier tests.

use std::collections::BTreeSet;

use tonindex_core::types::{
    AccountStatus, BlockId, Direction, Message, ShardIdent, Transaction, TransactionData, TransactionDescr,
    TransactionKind,
};
use tonindex_core::{Trace, TraceState};

/// Builds a trace one transaction at a time; node indices follow insertion order.
pub(crate) struct TraceBuilder {
    txs: Vec<TransactionData>,
    lt: u64,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self { txs: Vec::new(), lt: 1000 }
    }

    fn next_tx(&mut self, account: &str, in_msg: Option<Message>) -> usize {
        self.lt += 10;
        let idx = self.txs.len();
        let hash = format!("tx{idx}");
        let in_msg = in_msg.map(|m| m.attached(hash.clone(), Direction::In));
        self.txs.push(TransactionData {
            tx: Transaction {
                hash,
                account: account.into(),
                lt: self.lt,
                block: BlockId::new(ShardIdent::full(0), 1),
                mc_seqno: 1,
                now: 1_700_000_000 + idx as u32,
                prev_tx_hash: None,
                prev_tx_lt: None,
                orig_status: AccountStatus::Active,
                end_status: AccountStatus::Active,
                total_fees: 1000,
                state_hash_before: String::new(),
                state_hash_after: String::new(),
                descr: TransactionDescr::ordinary(),
            },
            in_msg,
            out_msgs: Vec::new(),
        });
        idx
    }

    /// A wallet transaction triggered by an external message.
    pub fn external(&mut self, account: &str) -> usize {
        let msg = Message::external_in(format!("ext{}", self.txs.len()), account);
        self.next_tx(account, Some(msg))
    }

    pub fn tick_tock(&mut self, account: &str) -> usize {
        let idx = self.next_tx(account, None);
        self.txs[idx].tx.descr.kind = TransactionKind::TickTock;
        idx
    }

    /// Send an internal message from `parent` to `account` and add the
    /// transaction it creates.
    pub fn call(&mut self, parent: usize, account: &str, opcode: Option<u32>, value: u64) -> usize {
        self.call_with(parent, account, value, |m| match opcode {
            Some(op) => m.with_opcode(op),
            None => m,
        })
    }

    /// Like [`call`](Self::call) but lets the test shape the message.
    pub fn call_with(
        &mut self,
        parent: usize,
        account: &str,
        value: u64,
        shape: impl FnOnce(Message) -> Message,
    ) -> usize {
        let source = self.txs[parent].tx.account.clone();
        let hash = format!("msg{}-{}", parent, self.txs.len());
        let mut msg = shape(Message::internal(hash, source, account, value));
        msg.created_lt = Some(self.lt + 1);
        let parent_hash = self.txs[parent].tx.hash.clone();
        self.txs[parent]
            .out_msgs
            .push(msg.clone().attached(parent_hash, Direction::Out));
        self.next_tx(account, Some(msg))
    }

    pub fn tx_mut(&mut self, idx: usize) -> &mut TransactionData {
        &mut self.txs[idx]
    }

    pub fn finish(self) -> Trace {
        let first = &self.txs[0];
        let last = &self.txs[self.txs.len() - 1];
        let external_hash = first
            .in_msg
            .as_ref()
            .filter(|m| m.is_external_in())
            .map(|m| m.hash.clone());
        let id = external_hash.clone().unwrap_or_else(|| first.tx.hash.clone());
        let (root_tx, start_lt, end_lt) = (first.tx.hash.clone(), first.tx.lt, last.tx.lt);
        let (start_utime, end_utime) = (first.tx.now, last.tx.now);
        Trace {
            id,
            external_hash,
            root_tx,
            state: TraceState::Complete,
            break_reason: None,
            start_lt,
            end_lt,
            start_utime,
            end_utime,
            start_mc_seqno: 1,
            end_mc_seqno: 1,
            in_flight: BTreeSet::new(),
            awaiting_parent: None,
            transactions: self.txs,
        }
    }
}

/// A linear chain: an external root followed by one call per opcode.
pub(crate) fn chain(opcodes: &[Option<u32>]) -> Trace {
    let mut b = TraceBuilder::new();
    let mut prev = b.external("0:acc0");
    for (i, op) in opcodes.iter().enumerate().skip(1) {
        prev = b.call(prev, &format!("0:acc{i}"), *op, 1_000_000);
    }
    b.finish()
}
