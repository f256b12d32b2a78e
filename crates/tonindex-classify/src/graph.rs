//! Message graph of one trace, indexed for rule matching.

use std::collections::HashMap;

use tonindex_core::types::{Message, TransactionData};
use tonindex_core::Trace;

/// Transactions of a trace as nodes (in logical-time order), connected by
/// the internal messages between them.
pub struct TraceGraph<'a> {
    nodes: Vec<&'a TransactionData>,
    parent: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
}

impl<'a> TraceGraph<'a> {
    pub fn new(trace: &'a Trace) -> Self {
        let mut nodes: Vec<&TransactionData> = trace.transactions.iter().collect();
        nodes.sort_by(|a, b| a.tx.lt.cmp(&b.tx.lt).then_with(|| a.tx.hash.cmp(&b.tx.hash)));

        let mut producer: HashMap<&str, usize> = HashMap::new();
        for (idx, data) in nodes.iter().enumerate() {
            for msg in data.internal_out() {
                producer.insert(msg.hash.as_str(), idx);
            }
        }

        let mut parent = vec![None; nodes.len()];
        let mut children = vec![Vec::new(); nodes.len()];
        for (idx, data) in nodes.iter().enumerate() {
            let Some(msg) = &data.in_msg else { continue };
            if let Some(&src) = producer.get(msg.hash.as_str()) {
                if src != idx {
                    parent[idx] = Some(src);
                    children[src].push(idx);
                }
            }
        }

        Self {
            nodes,
            parent,
            children,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn tx(&self, idx: usize) -> &'a TransactionData {
        self.nodes[idx]
    }

    pub fn in_msg(&self, idx: usize) -> Option<&'a Message> {
        self.nodes[idx].in_msg.as_ref()
    }

    /// Opcode of the message that created the transaction.
    pub fn opcode(&self, idx: usize) -> Option<u32> {
        self.in_msg(idx).and_then(|m| m.opcode)
    }

    pub fn account(&self, idx: usize) -> &'a str {
        &self.nodes[idx].tx.account
    }

    pub fn parent(&self, idx: usize) -> Option<usize> {
        self.parent[idx]
    }

    /// Direct children in logical-time order.
    pub fn children(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }

    /// First child created by a message with `opcode`.
    pub fn child_with_opcode(&self, idx: usize, opcode: u32) -> Option<usize> {
        self.children[idx]
            .iter()
            .copied()
            .find(|&c| self.opcode(c) == Some(opcode))
    }

    /// `idx` and all of its descendants, depth first.
    pub fn subtree(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![idx];
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children[node].iter().rev().copied());
        }
        out
    }

    /// `true` if the transaction was started by an external message.
    pub fn is_external_root(&self, idx: usize) -> bool {
        self.in_msg(idx).is_some_and(Message::is_external_in)
    }
}
