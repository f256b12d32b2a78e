//! Trace assembler — groups transactions into traces by following messages.
//!
//! ```text
//!   ingest(tx) ──► links[p(in_msg)]  in-flight hit?  ──yes──► owning trace
//!                                     │ no
//!                                     └──► provisional (orphan) trace,
//!                                          merged when the source appears
//!              ──► traces[p(key)]    add tx, record outbound messages
//!              ──► links[p(out_msg)] publish in-flight / merge early orphans
//!
//!   sweep(frontier) ──► COMPLETE (nothing in flight, scanned up to frontier)
//!                   ──► BROKEN   (older than TTL, or evicted over capacity)
//! ```
//!
//! Traces live in `partitions` striped maps keyed by trace id; in-flight
//! messages live in a second set of striped maps keyed by message hash that
//! point back at the owning trace id. A links lock may be held while taking
//! a trace lock, never the other way round. Two trace locks are taken only in
//! partition-index order.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::types::TransactionData;

/// Lifecycle state of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceState {
    Pending,
    Complete,
    Broken,
}

impl fmt::Display for TraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Complete => write!(f, "complete"),
            Self::Broken => write!(f, "broken"),
        }
    }
}

/// Why a trace was finalized as BROKEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakReason {
    /// Still pending past the TTL.
    Ttl,
    /// Evicted early because the pending working set was full.
    Evicted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblerConfig {
    /// Number of lock stripes for traces and for in-flight messages.
    pub partitions: usize,
    /// Maximum PENDING traces before the oldest are forced to BROKEN.
    pub max_pending: usize,
    /// Masterchain seqnos a trace may stay PENDING after its start.
    pub ttl_mc_seqnos: u32,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            partitions: 64,
            max_pending: 100_000,
            ttl_mc_seqnos: 100,
        }
    }
}

/// A (possibly still growing) trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    /// Root external message hash; tick-tock and orphan roots use their own hash.
    pub id: String,
    pub external_hash: Option<String>,
    pub root_tx: String,
    pub state: TraceState,
    pub break_reason: Option<BreakReason>,
    pub transactions: Vec<TransactionData>,
    /// Outbound internal messages not yet matched to a destination transaction.
    pub in_flight: BTreeSet<String>,
    /// Inbound message of the root when the root was not an external message
    /// and its source transaction has not been seen.
    pub awaiting_parent: Option<String>,
    pub start_lt: u64,
    pub end_lt: u64,
    pub start_utime: u32,
    pub end_utime: u32,
    pub start_mc_seqno: u32,
    pub end_mc_seqno: u32,
}

impl Trace {
    fn new(id: String, root: &TransactionData) -> Self {
        let external_hash = root
            .in_msg
            .as_ref()
            .filter(|m| m.is_external_in())
            .map(|m| m.hash.clone());
        Self {
            id,
            external_hash,
            root_tx: root.tx.hash.clone(),
            state: TraceState::Pending,
            break_reason: None,
            transactions: Vec::new(),
            in_flight: BTreeSet::new(),
            awaiting_parent: None,
            start_lt: root.tx.lt,
            end_lt: root.tx.lt,
            start_utime: root.tx.now,
            end_utime: root.tx.now,
            start_mc_seqno: root.tx.mc_seqno,
            end_mc_seqno: root.tx.mc_seqno,
        }
    }

    fn add(&mut self, data: TransactionData) {
        if let Some(msg) = &data.in_msg {
            self.in_flight.remove(&msg.hash);
        }
        for msg in data.internal_out() {
            self.in_flight.insert(msg.hash.clone());
        }
        self.start_lt = self.start_lt.min(data.tx.lt);
        self.end_lt = self.end_lt.max(data.tx.lt);
        self.start_utime = self.start_utime.min(data.tx.now);
        self.end_utime = self.end_utime.max(data.tx.now);
        self.start_mc_seqno = self.start_mc_seqno.min(data.tx.mc_seqno);
        self.end_mc_seqno = self.end_mc_seqno.max(data.tx.mc_seqno);
        self.transactions.push(data);
    }

    fn absorb(&mut self, other: Trace, consumed: &str) {
        self.start_lt = self.start_lt.min(other.start_lt);
        self.end_lt = self.end_lt.max(other.end_lt);
        self.start_utime = self.start_utime.min(other.start_utime);
        self.end_utime = self.end_utime.max(other.end_utime);
        self.start_mc_seqno = self.start_mc_seqno.min(other.start_mc_seqno);
        self.end_mc_seqno = self.end_mc_seqno.max(other.end_mc_seqno);
        self.in_flight.extend(other.in_flight);
        self.transactions.extend(other.transactions);
        // Messages consumed inside the absorbed part are no longer in flight.
        for data in &self.transactions {
            if let Some(msg) = &data.in_msg {
                self.in_flight.remove(&msg.hash);
            }
        }
        self.in_flight.remove(consumed);
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.state != TraceState::Pending
    }

    pub fn tx_hashes(&self) -> Vec<String> {
        self.transactions.iter().map(|d| d.tx.hash.clone()).collect()
    }

    pub fn message_hashes(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .transactions
            .iter()
            .flat_map(|d| d.messages().map(|m| m.hash.as_str()))
            .collect();
        set.into_iter().map(str::to_string).collect()
    }

    /// The persisted shape of this trace.
    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            trace_id: self.id.clone(),
            external_hash: self.external_hash.clone(),
            root_tx: self.root_tx.clone(),
            state: self.state,
            break_reason: self.break_reason,
            start_lt: self.start_lt,
            end_lt: self.end_lt,
            start_utime: self.start_utime,
            end_utime: self.end_utime,
            start_mc_seqno: self.start_mc_seqno,
            end_mc_seqno: self.end_mc_seqno,
            tx_hashes: self.tx_hashes(),
            message_hashes: self.message_hashes(),
            pending_edges: self.in_flight.len(),
        }
    }

    fn sort(&mut self) {
        self.transactions
            .sort_by(|a, b| a.tx.lt.cmp(&b.tx.lt).then_with(|| a.tx.hash.cmp(&b.tx.hash)));
    }
}

/// Trace row as written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_id: String,
    pub external_hash: Option<String>,
    pub root_tx: String,
    pub state: TraceState,
    pub break_reason: Option<BreakReason>,
    pub start_lt: u64,
    pub end_lt: u64,
    pub start_utime: u32,
    pub end_utime: u32,
    pub start_mc_seqno: u32,
    pub end_mc_seqno: u32,
    pub tx_hashes: Vec<String>,
    pub message_hashes: Vec<String>,
    pub pending_edges: usize,
}

enum Slot {
    Live(Trace),
    /// An orphan that was folded into another trace.
    Merged { into: String, at_mc_seqno: u32 },
}

#[derive(Default)]
struct Links {
    /// Message hash → trace id of the transaction that emitted it.
    in_flight: HashMap<String, String>,
    /// Message hash → orphan trace id of the transaction that consumed it
    /// before its source was seen.
    early: HashMap<String, String>,
}

pub struct TraceAssembler {
    config: AssemblerConfig,
    traces: Vec<Mutex<HashMap<String, Slot>>>,
    links: Vec<Mutex<Links>>,
    pending: AtomicUsize,
    /// Masterchain span (start → furthest end) of finalized traces that may
    /// still straddle the replay horizon.
    spans: Mutex<BTreeMap<u32, u32>>,
}

impl TraceAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        let partitions = config.partitions.max(1);
        Self {
            traces: (0..partitions).map(|_| Mutex::new(HashMap::new())).collect(),
            links: (0..partitions).map(|_| Mutex::new(Links::default())).collect(),
            pending: AtomicUsize::new(0),
            spans: Mutex::new(BTreeMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    fn partition(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.traces.len() as u64) as usize
    }

    /// Number of PENDING traces in the working set.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Add a transaction to its trace. Returns the id of the trace it joined.
    pub fn ingest(&self, data: TransactionData) -> String {
        let internal_in = data
            .in_msg
            .as_ref()
            .filter(|m| m.is_internal())
            .map(|m| m.hash.clone());

        let key = match internal_in {
            Some(in_hash) => self.link_inbound(&in_hash, &data),
            None => self.start_root(&data),
        };

        let out_hashes: Vec<String> = data.internal_out().map(|m| m.hash.clone()).collect();
        let key = match self.apply(&key, data) {
            Ok(key) => key,
            Err(data) => {
                // The owning trace was finalized concurrently.
                let orphan = data
                    .in_msg
                    .as_ref()
                    .map(|m| m.hash.clone())
                    .unwrap_or_else(|| data.tx.hash.clone());
                tracing::warn!(tx = %data.tx.hash, trace_id = %key, "transaction arrived after its trace was finalized");
                let mut trace = Trace::new(orphan.clone(), &data);
                trace.awaiting_parent = Some(orphan.clone());
                trace.add(data);
                self.insert_trace(trace);
                orphan
            }
        };

        for hash in out_hashes {
            let early = {
                let mut links = self.links[self.partition(&hash)].lock().unwrap();
                match links.early.remove(&hash) {
                    Some(orphan) => Some(orphan),
                    None => {
                        links.in_flight.insert(hash.clone(), key.clone());
                        None
                    }
                }
            };
            if let Some(orphan) = early {
                self.merge(&orphan, &key, &hash);
            }
        }
        key
    }

    fn start_root(&self, data: &TransactionData) -> String {
        let mut id = data
            .in_msg
            .as_ref()
            .filter(|m| m.is_external_in())
            .map(|m| m.hash.clone())
            .unwrap_or_else(|| data.tx.hash.clone());
        let idx = self.partition(&id);
        let exists = self.traces[idx].lock().unwrap().contains_key(&id);
        if exists {
            id = format!("{id}:{}", data.tx.hash);
        }
        self.insert_trace(Trace::new(id.clone(), data));
        id
    }

    fn link_inbound(&self, in_hash: &str, data: &TransactionData) -> String {
        let mut links = self.links[self.partition(in_hash)].lock().unwrap();
        if let Some(owner) = links.in_flight.remove(in_hash) {
            return owner;
        }
        // Source not seen yet: start a provisional trace. The links lock is
        // held until the trace exists so the source can always find it.
        let id = in_hash.to_string();
        let mut trace = Trace::new(id.clone(), data);
        trace.awaiting_parent = Some(id.clone());
        links.early.insert(id.clone(), id.clone());
        self.insert_trace(trace);
        tracing::trace!(tx = %data.tx.hash, msg = %in_hash, "early arrival, provisional trace");
        id
    }

    fn insert_trace(&self, trace: Trace) {
        let idx = self.partition(&trace.id);
        self.traces[idx]
            .lock()
            .unwrap()
            .insert(trace.id.clone(), Slot::Live(trace));
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `data` to trace `key`, following merge forwards. Gives the data
    /// back if the trace no longer exists.
    fn apply(&self, key: &str, data: TransactionData) -> Result<String, TransactionData> {
        let mut key = key.to_string();
        loop {
            let mut part = self.traces[self.partition(&key)].lock().unwrap();
            match part.get_mut(&key) {
                Some(Slot::Live(trace)) => {
                    trace.add(data);
                    return Ok(key);
                }
                Some(Slot::Merged { into, .. }) => {
                    let next = into.clone();
                    drop(part);
                    key = next;
                }
                None => return Err(data),
            }
        }
    }

    /// Fold orphan trace `orphan` into `target`; `consumed` links them.
    fn merge(&self, orphan: &str, target: &str, consumed: &str) {
        let mut target = target.to_string();
        loop {
            let (a, b) = (self.partition(orphan), self.partition(&target));
            let (mut first, mut second) = if a == b {
                (self.traces[a].lock().unwrap(), None)
            } else if a < b {
                let first = self.traces[a].lock().unwrap();
                let second = self.traces[b].lock().unwrap();
                (first, Some(second))
            } else {
                let second = self.traces[b].lock().unwrap();
                let first = self.traces[a].lock().unwrap();
                (first, Some(second))
            };

            // `first` holds the orphan's partition, `second` the target's when different.
            let target_slot = match second.as_mut() {
                Some(map) => map.get(&target),
                None => first.get(&target),
            };
            match target_slot {
                Some(Slot::Merged { into, .. }) => {
                    target = into.clone();
                    continue;
                }
                None => {
                    tracing::warn!(orphan, target = %target, "merge target vanished, orphan left pending");
                    return;
                }
                Some(Slot::Live(t)) if t.id == orphan => return,
                Some(Slot::Live(_)) => {}
            }

            let Some(Slot::Live(mut moved)) = first.remove(orphan) else {
                return;
            };
            let mc = moved.end_mc_seqno;
            first.insert(
                orphan.to_string(),
                Slot::Merged {
                    into: target.clone(),
                    at_mc_seqno: mc,
                },
            );
            moved.awaiting_parent = None;
            let target_map = match second.as_mut() {
                Some(map) => map,
                None => &mut first,
            };
            if let Some(Slot::Live(t)) = target_map.get_mut(&target) {
                t.absorb(moved, consumed);
            }
            self.pending.fetch_sub(1, Ordering::Relaxed);
            tracing::trace!(orphan, target = %target, "orphan trace merged");
            return;
        }
    }

    /// Finalize traces against the scanned masterchain frontier.
    ///
    /// Returns every trace that became COMPLETE or BROKEN, ordered by start
    /// logical time. Finalized traces leave the working set.
    pub fn sweep(&self, frontier: u32) -> Vec<Trace> {
        let ttl = self.config.ttl_mc_seqnos;
        let mut finalized = Vec::new();

        for part in &self.traces {
            let mut map = part.lock().unwrap();
            let done: Vec<(String, Option<TraceState>)> = map
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Live(trace) => {
                        Self::decide(trace, frontier, ttl).map(|state| (key.clone(), Some(state)))
                    }
                    Slot::Merged { at_mc_seqno, .. } => {
                        (frontier.saturating_sub(*at_mc_seqno) > ttl).then(|| (key.clone(), None))
                    }
                })
                .collect();
            for (key, state) in done {
                if let (Some(Slot::Live(mut trace)), Some(state)) = (map.remove(&key), state) {
                    trace.state = state;
                    if state == TraceState::Broken {
                        trace.break_reason = Some(BreakReason::Ttl);
                        tracing::warn!(
                            trace_id = %trace.id,
                            start_mc_seqno = trace.start_mc_seqno,
                            frontier,
                            in_flight = trace.in_flight.len(),
                            "trace exceeded TTL, marked broken"
                        );
                    }
                    finalized.push(trace);
                }
            }
        }
        self.pending.fetch_sub(finalized.len(), Ordering::Relaxed);

        finalized.extend(self.evict_overflow());
        for trace in &mut finalized {
            self.unlink(trace);
            trace.sort();
        }
        if !finalized.is_empty() {
            let mut spans = self.spans.lock().unwrap();
            for trace in &finalized {
                let end = spans.entry(trace.start_mc_seqno).or_insert(trace.end_mc_seqno);
                *end = (*end).max(trace.end_mc_seqno);
            }
        }
        finalized.sort_by(|a, b| a.start_lt.cmp(&b.start_lt).then_with(|| a.id.cmp(&b.id)));
        finalized
    }

    /// Lowest masterchain seqno a restart may re-read from without cutting a
    /// trace in two.
    ///
    /// No PENDING trace starts before the result, and no finalized trace
    /// starts before it while ending at or after it. Re-reading from the
    /// returned seqno therefore rebuilds every trace that touches a later
    /// block from its root. `limit` caps the result; callers pass one past the
    /// scanned frontier, lowered to the oldest root not yet durably written.
    pub fn replay_horizon(&self, limit: u32) -> u32 {
        let mut horizon = limit;
        for part in &self.traces {
            for slot in part.lock().unwrap().values() {
                if let Slot::Live(trace) = slot {
                    horizon = horizon.min(trace.start_mc_seqno);
                }
            }
        }
        let mut spans = self.spans.lock().unwrap();
        while let Some(start) = spans
            .range(..horizon)
            .find(|(_, end)| **end >= horizon)
            .map(|(start, _)| *start)
        {
            horizon = start;
        }
        // Spans ending below the horizon can never straddle a later one.
        spans.retain(|_, end| *end >= horizon);
        horizon
    }

    fn decide(trace: &Trace, frontier: u32, ttl: u32) -> Option<TraceState> {
        if trace.awaiting_parent.is_none() && trace.in_flight.is_empty() && trace.end_mc_seqno <= frontier {
            Some(TraceState::Complete)
        } else if frontier.saturating_sub(trace.start_mc_seqno) > ttl {
            Some(TraceState::Broken)
        } else {
            None
        }
    }

    /// Force the oldest PENDING traces to BROKEN while over capacity.
    fn evict_overflow(&self) -> Vec<Trace> {
        let pending = self.pending_count();
        if pending <= self.config.max_pending {
            return Vec::new();
        }
        let excess = pending - self.config.max_pending;

        let mut candidates: Vec<(u32, u64, String)> = Vec::with_capacity(pending);
        for part in &self.traces {
            let map = part.lock().unwrap();
            for slot in map.values() {
                if let Slot::Live(t) = slot {
                    candidates.push((t.start_mc_seqno, t.start_lt, t.id.clone()));
                }
            }
        }
        candidates.sort();

        let mut evicted = Vec::with_capacity(excess);
        for (_, _, id) in candidates.into_iter().take(excess) {
            let removed = self.traces[self.partition(&id)].lock().unwrap().remove(&id);
            if let Some(Slot::Live(mut trace)) = removed {
                trace.state = TraceState::Broken;
                trace.break_reason = Some(BreakReason::Evicted);
                evicted.push(trace);
            }
        }
        self.pending.fetch_sub(evicted.len(), Ordering::Relaxed);
        tracing::warn!(
            evicted = evicted.len(),
            max_pending = self.config.max_pending,
            "pending trace limit exceeded, oldest traces marked broken"
        );
        evicted
    }

    fn unlink(&self, trace: &Trace) {
        for hash in &trace.in_flight {
            self.links[self.partition(hash)]
                .lock()
                .unwrap()
                .in_flight
                .remove(hash);
        }
        if let Some(hash) = &trace.awaiting_parent {
            self.links[self.partition(hash)].lock().unwrap().early.remove(hash);
        }
    }
}

impl Default for TraceAssembler {
    fn default() -> Self {
        Self::new(AssemblerConfig::default())
    }
}
