//! Transactions: timestamps, write sets, conflict claims, snapshot
//! overlay.
//!
//! A `Transaction` is an explicit value threaded through the API, not a
//! thread-local. Writes buffer in the transaction (chronological op log
//! plus per-tree lookup structures for read-your-writes) and reach the
//! trees only after the TX record is appended to the journal, which is
//! what makes recovery's "whole TX record present means committed" rule
//! sound.
//!
//! Conflicts are write-write: storing a key claims it in a lock-striped
//! claim table. A claim held by another live transaction, or a key last
//! committed after the claimant's start timestamp, surfaces `Rollback`
//! for the caller to retry. Claims release at `end`.
//!
//! Snapshot reads: when a commit overwrites a key it records the
//! pre-image in the version overlay, tagged with the commit timestamp.
//! A reader started at `s` resolves a key through the oldest overlay
//! entry with tag > `s`; the overlay prunes at the oldest active start
//! timestamp.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::tree::AccumulatorKind;
use crate::wire;
use crate::{Ts, TreeHandle, VolumeHandle};

pub use crate::journal::CommitPolicy;

use crate::journal::{SUB_D0, SUB_D1, SUB_DR, SUB_DT, SUB_DV, SUB_HEADER_SIZE, SUB_SR};

/// Claim-table stripe count (timestamp mod N distribution).
const CLAIM_STRIPES: usize = 64;

/// Spill threshold: a transaction whose encoded sub-records exceed this
/// is journaled in chained chunks.
pub const TX_SPILL_BYTES: usize = 64 * 1024;

/// Called after commit durability or rollback. Listeners must not throw
/// and must not run further transactional work on the same executor.
pub trait CommitListener: Send {
    fn committed(&self, commit_ts: Ts);
    fn rolled_back(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// One buffered update, in execution order. The order is preserved into
/// the journal sub-record stream and during commit-time apply.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOp {
    Store { tree: TreeHandle, key: Vec<u8>, value: Vec<u8> },
    Remove { tree: TreeHandle, key: Vec<u8> },
    /// Half-open range [key1, key2).
    RemoveRange { tree: TreeHandle, key1: Vec<u8>, key2: Vec<u8> },
    RemoveTree { tree: TreeHandle },
    RemoveVolume { volume: VolumeHandle },
    Delta { tree: TreeHandle, index: u16, kind: AccumulatorKind, value: i64, explicit: bool },
}

#[derive(Default)]
pub struct TreeWrites {
    /// Latest buffered state per key: Some = stored value, None =
    /// removed. Range removals clear covered entries, so a later put
    /// always wins.
    pub puts: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pub ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

impl TreeWrites {
    pub fn in_removed_range(&self, key: &[u8]) -> bool {
        self.ranges
            .iter()
            .any(|(k1, k2)| key >= k1.as_slice() && key < k2.as_slice())
    }

    /// Read-your-writes resolution: Some(Some(v)) stored, Some(None)
    /// removed, None untouched by this transaction.
    pub fn resolve(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        if let Some(slot) = self.puts.get(key) {
            return Some(slot.as_deref());
        }
        if self.in_removed_range(key) {
            return Some(None);
        }
        None
    }
}

pub struct Transaction {
    start_ts: Ts,
    depth: u32,
    state: TxnState,
    commit_ts: Option<Ts>,
    pub(crate) ops: Vec<TxnOp>,
    pub(crate) trees: HashMap<TreeHandle, TreeWrites>,
    pub(crate) claims: Vec<(TreeHandle, Vec<u8>)>,
    pub(crate) listeners: Vec<Box<dyn CommitListener>>,
}

impl Transaction {
    fn new(start_ts: Ts) -> Transaction {
        Transaction {
            start_ts,
            depth: 1,
            state: TxnState::Active,
            commit_ts: None,
            ops: Vec::new(),
            trees: HashMap::new(),
            claims: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn start_ts(&self) -> Ts {
        self.start_ts
    }

    pub fn commit_ts(&self) -> Option<Ts> {
        self.commit_ts
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Nested begin: no new timestamp, just depth.
    pub fn begin(&mut self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::IllegalTransactionState("begin after commit/rollback"));
        }
        self.depth += 1;
        Ok(())
    }

    pub fn add_listener(&mut self, listener: Box<dyn CommitListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn check_active(&self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::IllegalTransactionState("update outside an active transaction"));
        }
        Ok(())
    }

    pub(crate) fn writes(&self, tree: TreeHandle) -> Option<&TreeWrites> {
        self.trees.get(&tree)
    }

    pub(crate) fn record_store(&mut self, tree: TreeHandle, key: Vec<u8>, value: Vec<u8>) {
        let writes = self.trees.entry(tree).or_default();
        writes.puts.insert(key.clone(), Some(value.clone()));
        self.ops.push(TxnOp::Store { tree, key, value });
    }

    pub(crate) fn record_remove(&mut self, tree: TreeHandle, key: Vec<u8>) {
        let writes = self.trees.entry(tree).or_default();
        writes.puts.insert(key.clone(), None);
        self.ops.push(TxnOp::Remove { tree, key });
    }

    pub(crate) fn record_remove_range(&mut self, tree: TreeHandle, key1: Vec<u8>, key2: Vec<u8>) {
        let writes = self.trees.entry(tree).or_default();
        let covered: Vec<Vec<u8>> = writes
            .puts
            .range(key1.clone()..key2.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for k in covered {
            writes.puts.remove(&k);
        }
        writes.ranges.push((key1.clone(), key2.clone()));
        self.ops.push(TxnOp::RemoveRange { tree, key1, key2 });
    }

    pub(crate) fn record_delta(
        &mut self,
        tree: TreeHandle,
        index: u16,
        kind: AccumulatorKind,
        value: i64,
        explicit: bool,
    ) {
        self.ops.push(TxnOp::Delta { tree, index, kind, value, explicit });
    }

    pub(crate) fn record_remove_tree(&mut self, tree: TreeHandle) {
        self.trees.remove(&tree);
        self.ops.push(TxnOp::RemoveTree { tree });
    }

    pub(crate) fn record_remove_volume(&mut self, volume: VolumeHandle) {
        self.ops.push(TxnOp::RemoveVolume { volume });
    }

    /// Sum of this transaction's buffered deltas for one accumulator
    /// (read-your-writes for accumulator reads).
    pub(crate) fn delta_sum(&self, tree: TreeHandle, index: u16) -> i64 {
        self.ops
            .iter()
            .filter_map(|op| match op {
                TxnOp::Delta { tree: t, index: i, value, .. }
                    if *t == tree && *i == index =>
                {
                    Some(*value)
                }
                _ => None,
            })
            .sum()
    }

    pub(crate) fn mark_committed(&mut self, commit_ts: Ts) {
        self.state = TxnState::Committed;
        self.commit_ts = Some(commit_ts);
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.state = TxnState::Aborted;
    }

    /// Close one nesting level; true when the outermost level closed and
    /// the manager should finalize.
    pub(crate) fn close_level(&mut self) -> Result<bool> {
        if self.depth == 0 {
            return Err(Error::IllegalTransactionState("end without begin"));
        }
        self.depth -= 1;
        Ok(self.depth == 0)
    }
}

#[derive(Default, Clone, Copy)]
struct ClaimState {
    /// Start timestamp of the owning live transaction, 0 when free.
    owner: Ts,
    /// Commit timestamp of the last committed write to this key.
    last_commit: Ts,
}

/// Global transaction bookkeeping: the timestamp clock, the claim
/// table, the active set and the version overlay.
pub struct TxnManager {
    clock: AtomicU64,
    stripes: Vec<Mutex<HashMap<(TreeHandle, Vec<u8>), ClaimState>>>,
    active: Mutex<BTreeSet<Ts>>,
    overlay: Mutex<HashMap<(TreeHandle, Vec<u8>), Vec<(Ts, Option<Vec<u8>>)>>>,
}

impl TxnManager {
    pub fn new(initial_ts: Ts) -> TxnManager {
        TxnManager {
            clock: AtomicU64::new(initial_ts.max(1)),
            stripes: (0..CLAIM_STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
            active: Mutex::new(BTreeSet::new()),
            overlay: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_ts(&self) -> Ts {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_ts(&self) -> Ts {
        self.clock.load(Ordering::SeqCst)
    }

    /// Advance the clock past a timestamp observed during recovery.
    pub fn advance_past(&self, ts: Ts) {
        let mut cur = self.clock.load(Ordering::SeqCst);
        while cur <= ts {
            match self.clock.compare_exchange(cur, ts + 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(now) => cur = now,
            }
        }
    }

    pub fn begin(&self) -> Transaction {
        let start_ts = self.next_ts();
        self.active.lock().expect("active set").insert(start_ts);
        Transaction::new(start_ts)
    }

    pub fn oldest_active(&self) -> Option<Ts> {
        self.active.lock().expect("active set").first().copied()
    }

    fn stripe(&self, tree: TreeHandle, key: &[u8]) -> &Mutex<HashMap<(TreeHandle, Vec<u8>), ClaimState>> {
        let mut hasher = DefaultHasher::new();
        tree.hash(&mut hasher);
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % CLAIM_STRIPES]
    }

    /// Claim (tree, key) for the writing transaction. `Rollback` when
    /// another live transaction holds the claim, or when the key was
    /// committed after the claimant started (first committer wins).
    pub fn claim(&self, txn: &mut Transaction, tree: TreeHandle, key: &[u8]) -> Result<()> {
        txn.check_active()?;
        let mut stripe = self.stripe(tree, key).lock().expect("claim stripe");
        let state = stripe.entry((tree, key.to_vec())).or_default();
        if state.owner != 0 && state.owner != txn.start_ts {
            return Err(Error::Rollback);
        }
        if state.last_commit > txn.start_ts {
            return Err(Error::Rollback);
        }
        if state.owner == 0 {
            state.owner = txn.start_ts;
            txn.claims.push((tree, key.to_vec()));
        }
        Ok(())
    }

    /// Release a finished transaction's claims. For a committed
    /// transaction the claim entries keep its commit timestamp for
    /// first-committer-wins checks until the overlay horizon passes.
    fn release_claims(&self, txn: &Transaction, commit_ts: Option<Ts>) {
        let horizon = self.oldest_active().unwrap_or(Ts::MAX);
        for (tree, key) in &txn.claims {
            let mut stripe = self.stripe(*tree, key).lock().expect("claim stripe");
            let entry_key = (*tree, key.clone());
            let mut drop_entry = false;
            if let Some(state) = stripe.get_mut(&entry_key) {
                if state.owner == txn.start_ts {
                    state.owner = 0;
                }
                if let Some(cts) = commit_ts {
                    state.last_commit = state.last_commit.max(cts);
                }
                drop_entry = state.owner == 0 && state.last_commit < horizon;
            }
            if drop_entry {
                stripe.remove(&entry_key);
            }
        }
    }

    /// Record the pre-image of a key a commit is about to overwrite.
    pub fn record_overwrite(
        &self,
        tree: TreeHandle,
        key: &[u8],
        commit_ts: Ts,
        preimage: Option<Vec<u8>>,
    ) {
        // No overlay entry needed if nobody can ever read below the
        // commit: every active transaction started after it.
        match self.oldest_active() {
            Some(oldest) if oldest < commit_ts => {}
            _ => return,
        }
        let mut overlay = self.overlay.lock().expect("version overlay");
        overlay
            .entry((tree, key.to_vec()))
            .or_default()
            .push((commit_ts, preimage));
    }

    /// Resolve `key` as of `start_ts`. Some(x) when the overlay knows
    /// the key changed after `start_ts` (x is the value back then);
    /// None when the current tree state is the right answer.
    pub fn snapshot_value(
        &self,
        tree: TreeHandle,
        key: &[u8],
        start_ts: Ts,
    ) -> Option<Option<Vec<u8>>> {
        let overlay = self.overlay.lock().expect("version overlay");
        let versions = overlay.get(&(tree, key.to_vec()))?;
        versions
            .iter()
            .filter(|(overwritten_at, _)| *overwritten_at > start_ts)
            .min_by_key(|(overwritten_at, _)| *overwritten_at)
            .map(|(_, preimage)| preimage.clone())
    }

    /// Finish a transaction at its outermost `end`: release claims,
    /// drop it from the active set, prune the overlay horizon.
    pub fn finish(&self, txn: &Transaction) {
        self.active.lock().expect("active set").remove(&txn.start_ts);
        self.release_claims(txn, txn.commit_ts);
        self.prune_overlay();
    }

    fn prune_overlay(&self) {
        let horizon = self.oldest_active().unwrap_or(Ts::MAX);
        let mut overlay = self.overlay.lock().expect("version overlay");
        overlay.retain(|_, versions| {
            versions.retain(|(overwritten_at, _)| *overwritten_at > horizon);
            !versions.is_empty()
        });
    }

    /// Number of live overlay versions (tests).
    pub fn overlay_len(&self) -> usize {
        self.overlay.lock().expect("version overlay").values().map(Vec::len).sum()
    }
}

// -------- journal sub-record codec --------

fn push_sub_header(out: &mut Vec<u8>, kind: u16, payload_len: usize) {
    let mut head = [0u8; SUB_HEADER_SIZE];
    wire::put_u32(&mut head[..4], (SUB_HEADER_SIZE + payload_len) as u32);
    wire::put_u16(&mut head[4..6], kind);
    out.extend_from_slice(&head);
}

/// Encode one op as a journal sub-record.
pub fn encode_op(out: &mut Vec<u8>, op: &TxnOp) {
    match op {
        TxnOp::Store { tree, key, value } => {
            push_sub_header(out, SUB_SR, 6 + key.len() + value.len());
            let mut buf = [0u8; 4];
            wire::put_u32(&mut buf, *tree);
            out.extend_from_slice(&buf);
            wire::put_u16(&mut buf[..2], key.len() as u16);
            out.extend_from_slice(&buf[..2]);
            out.extend_from_slice(key);
            out.extend_from_slice(value);
        }
        TxnOp::Remove { tree, key } => {
            // a single-key removal is the degenerate range [k, k∥0x00):
            // no valid key sorts strictly between them.
            let mut key2 = key.clone();
            key2.push(0);
            encode_op(out, &TxnOp::RemoveRange { tree: *tree, key1: key.clone(), key2 });
        }
        TxnOp::RemoveRange { tree, key1, key2 } => {
            let elision = crate::page::lcp(key1, key2).min(key2.len());
            let tail = &key2[elision..];
            push_sub_header(out, SUB_DR, 8 + key1.len() + tail.len());
            let mut buf = [0u8; 4];
            wire::put_u32(&mut buf, *tree);
            out.extend_from_slice(&buf);
            wire::put_u16(&mut buf[..2], key1.len() as u16);
            out.extend_from_slice(&buf[..2]);
            wire::put_u16(&mut buf[..2], elision as u16);
            out.extend_from_slice(&buf[..2]);
            out.extend_from_slice(key1);
            out.extend_from_slice(tail);
        }
        TxnOp::RemoveTree { tree } => {
            push_sub_header(out, SUB_DT, 4);
            let mut buf = [0u8; 4];
            wire::put_u32(&mut buf, *tree);
            out.extend_from_slice(&buf);
        }
        TxnOp::RemoveVolume { volume } => {
            push_sub_header(out, SUB_DV, 4);
            let mut buf = [0u8; 4];
            wire::put_u32(&mut buf, *volume);
            out.extend_from_slice(&buf);
        }
        TxnOp::Delta { tree, index, kind, value, explicit } => {
            if *explicit {
                push_sub_header(out, SUB_D1, 16);
            } else {
                push_sub_header(out, SUB_D0, 8);
            }
            let mut buf = [0u8; 8];
            wire::put_u32(&mut buf[..4], *tree);
            out.extend_from_slice(&buf[..4]);
            wire::put_u16(&mut buf[..2], *index);
            out.extend_from_slice(&buf[..2]);
            wire::put_u16(&mut buf[..2], *kind as u16);
            out.extend_from_slice(&buf[..2]);
            if *explicit {
                wire::put_i64(&mut buf, *value);
                out.extend_from_slice(&buf);
            }
        }
    }
}

pub fn encode_ops(ops: &[TxnOp]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        encode_op(&mut out, op);
    }
    out
}

/// Decode a sub-record stream back into ops (recovery redo).
pub fn decode_ops(mut buf: &[u8]) -> Result<Vec<TxnOp>> {
    let mut ops = Vec::new();
    while !buf.is_empty() {
        if buf.len() < SUB_HEADER_SIZE {
            return Err(Error::CorruptJournal("sub-record header truncated".into()));
        }
        let len = wire::get_u32(buf) as usize;
        let kind = wire::get_u16(&buf[4..]);
        if len < SUB_HEADER_SIZE || len > buf.len() {
            return Err(Error::CorruptJournal(format!("sub-record length {len}")));
        }
        let payload = &buf[SUB_HEADER_SIZE..len];
        match kind {
            SUB_SR => {
                if payload.len() < 6 {
                    return Err(Error::CorruptJournal("SR payload".into()));
                }
                let tree = wire::get_u32(payload);
                let key_size = wire::get_u16(&payload[4..]) as usize;
                if 6 + key_size > payload.len() {
                    return Err(Error::CorruptJournal("SR key size".into()));
                }
                ops.push(TxnOp::Store {
                    tree,
                    key: payload[6..6 + key_size].to_vec(),
                    value: payload[6 + key_size..].to_vec(),
                });
            }
            SUB_DR => {
                if payload.len() < 8 {
                    return Err(Error::CorruptJournal("DR payload".into()));
                }
                let tree = wire::get_u32(payload);
                let key1_size = wire::get_u16(&payload[4..]) as usize;
                let elision = wire::get_u16(&payload[6..]) as usize;
                if 8 + key1_size > payload.len() || elision > key1_size {
                    return Err(Error::CorruptJournal("DR key sizes".into()));
                }
                let key1 = payload[8..8 + key1_size].to_vec();
                let mut key2 = key1[..elision].to_vec();
                key2.extend_from_slice(&payload[8 + key1_size..]);
                ops.push(TxnOp::RemoveRange { tree, key1, key2 });
            }
            SUB_DT => {
                if payload.len() < 4 {
                    return Err(Error::CorruptJournal("DT payload".into()));
                }
                ops.push(TxnOp::RemoveTree { tree: wire::get_u32(payload) });
            }
            SUB_DV => {
                if payload.len() < 4 {
                    return Err(Error::CorruptJournal("DV payload".into()));
                }
                ops.push(TxnOp::RemoveVolume { volume: wire::get_u32(payload) });
            }
            SUB_D0 | SUB_D1 => {
                let explicit = kind == SUB_D1;
                let need = if explicit { 16 } else { 8 };
                if payload.len() < need {
                    return Err(Error::CorruptJournal("delta payload".into()));
                }
                let tree = wire::get_u32(payload);
                let index = wire::get_u16(&payload[4..]);
                let acc_kind = AccumulatorKind::from_u16(wire::get_u16(&payload[6..]))?;
                let value = if explicit { wire::get_i64(&payload[8..]) } else { 1 };
                ops.push(TxnOp::Delta { tree, index, kind: acc_kind, value, explicit });
            }
            other => {
                return Err(Error::CorruptJournal(format!("sub-record type {other:#06x}")));
            }
        }
        buf = &buf[len..];
    }
    Ok(ops)
}
