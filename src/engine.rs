//! The engine handle: volume/tree registries, transaction commit
//! orchestration, checkpointing, background flusher and copier threads.
//!
//! Ownership is arena-and-handles: the engine owns the volume table,
//! the buffer pool, the journal and the transaction manager; everything
//! else refers to them through small integer handles or `Arc`s, never
//! back-pointers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exchange::{Exchange, TreeIo};
use crate::journal::{CommitPolicy, Journal, PageMapEntry};
use crate::recover;
pub use crate::recover::RecoveryStatus;
use crate::txn::{encode_op, Transaction, TxnManager, TxnOp, TX_SPILL_BYTES};
use crate::volume::Volume;
use crate::{PageAddr, Ts, TS_UNCOMMITTED};

enum CopierMsg {
    Checkpoint,
    Shutdown,
}

pub(crate) struct EngineInner {
    pub config: Config,
    pub journal: Arc<Journal>,
    pub pool: BufferPool,
    pub txns: TxnManager,
    pub volumes: Mutex<HashMap<String, Arc<Volume>>>,
    /// Serializes tree mutation: commit apply, recovery redo, tree
    /// creation, checkpoint quiesce.
    pub apply_lock: Mutex<()>,
    pub interrupted: AtomicBool,
    fatal: Mutex<Option<Ts>>,
    status: RecoveryStatus,
    shutdown: AtomicBool,
    /// Set once the journal is sealed at close; nothing may append past
    /// the JE record.
    sealed: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    copier_tx: Mutex<Option<mpsc::Sender<CopierMsg>>>,
}

/// Cloneable engine handle.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    /// Open (and if necessary recover) the engine rooted at
    /// `config.path`. Recovery runs to completion before any new work
    /// is accepted.
    pub fn open(config: Config) -> Result<Engine> {
        std::fs::create_dir_all(&config.path)?;
        let group_window = Duration::from_millis(config.group_commit_window_ms.max(1));

        let scan = recover::scan(&config.path, config.journal_file_size)?;
        let (engine, replay) = match scan {
            None => {
                let journal = Arc::new(Journal::create(
                    &config.path,
                    config.journal_file_size,
                    group_window,
                )?);
                let engine = Self::assemble(config, journal, 1, RecoveryStatus::Clean);
                (engine, Vec::new())
            }
            Some(scan) => {
                info!(
                    "recovery: {} volumes, {} mapped pages, {} transactions to redo ({:?})",
                    scan.volumes.len(),
                    scan.page_map.len(),
                    scan.committed.len(),
                    scan.status,
                );
                let mut by_id: HashMap<u64, Arc<Volume>> = HashMap::new();
                for (id, path) in &scan.volumes {
                    if !path.exists() {
                        warn!("recovery: volume file {} is gone", path.display());
                        continue;
                    }
                    let name = volume_name(path);
                    let volume = Volume::open(path, &name, config.page_size)?;
                    by_id.insert(*id, Arc::new(volume));
                }
                let mut recovered: Vec<(Arc<Volume>, PageAddr, PageMapEntry)> = Vec::new();
                for entry in &scan.page_map {
                    let Some(volume) = by_id.get(&entry.volume_id) else { continue };
                    recovered.push((
                        Arc::clone(volume),
                        entry.page,
                        PageMapEntry { ts: entry.ts, addr: entry.addr },
                    ));
                }
                let journal = Arc::new(Journal::resume(
                    &config.path,
                    config.journal_file_size,
                    group_window,
                    scan.next_seq,
                    scan.last_ckpt_ts,
                    recovered,
                )?);
                let engine = Self::assemble(config, journal, scan.max_ts + 1, scan.status);
                {
                    let mut volumes = engine.inner.volumes.lock().expect("volume table");
                    for volume in by_id.values() {
                        volumes.insert(volume.name().to_string(), Arc::clone(volume));
                    }
                }
                let mut replay = scan.committed;
                replay.sort_by_key(|t| t.commit_ts);
                (engine, replay)
            }
        };

        // Redo committed transactions past the last checkpoint, in
        // commit order, then re-establish a consistent checkpoint.
        if !replay.is_empty() {
            let guard = engine.inner.apply_lock.lock().expect("apply lock");
            for txn in &replay {
                engine.apply_recovered(txn)?;
            }
            drop(guard);
        }
        engine.checkpoint()?;
        engine.spawn_background();
        Ok(engine)
    }

    fn assemble(config: Config, journal: Arc<Journal>, initial_ts: Ts, status: RecoveryStatus) -> Engine {
        let pool = BufferPool::new(config.page_size, config.buffer_pool_bytes, Arc::clone(&journal));
        Engine {
            inner: Arc::new(EngineInner {
                txns: TxnManager::new(initial_ts),
                pool,
                journal,
                volumes: Mutex::new(HashMap::new()),
                apply_lock: Mutex::new(()),
                interrupted: AtomicBool::new(false),
                fatal: Mutex::new(None),
                status,
                shutdown: AtomicBool::new(false),
                sealed: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
                copier_tx: Mutex::new(None),
                config,
            }),
        }
    }

    pub fn recovery_status(&self) -> RecoveryStatus {
        self.inner.status
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // -------- volumes and exchanges --------

    /// Open (creating on first use) the named volume in the engine
    /// directory.
    pub fn open_volume(&self, name: &str) -> Result<Arc<Volume>> {
        self.check_fatal()?;
        let mut volumes = self.inner.volumes.lock().expect("volume table");
        if let Some(v) = volumes.get(name) {
            return Ok(Arc::clone(v));
        }
        let path = self.inner.config.path.join(format!("{name}.vol"));
        let volume = if path.exists() {
            Volume::open(&path, name, self.inner.config.page_size)?
        } else {
            Volume::create(&path, name, self.inner.config.page_size)?
        };
        let volume = Arc::new(volume);
        self.inner.journal.volume_handle(&volume)?;
        volumes.insert(name.to_string(), Arc::clone(&volume));
        Ok(volume)
    }

    pub fn volume(&self, name: &str) -> Result<Arc<Volume>> {
        let volumes = self.inner.volumes.lock().expect("volume table");
        volumes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::VolumeNotFound(name.to_string()))
    }

    /// Bind an exchange to (volume, tree), creating the tree when asked.
    pub fn exchange(&self, volume: &Arc<Volume>, tree: &str, create: bool) -> Result<Exchange> {
        self.check_fatal()?;
        let vh = self.inner.journal.volume_handle(volume)?;
        let th = self.inner.journal.tree_handle(vh, tree)?;
        if volume.tree_meta(tree).is_none() {
            if !create {
                return Err(Error::TreeNotFound(tree.to_string()));
            }
            let _guard = self.inner.apply_lock.lock().expect("apply lock");
            if volume.tree_meta(tree).is_none() {
                let io = TreeIo::new(&self.inner.pool, volume, vh, tree);
                io.ensure_root(self.inner.txns.current_ts())?;
            }
        }
        Ok(Exchange::new(self.clone(), Arc::clone(volume), vh, tree.to_string(), th))
    }

    /// Buffer removal of a whole volume (journaled as DV): its file,
    /// cached pages and directory entry go at commit.
    pub fn remove_volume(&self, volume: &Arc<Volume>, txn: &mut Transaction) -> Result<()> {
        txn.check_active()?;
        let vh = self.inner.journal.volume_handle(volume)?;
        txn.record_remove_volume(vh);
        Ok(())
    }

    // -------- transactions --------

    pub fn begin(&self) -> Result<Transaction> {
        self.check_fatal()?;
        Ok(self.inner.txns.begin())
    }

    /// Commit with the engine's default policy.
    pub fn commit(&self, txn: &mut Transaction) -> Result<()> {
        self.commit_with(txn, self.inner.config.default_commit_policy)
    }

    /// Commit: mint the commit timestamp, journal the TX envelope,
    /// achieve the requested durability, then apply the buffered ops to
    /// the trees. Readers observing a timestamp at or above the commit
    /// timestamp see the update once this returns.
    pub fn commit_with(&self, txn: &mut Transaction, policy: CommitPolicy) -> Result<()> {
        self.check_fatal()?;
        txn.check_active()?;
        if txn.depth() > 1 {
            // outermost commit does the work.
            return Ok(());
        }

        let commit_ts = self.inner.txns.next_ts();
        if !txn.ops.is_empty() {
            // Chunk at sub-record boundaries; interim chunks carry the
            // uncommitted marker and chain through prev_record_addr.
            let mut chunks: Vec<Vec<u8>> = vec![Vec::new()];
            for op in &txn.ops {
                let mut one = Vec::new();
                encode_op(&mut one, op);
                let tail = chunks.last_mut().expect("chunk");
                if !tail.is_empty() && tail.len() + one.len() > TX_SPILL_BYTES {
                    chunks.push(one);
                } else {
                    tail.extend_from_slice(&one);
                }
            }
            let last = chunks.len() - 1;
            let mut prev = 0u64;
            let mut end_addr = 0u64;
            for (i, chunk) in chunks.iter().enumerate() {
                let cts = if i == last { commit_ts } else { TS_UNCOMMITTED };
                let at = self
                    .inner
                    .journal
                    .append_transaction(txn.start_ts(), cts, prev, chunk)?;
                prev = at;
                end_addr = at + 1;
            }
            let sync = self.inner.journal.sync(end_addr, policy);
            self.note_fatal(sync)?;

            let guard = self.inner.apply_lock.lock().expect("apply lock");
            let apply = self.apply_ops(&txn.ops, commit_ts);
            drop(guard);
            self.note_fatal(apply)?;
        }

        txn.mark_committed(commit_ts);
        for listener in &txn.listeners {
            listener.committed(commit_ts);
        }
        Ok(())
    }

    /// Explicit abort. Buffered updates are discarded; nothing reached
    /// the trees.
    pub fn rollback(&self, txn: &mut Transaction) -> Result<()> {
        txn.check_active()?;
        txn.mark_aborted();
        for listener in &txn.listeners {
            listener.rolled_back();
        }
        Ok(())
    }

    /// Close one begin level. At the outermost level an uncommitted
    /// transaction rolls back implicitly, claims release and the
    /// transaction leaves the active set.
    pub fn end(&self, txn: &mut Transaction) -> Result<()> {
        if txn.close_level()? {
            if txn.is_active() {
                txn.mark_aborted();
                for listener in &txn.listeners {
                    listener.rolled_back();
                }
            }
            self.inner.txns.finish(txn);
        }
        Ok(())
    }

    // -------- apply --------

    pub(crate) fn apply_ops(&self, ops: &[TxnOp], commit_ts: Ts) -> Result<()> {
        for op in ops {
            self.apply_op(op, commit_ts)?;
        }
        Ok(())
    }

    fn apply_op(&self, op: &TxnOp, commit_ts: Ts) -> Result<()> {
        let inner = &*self.inner;
        match op {
            TxnOp::Store { tree, key, value } => {
                let (io_volume, vh, name) = self.resolve_tree(*tree)?;
                let io = TreeIo::new(&inner.pool, &io_volume, vh, &name);
                io.ensure_root(commit_ts)?;
                let preimage = io.fetch(key)?;
                inner.txns.record_overwrite(*tree, key, commit_ts, preimage);
                io.store(key, value, commit_ts)?;
            }
            TxnOp::Remove { tree, key } => {
                let (io_volume, vh, name) = self.resolve_tree(*tree)?;
                let io = TreeIo::new(&inner.pool, &io_volume, vh, &name);
                if io.root().is_none() {
                    return Ok(());
                }
                let preimage = io.fetch(key)?;
                if preimage.is_some() {
                    inner.txns.record_overwrite(*tree, key, commit_ts, preimage);
                    io.remove(key, commit_ts)?;
                }
            }
            TxnOp::RemoveRange { tree, key1, key2 } => {
                let (io_volume, vh, name) = self.resolve_tree(*tree)?;
                let io = TreeIo::new(&inner.pool, &io_volume, vh, &name);
                if io.root().is_none() {
                    return Ok(());
                }
                let mut bound = key1.clone();
                let mut inclusive = true;
                loop {
                    let Some((k, v)) = io.next_entry(&bound, inclusive)? else { break };
                    if k.as_slice() >= key2.as_slice() {
                        break;
                    }
                    inner.txns.record_overwrite(*tree, &k, commit_ts, Some(v));
                    io.remove(&k, commit_ts)?;
                    bound = k;
                    inclusive = false;
                }
            }
            TxnOp::RemoveTree { tree } => {
                let (io_volume, vh, name) = self.resolve_tree(*tree)?;
                let io = TreeIo::new(&inner.pool, &io_volume, vh, &name);
                io.remove_tree(commit_ts)?;
            }
            TxnOp::RemoveVolume { volume } => {
                let Some(io_volume) = inner.journal.volume_for_handle(*volume) else {
                    return Ok(());
                };
                inner.pool.invalidate_volume(*volume)?;
                inner
                    .volumes
                    .lock()
                    .expect("volume table")
                    .remove(io_volume.name());
                std::fs::remove_file(io_volume.path())?;
                info!("volume {} removed", io_volume.name());
            }
            TxnOp::Delta { tree, index, kind, value, .. } => {
                let (io_volume, vh, name) = self.resolve_tree(*tree)?;
                let io = TreeIo::new(&inner.pool, &io_volume, vh, &name);
                io.ensure_root(commit_ts)?;
                io_volume.update_tree(&name, |t| {
                    t.accumulators[*index as usize % crate::tree::ACCUMULATOR_SLOTS]
                        .apply(*kind, *value)
                })?;
            }
        }
        Ok(())
    }

    fn resolve_tree(&self, th: crate::TreeHandle) -> Result<(Arc<Volume>, crate::VolumeHandle, String)> {
        let (vh, name) = self
            .inner
            .journal
            .tree_for_handle(th)
            .ok_or_else(|| Error::TreeNotFound(format!("handle {th}")))?;
        let volume = self
            .inner
            .journal
            .volume_for_handle(vh)
            .ok_or_else(|| Error::VolumeNotFound(format!("handle {vh}")))?;
        Ok((volume, vh, name))
    }

    fn apply_recovered(&self, txn: &recover::RecoveredTxn) -> Result<()> {
        for op in &txn.ops {
            let Some(resolved) = self.resolve_recovered(op)? else { continue };
            self.apply_op(&resolved, txn.commit_ts)?;
        }
        Ok(())
    }

    /// Map a scanned op (volume ids + tree names) onto live handles.
    /// Ops against volumes that no longer exist are skipped.
    fn resolve_recovered(&self, op: &recover::RecoveredOp) -> Result<Option<TxnOp>> {
        let volume_of = |id: u64| -> Option<Arc<Volume>> {
            let volumes = self.inner.volumes.lock().expect("volume table");
            volumes.values().find(|v| v.id() == id).cloned()
        };
        let handle_of = |volume: &Arc<Volume>, tree: &str| -> Result<crate::TreeHandle> {
            let vh = self.inner.journal.volume_handle(volume)?;
            self.inner.journal.tree_handle(vh, tree)
        };
        Ok(match op {
            recover::RecoveredOp::Store { volume_id, tree, key, value } => {
                let Some(v) = volume_of(*volume_id) else { return Ok(None) };
                Some(TxnOp::Store {
                    tree: handle_of(&v, tree)?,
                    key: key.clone(),
                    value: value.clone(),
                })
            }
            recover::RecoveredOp::RemoveRange { volume_id, tree, key1, key2 } => {
                let Some(v) = volume_of(*volume_id) else { return Ok(None) };
                Some(TxnOp::RemoveRange {
                    tree: handle_of(&v, tree)?,
                    key1: key1.clone(),
                    key2: key2.clone(),
                })
            }
            recover::RecoveredOp::RemoveTree { volume_id, tree } => {
                let Some(v) = volume_of(*volume_id) else { return Ok(None) };
                Some(TxnOp::RemoveTree { tree: handle_of(&v, tree)? })
            }
            recover::RecoveredOp::RemoveVolume { volume_id } => {
                let Some(v) = volume_of(*volume_id) else { return Ok(None) };
                let vh = self.inner.journal.volume_handle(&v)?;
                Some(TxnOp::RemoveVolume { volume: vh })
            }
            recover::RecoveredOp::Delta { volume_id, tree, index, kind, value } => {
                let Some(v) = volume_of(*volume_id) else { return Ok(None) };
                Some(TxnOp::Delta {
                    tree: handle_of(&v, tree)?,
                    index: *index,
                    kind: *kind,
                    value: *value,
                    explicit: true,
                })
            }
        })
    }

    // -------- checkpoint / background --------

    /// Flush every page with timestamp ≤ now into the journal, persist
    /// volume heads, and emit the CP record certifying both.
    pub fn checkpoint(&self) -> Result<Ts> {
        let _guard = self.inner.apply_lock.lock().expect("apply lock");
        let ts = self.inner.txns.current_ts();
        if self.inner.sealed.load(Ordering::Acquire) {
            return Ok(ts);
        }
        self.inner.pool.flush_dirty(ts)?;
        {
            let volumes = self.inner.volumes.lock().expect("volume table");
            for volume in volumes.values() {
                volume.write_head()?;
                volume.sync()?;
            }
        }
        self.inner.journal.append_checkpoint(ts)?;
        if let Some(tx) = self.inner.copier_tx.lock().expect("copier tx").as_ref() {
            let _ = tx.send(CopierMsg::Checkpoint);
        }
        Ok(ts)
    }

    fn spawn_background(&self) {
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let flush_interval = Duration::from_millis(
            self.inner.config.journal_flush_interval_ms.max(1),
        );
        let ckpt_interval = Duration::from_millis(self.inner.config.checkpoint_interval_ms.max(1));

        let flusher_weak = weak.clone();
        let flusher = std::thread::spawn(move || {
            let mut last_ckpt = Instant::now();
            loop {
                std::thread::sleep(flush_interval);
                let Some(inner) = flusher_weak.upgrade() else { break };
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = inner.journal.flush() {
                    warn!("journal flush: {e}");
                }
                if last_ckpt.elapsed() >= ckpt_interval {
                    last_ckpt = Instant::now();
                    let engine = Engine { inner };
                    if let Err(e) = engine.checkpoint() {
                        warn!("background checkpoint: {e}");
                    }
                }
            }
        });

        let (tx, rx) = mpsc::channel::<CopierMsg>();
        let copier_weak = weak;
        let copier = std::thread::spawn(move || loop {
            let msg = rx.recv_timeout(Duration::from_millis(500));
            let Some(inner) = copier_weak.upgrade() else { break };
            match msg {
                Ok(CopierMsg::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let _ = inner.journal.copy_back();
                    break;
                }
                Ok(CopierMsg::Checkpoint) | Err(mpsc::RecvTimeoutError::Timeout) => {
                    if let Err(e) = inner.journal.copy_back() {
                        warn!("copy-back: {e}");
                    }
                }
            }
        });

        *self.inner.copier_tx.lock().expect("copier tx") = Some(tx);
        let mut threads = self.inner.threads.lock().expect("thread table");
        threads.push(flusher);
        threads.push(copier);
    }

    /// Clean close: final checkpoint, full copy-back, journal seal.
    pub fn close(&self) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let checkpoint = self.checkpoint();
        {
            // the apply lock orders the seal after any in-flight
            // background checkpoint; later ones see `sealed` and no-op.
            let _guard = self.inner.apply_lock.lock().expect("apply lock");
            self.inner.sealed.store(true, Ordering::Release);
            if self.inner.fatal.lock().expect("fatal flag").is_none() {
                checkpoint?;
                self.inner.journal.copy_back()?;
                self.inner.journal.seal()?;
            }
        }
        if let Some(tx) = self.inner.copier_tx.lock().expect("copier tx").take() {
            let _ = tx.send(CopierMsg::Shutdown);
        }
        let threads: Vec<JoinHandle<()>> =
            self.inner.threads.lock().expect("thread table").drain(..).collect();
        for t in threads {
            let _ = t.join();
        }
        Ok(())
    }

    // -------- interruption / fatal state --------

    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
    }

    pub fn clear_interrupt(&self) {
        self.inner.interrupted.store(false, Ordering::Release);
    }

    pub(crate) fn check_interrupted(&self) -> Result<()> {
        if self.inner.interrupted.load(Ordering::Acquire) {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    fn check_fatal(&self) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::IllegalTransactionState("engine closed"));
        }
        if let Some(ts) = *self.inner.fatal.lock().expect("fatal flag") {
            return Err(Error::Fatal(ts));
        }
        Ok(())
    }

    /// Record corruption-class failures: the engine goes read-only and
    /// refuses new transactions until restart.
    fn note_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            if e.is_fatal() {
                let mut fatal = self.inner.fatal.lock().expect("fatal flag");
                if fatal.is_none() {
                    *fatal = Some(self.inner.txns.current_ts());
                    warn!("engine fatal: {e}");
                }
            }
        }
        result
    }
}

fn volume_name(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
