//! Write-ahead journal: an append-only record stream across bounded
//! files of equal size.
//!
//! Record envelope, offsets relative to the record's journal address:
//!
//! ```text
//! | length:u32 | type:u16 | reserved:u16 | timestamp:u64 | payload |
//! ```
//!
//! A journal address is the byte offset of a record's first byte in the
//! logical stream: file sequence * file size + offset in file, so
//! records never span files. Each file opens with a JH record and, on
//! rollover, closes with PM (page map), TM (transaction map) and JE.
//! Volume and tree handles are scoped to one file and re-issued (IV/IT)
//! after every rollover.
//!
//! The append path is a single-writer monitor; the monitor is released
//! before any fsync so readers of the current address never wait on disk
//! I/O. Copy-back promotes page images to their volumes in the
//! background and retires files wholly below the base address.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::page;
use crate::volume::Volume;
use crate::wire;
use crate::{JournalAddr, PageAddr, Ts, TreeHandle, VolumeHandle, TS_UNCOMMITTED};

pub const JOURNAL_FILE_PREFIX: &str = "journal.";
pub const JOURNAL_VERSION: u64 = 1;

pub const RECORD_HEADER_SIZE: usize = 16;
pub const SUB_HEADER_SIZE: usize = 8;

const fn type_code(a: u8, b: u8) -> u16 {
    ((a as u16) << 8) | b as u16
}

pub const TYPE_JH: u16 = type_code(b'J', b'H');
pub const TYPE_JE: u16 = type_code(b'J', b'E');
pub const TYPE_IV: u16 = type_code(b'I', b'V');
pub const TYPE_IT: u16 = type_code(b'I', b'T');
pub const TYPE_PA: u16 = type_code(b'P', b'A');
pub const TYPE_PM: u16 = type_code(b'P', b'M');
pub const TYPE_TM: u16 = type_code(b'T', b'M');
pub const TYPE_CP: u16 = type_code(b'C', b'P');
pub const TYPE_TX: u16 = type_code(b'T', b'X');

pub const SUB_SR: u16 = type_code(b'S', b'R');
pub const SUB_DR: u16 = type_code(b'D', b'R');
pub const SUB_DT: u16 = type_code(b'D', b'T');
pub const SUB_DV: u16 = type_code(b'D', b'V');
pub const SUB_D0: u16 = type_code(b'D', b'0');
pub const SUB_D1: u16 = type_code(b'D', b'1');

pub fn type_name(kind: u16) -> &'static str {
    match kind {
        TYPE_JH => "JH",
        TYPE_JE => "JE",
        TYPE_IV => "IV",
        TYPE_IT => "IT",
        TYPE_PA => "PA",
        TYPE_PM => "PM",
        TYPE_TM => "TM",
        TYPE_CP => "CP",
        TYPE_TX => "TX",
        _ => "??",
    }
}

/// Per-transaction durability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Return once the TX record is buffered; the background flusher
    /// makes it durable eventually.
    Soft,
    /// fsync the journal before returning.
    #[default]
    Hard,
    /// Batch committers inside the group window behind one fsync.
    Group,
}

#[derive(Debug, Clone, Copy)]
pub struct PageMapEntry {
    pub ts: Ts,
    pub addr: JournalAddr,
}

#[derive(Debug, Clone, Copy)]
pub struct TxnMapEntry {
    pub start_ts: Ts,
    pub commit_ts: Ts,
    pub journal_addr: JournalAddr,
    pub last_record_addr: JournalAddr,
}

pub struct RecordHeader {
    pub len: usize,
    pub kind: u16,
    pub ts: Ts,
}

/// Parse and sanity-check a record envelope.
pub fn parse_record_header(buf: &[u8]) -> Result<RecordHeader> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err(Error::CorruptJournal("record header truncated".into()));
    }
    let len = wire::get_u32(buf) as usize;
    let kind = wire::get_u16(&buf[4..]);
    let ts = wire::get_u64(&buf[8..]);
    if len < RECORD_HEADER_SIZE {
        return Err(Error::CorruptJournal(format!("record length {len}")));
    }
    match kind {
        TYPE_JH | TYPE_JE | TYPE_IV | TYPE_IT | TYPE_PA | TYPE_PM | TYPE_TM | TYPE_CP
        | TYPE_TX => {}
        other => {
            return Err(Error::CorruptJournal(format!("record type {other:#06x}")));
        }
    }
    Ok(RecordHeader { len, kind, ts })
}

struct JournalInner {
    /// Append handle of the current file.
    file: File,
    cur_addr: JournalAddr,
    base_addr: JournalAddr,
    journal_created: u64,
    file_created: u64,
    last_ckpt_ts: Ts,
    last_ckpt_addr: JournalAddr,
    /// Latest durable page image per page.
    page_map: HashMap<(VolumeHandle, PageAddr), PageMapEntry>,
    /// Transactions journaled but not yet retired by a checkpoint.
    txn_map: HashMap<Ts, TxnMapEntry>,
    /// Handle tables, re-issued into every file.
    volumes: Vec<(VolumeHandle, Arc<Volume>)>,
    trees: Vec<(TreeHandle, VolumeHandle, String)>,
    next_volume_handle: VolumeHandle,
    next_tree_handle: TreeHandle,
}

struct SyncState {
    synced_addr: JournalAddr,
    leader_active: bool,
}

pub struct Journal {
    dir: PathBuf,
    file_size: u64,
    group_window: Duration,
    inner: Mutex<JournalInner>,
    sync_state: Mutex<SyncState>,
    sync_cond: Condvar,
    /// Duplicate handle of the current file, used for fsync outside the
    /// append monitor. Swapped at rollover.
    sync_file: Mutex<File>,
}

pub fn file_name(seq: u64) -> String {
    format!("{JOURNAL_FILE_PREFIX}{seq:012x}")
}

pub fn file_seq(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(JOURNAL_FILE_PREFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Journal {
    /// Start a fresh journal at file sequence 0.
    pub fn create(dir: &Path, file_size: u64, group_window: Duration) -> Result<Journal> {
        Self::start_at(dir, file_size, group_window, 0, 0, 0, Vec::new())
    }

    /// Continue after recovery: keep the recovered page map (whose
    /// addresses point into the old files) and open the next file in
    /// sequence. Handle tables start empty; volumes re-register on first
    /// use.
    pub fn resume(
        dir: &Path,
        file_size: u64,
        group_window: Duration,
        next_seq: u64,
        last_ckpt_ts: Ts,
        recovered: Vec<(Arc<Volume>, PageAddr, PageMapEntry)>,
    ) -> Result<Journal> {
        let base = recovered
            .iter()
            .map(|(_, _, e)| e.addr)
            .min()
            .unwrap_or(next_seq * file_size);
        let journal = Self::start_at(dir, file_size, group_window, next_seq, base, last_ckpt_ts, Vec::new())?;
        {
            let mut inner = journal.inner.lock().expect("journal monitor");
            for (volume, page, entry) in recovered {
                let vh = Self::volume_handle_locked(&journal, &mut inner, &volume)?;
                inner.page_map.insert((vh, page), entry);
            }
            inner.base_addr = base;
        }
        Ok(journal)
    }

    fn start_at(
        dir: &Path,
        file_size: u64,
        group_window: Duration,
        seq: u64,
        base_addr: JournalAddr,
        last_ckpt_ts: Ts,
        volumes: Vec<(VolumeHandle, Arc<Volume>)>,
    ) -> Result<Journal> {
        let path = dir.join(file_name(seq));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let sync_file = file.try_clone()?;
        let now = now_ms();
        let journal = Journal {
            dir: dir.to_path_buf(),
            file_size,
            group_window,
            inner: Mutex::new(JournalInner {
                file,
                cur_addr: seq * file_size,
                base_addr,
                journal_created: now,
                file_created: now,
                last_ckpt_ts,
                last_ckpt_addr: seq * file_size,
                page_map: HashMap::new(),
                txn_map: HashMap::new(),
                volumes,
                trees: Vec::new(),
                next_volume_handle: 1,
                next_tree_handle: 1,
            }),
            sync_state: Mutex::new(SyncState { synced_addr: 0, leader_active: false }),
            sync_cond: Condvar::new(),
            sync_file: Mutex::new(sync_file),
        };
        {
            let mut inner = journal.inner.lock().expect("journal monitor");
            journal.write_header(&mut inner)?;
        }
        Ok(journal)
    }

    pub fn base_addr(&self) -> JournalAddr {
        self.inner.lock().expect("journal monitor").base_addr
    }

    pub fn current_addr(&self) -> JournalAddr {
        self.inner.lock().expect("journal monitor").cur_addr
    }

    pub fn last_checkpoint_ts(&self) -> Ts {
        self.inner.lock().expect("journal monitor").last_ckpt_ts
    }

    // -------- handle assignment --------

    pub fn volume_handle(&self, volume: &Arc<Volume>) -> Result<VolumeHandle> {
        let mut inner = self.inner.lock().expect("journal monitor");
        Self::volume_handle_locked(self, &mut inner, volume)
    }

    fn volume_handle_locked(
        &self,
        inner: &mut JournalInner,
        volume: &Arc<Volume>,
    ) -> Result<VolumeHandle> {
        if let Some((h, _)) = inner.volumes.iter().find(|(_, v)| v.id() == volume.id()) {
            return Ok(*h);
        }
        let handle = inner.next_volume_handle;
        inner.next_volume_handle += 1;
        inner.volumes.push((handle, Arc::clone(volume)));
        let payload = encode_iv_payload(handle, volume.id(), volume.path());
        self.append_record(inner, TYPE_IV, 0, &payload)?;
        Ok(handle)
    }

    pub fn tree_handle(&self, vh: VolumeHandle, name: &str) -> Result<TreeHandle> {
        let mut inner = self.inner.lock().expect("journal monitor");
        if let Some((h, _, _)) = inner
            .trees
            .iter()
            .find(|(_, v, n)| *v == vh && n == name)
        {
            return Ok(*h);
        }
        let handle = inner.next_tree_handle;
        inner.next_tree_handle += 1;
        inner.trees.push((handle, vh, name.to_string()));
        let payload = encode_it_payload(handle, vh, name);
        self.append_record(&mut inner, TYPE_IT, 0, &payload)?;
        Ok(handle)
    }

    pub fn volume_for_handle(&self, vh: VolumeHandle) -> Option<Arc<Volume>> {
        let inner = self.inner.lock().expect("journal monitor");
        inner
            .volumes
            .iter()
            .find(|(h, _)| *h == vh)
            .map(|(_, v)| Arc::clone(v))
    }

    pub fn tree_for_handle(&self, th: TreeHandle) -> Option<(VolumeHandle, String)> {
        let inner = self.inner.lock().expect("journal monitor");
        inner
            .trees
            .iter()
            .find(|(h, _, _)| *h == th)
            .map(|(_, vh, name)| (*vh, name.clone()))
    }

    // -------- appends --------

    /// Append a PA record for a page image. Called by the buffer pool
    /// before any page reaches its volume (the WAL gate); the record
    /// timestamp is the page's update timestamp.
    pub fn append_page_image(
        &self,
        vh: VolumeHandle,
        addr: PageAddr,
        image: &[u8],
    ) -> Result<JournalAddr> {
        let ts = wire::get_u64(&image[page::PAGE_TIMESTAMP..]);
        let (left, right) = image_extents(image);
        let mut payload = Vec::with_capacity(20 + left + right);
        let mut buf = [0u8; 8];
        wire::put_u32(&mut buf[..4], vh);
        payload.extend_from_slice(&buf[..4]);
        wire::put_u64(&mut buf, addr);
        payload.extend_from_slice(&buf);
        wire::put_u32(&mut buf[..4], left as u32);
        payload.extend_from_slice(&buf[..4]);
        wire::put_u32(&mut buf[..4], image.len() as u32);
        payload.extend_from_slice(&buf[..4]);
        payload.extend_from_slice(&image[..left]);
        payload.extend_from_slice(&image[image.len() - right..]);

        let mut inner = self.inner.lock().expect("journal monitor");
        let at = self.append_record(&mut inner, TYPE_PA, ts, &payload)?;
        inner.page_map.insert((vh, addr), PageMapEntry { ts, addr: at });
        Ok(at)
    }

    /// Append a TX record. `commit_ts` is `TS_UNCOMMITTED` for interim
    /// (spilled) chunks of a large transaction; the final chunk carries
    /// the real commit timestamp and links the chain via `prev_addr`.
    pub fn append_transaction(
        &self,
        start_ts: Ts,
        commit_ts: Ts,
        prev_addr: JournalAddr,
        sub_records: &[u8],
    ) -> Result<JournalAddr> {
        let mut payload = Vec::with_capacity(16 + sub_records.len());
        let mut buf = [0u8; 8];
        wire::put_u64(&mut buf, commit_ts);
        payload.extend_from_slice(&buf);
        wire::put_u64(&mut buf, prev_addr);
        payload.extend_from_slice(&buf);
        payload.extend_from_slice(sub_records);

        let mut inner = self.inner.lock().expect("journal monitor");
        let at = self.append_record(&mut inner, TYPE_TX, start_ts, &payload)?;
        let entry = inner.txn_map.entry(start_ts).or_insert(TxnMapEntry {
            start_ts,
            commit_ts,
            journal_addr: at,
            last_record_addr: at,
        });
        entry.commit_ts = commit_ts;
        entry.last_record_addr = at;
        Ok(at)
    }

    /// Append a CP record. The caller (engine checkpoint) has already
    /// flushed every page with timestamp ≤ `ts` through
    /// `append_page_image`, which is what entitles the record to certify
    /// them.
    pub fn append_checkpoint(&self, ts: Ts) -> Result<JournalAddr> {
        let mut inner = self.inner.lock().expect("journal monitor");
        // A checkpoint retires transactions it covers: their effects are
        // durable in PA records at or below this point.
        inner.txn_map.retain(|_, e| e.commit_ts == TS_UNCOMMITTED || e.commit_ts > ts);
        let base = self.compute_base(&inner);
        inner.base_addr = base;

        let mut payload = [0u8; 16];
        wire::put_u64(&mut payload[..8], now_ms());
        wire::put_u64(&mut payload[8..], base);
        let at = self.append_record(&mut inner, TYPE_CP, ts, &payload)?;
        inner.last_ckpt_ts = ts;
        inner.last_ckpt_addr = at;
        drop(inner);

        self.fsync_to(at + 1)?;
        info!("checkpoint ts={ts} addr={at} base={base}");
        Ok(at)
    }

    fn compute_base(&self, inner: &JournalInner) -> JournalAddr {
        let page_min = inner.page_map.values().map(|e| e.addr).min();
        let txn_min = inner.txn_map.values().map(|e| e.journal_addr).min();
        [Some(inner.last_ckpt_addr), page_min, txn_min]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(inner.cur_addr)
    }

    /// Single-writer append with rollover. The monitor is held only for
    /// the buffered write, never across an fsync.
    fn append_record(
        &self,
        inner: &mut JournalInner,
        kind: u16,
        ts: Ts,
        payload: &[u8],
    ) -> Result<JournalAddr> {
        let len = RECORD_HEADER_SIZE + payload.len();
        if len as u64 > self.file_size / 2 {
            return Err(Error::JournalFull);
        }
        let offset = inner.cur_addr % self.file_size;
        // Leave room for the rollover trio (PM + TM + JE) this file will
        // eventually need. If the maps alone outgrow the file, the
        // copier has stalled and rolling over cannot help.
        let reserve = self.rollover_reserve(inner);
        if reserve as u64 > self.file_size / 2 {
            return Err(Error::JournalFull);
        }
        if kind != TYPE_PM && kind != TYPE_TM && kind != TYPE_JE && kind != TYPE_JH {
            if offset + (len + reserve) as u64 > self.file_size {
                self.rollover(inner)?;
            }
        }
        self.write_record(inner, kind, ts, payload)
    }

    fn write_record(
        &self,
        inner: &mut JournalInner,
        kind: u16,
        ts: Ts,
        payload: &[u8],
    ) -> Result<JournalAddr> {
        let at = inner.cur_addr;
        let offset = at % self.file_size;
        let len = RECORD_HEADER_SIZE + payload.len();
        let mut head = [0u8; RECORD_HEADER_SIZE];
        wire::put_u32(&mut head[..4], len as u32);
        wire::put_u16(&mut head[4..6], kind);
        wire::put_u16(&mut head[6..8], 0);
        wire::put_u64(&mut head[8..], ts);
        inner.file.write_all_at(&head, offset)?;
        inner.file.write_all_at(payload, offset + RECORD_HEADER_SIZE as u64)?;
        inner.cur_addr = at + len as u64;
        Ok(at)
    }

    fn rollover_reserve(&self, inner: &JournalInner) -> usize {
        let pm = RECORD_HEADER_SIZE + inner.page_map.len() * 28;
        let tm = RECORD_HEADER_SIZE + inner.txn_map.len() * 32;
        let je = RECORD_HEADER_SIZE + 24;
        pm + tm + je
    }

    /// Seal the current file with PM/TM/JE (clean close). Recovery
    /// treats a journal whose last record is JE as a clean shutdown.
    pub fn seal(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("journal monitor");
        self.seal_current(&mut inner)?;
        Ok(())
    }

    /// Seal the current file with PM/TM/JE and open the next one.
    fn rollover(&self, inner: &mut JournalInner) -> Result<()> {
        let seq = inner.cur_addr / self.file_size;
        self.seal_current(inner)?;

        let next_seq = seq + 1;
        let path = self.dir.join(file_name(next_seq));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        *self.sync_file.lock().expect("sync file") = file.try_clone()?;
        inner.file = file;
        inner.cur_addr = next_seq * self.file_size;
        inner.file_created = now_ms();
        debug!("journal rollover to seq {next_seq}");

        self.write_header(inner)?;

        // Re-issue the handle tables into the new file.
        let volumes: Vec<_> = inner.volumes.clone();
        for (h, volume) in volumes {
            let payload = encode_iv_payload(h, volume.id(), volume.path());
            self.write_record(inner, TYPE_IV, 0, &payload)?;
        }
        let trees: Vec<_> = inner.trees.clone();
        for (h, vh, name) in trees {
            let payload = encode_it_payload(h, vh, &name);
            self.write_record(inner, TYPE_IT, 0, &payload)?;
        }
        Ok(())
    }

    fn seal_current(&self, inner: &mut JournalInner) -> Result<()> {
        let mut pm = Vec::with_capacity(inner.page_map.len() * 28);
        for ((vh, page), e) in inner.page_map.iter() {
            let mut entry = [0u8; 28];
            wire::put_u64(&mut entry[..8], e.ts);
            wire::put_u64(&mut entry[8..16], e.addr);
            wire::put_u32(&mut entry[16..20], *vh);
            wire::put_u64(&mut entry[20..], *page);
            pm.extend_from_slice(&entry);
        }
        let mut tm = Vec::with_capacity(inner.txn_map.len() * 32);
        for e in inner.txn_map.values() {
            let mut entry = [0u8; 32];
            wire::put_u64(&mut entry[..8], e.start_ts);
            wire::put_u64(&mut entry[8..16], e.commit_ts);
            wire::put_u64(&mut entry[16..24], e.journal_addr);
            wire::put_u64(&mut entry[24..], e.last_record_addr);
            tm.extend_from_slice(&entry);
        }
        self.write_record(inner, TYPE_PM, 0, &pm)?;
        self.write_record(inner, TYPE_TM, 0, &tm)?;
        let mut je = [0u8; 24];
        wire::put_u64(&mut je[..8], inner.cur_addr);
        wire::put_u64(&mut je[8..16], inner.base_addr);
        wire::put_u64(&mut je[16..], inner.journal_created);
        self.write_record(inner, TYPE_JE, 0, &je)?;
        inner.file.sync_data()?;
        Ok(())
    }

    fn write_header(&self, inner: &mut JournalInner) -> Result<()> {
        let path_bytes = self.dir.to_string_lossy().into_owned().into_bytes();
        let mut payload = Vec::with_capacity(64 + path_bytes.len());
        for v in [
            JOURNAL_VERSION,
            self.file_size,
            inner.cur_addr,
            inner.base_addr,
            inner.journal_created,
            inner.file_created,
            inner.last_ckpt_ts,
            0u64,
        ] {
            let mut buf = [0u8; 8];
            wire::put_u64(&mut buf, v);
            payload.extend_from_slice(&buf);
        }
        payload.extend_from_slice(&path_bytes);
        self.write_record(inner, TYPE_JH, 0, &payload)?;
        Ok(())
    }

    // -------- durability --------

    /// Make the journal durable through `addr` per the chosen policy.
    pub fn sync(&self, addr: JournalAddr, policy: CommitPolicy) -> Result<()> {
        match policy {
            CommitPolicy::Soft => Ok(()),
            CommitPolicy::Hard => self.fsync_to(addr),
            CommitPolicy::Group => self.group_sync(addr),
        }
    }

    /// fsync if `addr` is not yet durable. Holds only the sync state
    /// lock around bookkeeping, never across the fsync itself.
    pub fn fsync_to(&self, addr: JournalAddr) -> Result<()> {
        {
            let st = self.sync_state.lock().expect("sync state");
            if st.synced_addr >= addr {
                return Ok(());
            }
        }
        let target = self.current_addr();
        let file = self.sync_file.lock().expect("sync file").try_clone()?;
        file.sync_data()?;
        let mut st = self.sync_state.lock().expect("sync state");
        if st.synced_addr < target {
            st.synced_addr = target;
        }
        self.sync_cond.notify_all();
        Ok(())
    }

    /// Group commit: the first waiter becomes the leader, sleeps out the
    /// batching window, issues one fsync and releases everyone whose
    /// records it covered.
    fn group_sync(&self, addr: JournalAddr) -> Result<()> {
        let mut st = self.sync_state.lock().expect("sync state");
        loop {
            if st.synced_addr >= addr {
                return Ok(());
            }
            if st.leader_active {
                let (next, _) = self
                    .sync_cond
                    .wait_timeout(st, self.group_window * 4)
                    .expect("sync state");
                st = next;
                continue;
            }
            st.leader_active = true;
            drop(st);

            std::thread::sleep(self.group_window);
            let target = self.current_addr();
            let result = (|| -> Result<()> {
                let file = self.sync_file.lock().expect("sync file").try_clone()?;
                file.sync_data()?;
                Ok(())
            })();

            st = self.sync_state.lock().expect("sync state");
            st.leader_active = false;
            if result.is_ok() && st.synced_addr < target {
                st.synced_addr = target;
            }
            self.sync_cond.notify_all();
            result?;
        }
    }

    /// Background flusher entry: fsync whatever has been appended (the
    /// soft policy's eventual durability).
    pub fn flush(&self) -> Result<()> {
        self.fsync_to(self.current_addr())
    }

    // -------- reads --------

    /// The journal's current image of a page, if one exists that has not
    /// been copied back. The buffer pool consults this before falling
    /// back to the volume.
    pub fn read_page_image(&self, vh: VolumeHandle, page: PageAddr) -> Result<Option<Vec<u8>>> {
        let entry = {
            let inner = self.inner.lock().expect("journal monitor");
            match inner.page_map.get(&(vh, page)) {
                Some(e) => *e,
                None => return Ok(None),
            }
        };
        let image = self.read_page_record(entry.addr)?;
        Ok(Some(image))
    }

    /// Read and reassemble the page image of the PA record at `addr`.
    fn read_page_record(&self, addr: JournalAddr) -> Result<Vec<u8>> {
        let record = self.read_record(addr)?;
        let header = parse_record_header(&record)?;
        if header.kind != TYPE_PA {
            return Err(Error::CorruptJournal(format!(
                "expected PA at {addr}, found {}",
                type_name(header.kind)
            )));
        }
        let payload = &record[RECORD_HEADER_SIZE..];
        decode_pa_image(payload).map(|(_, _, image)| image)
    }

    /// Read one whole record at `addr` from whichever file holds it.
    pub fn read_record(&self, addr: JournalAddr) -> Result<Vec<u8>> {
        let seq = addr / self.file_size;
        let offset = addr % self.file_size;
        let path = self.dir.join(file_name(seq));
        let file = File::open(&path)?;
        let mut head = [0u8; RECORD_HEADER_SIZE];
        file.read_exact_at(&mut head, offset)?;
        let header = parse_record_header(&head)?;
        let mut record = vec![0u8; header.len];
        file.read_exact_at(&mut record, offset)?;
        Ok(record)
    }

    // -------- copy-back --------

    /// One copy-back pass: write every mapped page image older than the
    /// current checkpoint to its volume, then retire fully-copied files
    /// below the base address. Returns the number of pages promoted.
    pub fn copy_back(&self) -> Result<usize> {
        let (entries, ckpt_addr) = {
            let inner = self.inner.lock().expect("journal monitor");
            let list: Vec<((VolumeHandle, PageAddr), PageMapEntry)> = inner
                .page_map
                .iter()
                .filter(|(_, e)| e.addr < inner.last_ckpt_addr)
                .map(|(k, e)| (*k, *e))
                .collect();
            (list, inner.last_ckpt_addr)
        };
        if entries.is_empty() {
            self.retire_files()?;
            return Ok(0);
        }

        let mut touched: Vec<Arc<Volume>> = Vec::new();
        let mut copied = 0usize;
        for ((vh, page), entry) in &entries {
            let volume = match self.volume_for_handle(*vh) {
                Some(v) => v,
                None => {
                    warn!("copy-back: no volume for handle {vh}");
                    continue;
                }
            };
            let image = self.read_page_record(entry.addr)?;
            volume.write_page(*page, &image)?;
            if !touched.iter().any(|v| Arc::ptr_eq(v, &volume)) {
                touched.push(Arc::clone(&volume));
            }
            copied += 1;
        }
        for volume in &touched {
            volume.sync()?;
        }

        // Only drop map entries that were not overwritten while we
        // copied.
        {
            let mut inner = self.inner.lock().expect("journal monitor");
            for ((vh, page), entry) in entries {
                if let Some(current) = inner.page_map.get(&(vh, page)) {
                    if current.addr == entry.addr {
                        inner.page_map.remove(&(vh, page));
                    }
                }
            }
            let base = self.compute_base(&inner);
            inner.base_addr = base.max(inner.base_addr.min(ckpt_addr));
        }
        debug!("copy-back promoted {copied} pages");
        self.retire_files()?;
        Ok(copied)
    }

    /// Delete journal files wholly below the base address.
    fn retire_files(&self) -> Result<()> {
        let (base, cur) = {
            let inner = self.inner.lock().expect("journal monitor");
            (inner.base_addr, inner.cur_addr)
        };
        let base_seq = base / self.file_size;
        let cur_seq = cur / self.file_size;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(seq) = file_seq(&name.to_string_lossy()) else {
                continue;
            };
            if seq < base_seq && seq < cur_seq {
                info!("retiring journal file seq {seq}");
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Pages currently mapped in the journal (diagnostics and tests).
    pub fn page_map_len(&self) -> usize {
        self.inner.lock().expect("journal monitor").page_map.len()
    }
}

fn image_extents(image: &[u8]) -> (usize, usize) {
    match image[page::PAGE_TYPE] {
        t if t == page::PageType::Data as u8 || t == page::PageType::Index as u8 => {
            let count = wire::get_u16(&image[page::PAGE_KEY_COUNT..]) as usize;
            let tail = wire::get_u32(&image[page::PAGE_TAIL_OFFSET..]) as usize;
            let left = page::PAGE_HEADER_SIZE + count * page::KEY_BLOCK_SIZE;
            if tail <= image.len() && left <= tail {
                (left, image.len() - tail)
            } else {
                (image.len(), 0)
            }
        }
        t if t == page::PageType::LongRecord as u8 => {
            let len = wire::get_u32(&image[page::LONG_CHUNK_LEN..]) as usize;
            let left = (page::LONG_CHUNK_START + len).min(image.len());
            (left, 0)
        }
        _ => (image.len(), 0),
    }
}

/// Decode a PA payload into (volume handle, page address, image).
pub fn decode_pa_image(payload: &[u8]) -> Result<(VolumeHandle, PageAddr, Vec<u8>)> {
    if payload.len() < 20 {
        return Err(Error::CorruptJournal("PA payload truncated".into()));
    }
    let vh = wire::get_u32(payload);
    let page_addr = wire::get_u64(&payload[4..]);
    let left = wire::get_u32(&payload[12..]) as usize;
    let buffer_size = wire::get_u32(&payload[16..]) as usize;
    let stored = &payload[20..];
    if left > stored.len() || left > buffer_size || stored.len() > buffer_size {
        return Err(Error::CorruptJournal("PA extents".into()));
    }
    let right = stored.len() - left;
    let mut image = vec![0u8; buffer_size];
    image[..left].copy_from_slice(&stored[..left]);
    image[buffer_size - right..].copy_from_slice(&stored[left..]);
    Ok((vh, page_addr, image))
}

pub fn encode_iv_payload(handle: VolumeHandle, id: u64, path: &Path) -> Vec<u8> {
    let path_bytes = path.to_string_lossy().into_owned().into_bytes();
    let mut payload = Vec::with_capacity(12 + path_bytes.len());
    let mut buf = [0u8; 8];
    wire::put_u32(&mut buf[..4], handle);
    payload.extend_from_slice(&buf[..4]);
    wire::put_u64(&mut buf, id);
    payload.extend_from_slice(&buf);
    payload.extend_from_slice(&path_bytes);
    payload
}

pub fn encode_it_payload(handle: TreeHandle, vh: VolumeHandle, name: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + name.len());
    let mut buf = [0u8; 4];
    wire::put_u32(&mut buf, handle);
    payload.extend_from_slice(&buf);
    wire::put_u32(&mut buf, vh);
    payload.extend_from_slice(&buf);
    payload.extend_from_slice(name.as_bytes());
    payload
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::page::{Page, PageType};

    const FILE_SIZE: u64 = 256 * 1024;

    fn journal(dir: &Path) -> Journal {
        Journal::create(dir, FILE_SIZE, Duration::from_millis(1)).unwrap()
    }

    #[test]
    fn test_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());
        let at = j.append_transaction(5, 9, 0, b"subrecords").unwrap();
        let record = j.read_record(at).unwrap();
        let header = parse_record_header(&record).unwrap();
        assert_eq!(header.kind, TYPE_TX);
        assert_eq!(header.ts, 5);
        let payload = &record[RECORD_HEADER_SIZE..];
        assert_eq!(wire::get_u64(payload), 9);
        assert_eq!(&payload[16..], b"subrecords");
    }

    #[test]
    fn test_page_image_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());
        let mut p = Page::new(4096, PageType::Data, 7);
        p.insert(b"alpha", b"1").unwrap();
        p.insert(b"beta", b"2").unwrap();
        p.set_timestamp(7);
        j.append_page_image(3, 11, p.bytes()).unwrap();

        let image = j.read_page_image(3, 11).unwrap().unwrap();
        assert_eq!(image, p.bytes());
        assert!(j.read_page_image(3, 12).unwrap().is_none());
    }

    #[test]
    fn test_pa_middle_cleared() {
        // the free span between key blocks and tail is not stored.
        let mut p = Page::new(4096, PageType::Data, 1);
        p.insert(b"k", b"v").unwrap();
        let (left, right) = image_extents(p.bytes());
        assert!(left < 4096 && right < 4096);
        assert!(left + right < 4096);
    }

    #[test]
    fn test_rollover_reissues_handles() {
        let dir = tempfile::tempdir().unwrap();
        let j = Journal::create(dir.path(), 8 * 1024, Duration::from_millis(1)).unwrap();
        let vpath = dir.path().join("v.vol");
        let volume = Arc::new(crate::volume::Volume::create(&vpath, "v", 1024).unwrap());
        let vh = j.volume_handle(&volume).unwrap();
        let th = j.tree_handle(vh, "t").unwrap();

        // push several files' worth of records through.
        for i in 0u64..64 {
            let p = Page::new(1024, PageType::Data, i);
            j.append_page_image(vh, i % 4, p.bytes()).unwrap();
        }
        assert!(j.current_addr() > 8 * 1024);
        // handles survive rollover.
        assert_eq!(j.volume_handle(&volume).unwrap(), vh);
        assert_eq!(j.tree_handle(vh, "t").unwrap(), th);

        // the first file ends with PM/TM/JE.
        let data = std::fs::read(dir.path().join(file_name(0))).unwrap();
        let mut pos = 0usize;
        let mut kinds = Vec::new();
        while pos + RECORD_HEADER_SIZE <= data.len() {
            let header = match parse_record_header(&data[pos..]) {
                Ok(h) => h,
                Err(_) => break,
            };
            if pos + header.len > data.len() {
                break;
            }
            kinds.push(header.kind);
            pos += header.len;
        }
        assert_eq!(kinds.first(), Some(&TYPE_JH));
        let tail: Vec<u16> = kinds[kinds.len() - 3..].to_vec();
        assert_eq!(tail, vec![TYPE_PM, TYPE_TM, TYPE_JE]);
    }

    #[test]
    fn test_copy_back_promotes_and_retires() {
        let dir = tempfile::tempdir().unwrap();
        let j = Journal::create(dir.path(), 64 * 1024, Duration::from_millis(1)).unwrap();
        let vpath = dir.path().join("v.vol");
        let volume = Arc::new(crate::volume::Volume::create(&vpath, "v", 1024).unwrap());
        let vh = j.volume_handle(&volume).unwrap();

        let mut p = Page::new(1024, PageType::Data, 3);
        p.insert(b"x", b"y").unwrap();
        p.set_timestamp(3);
        j.append_page_image(vh, 5, p.bytes()).unwrap();
        j.append_checkpoint(4).unwrap();
        assert_eq!(j.page_map_len(), 1);

        let copied = j.copy_back().unwrap();
        assert_eq!(copied, 1);
        assert_eq!(j.page_map_len(), 0);
        assert_eq!(volume.read_page(5).unwrap(), p.bytes());
    }

    #[test]
    fn test_sync_policies() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());
        let at = j.append_transaction(1, 2, 0, b"x").unwrap();
        j.sync(at + 1, CommitPolicy::Soft).unwrap();
        j.sync(at + 1, CommitPolicy::Hard).unwrap();
        j.sync(at + 1, CommitPolicy::Group).unwrap();
        // already durable: hard sync is now a no-op.
        j.sync(at, CommitPolicy::Hard).unwrap();
    }
}
