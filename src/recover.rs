//! Startup recovery: scan the journal files, rebuild the page and
//! transaction maps, classify the shutdown, and hand the engine the
//! committed transactions that still need redo.
//!
//! The scan walks files in sequence order. Handle tables (IV/IT) reset
//! at every JH. A malformed record in any file but the last is
//! corruption; in the last file it is crash truncation. A last file
//! whose final record is JE is a clean shutdown.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use mmap_rs::{MmapFlags, MmapOptions};

use crate::error::{Error, Result};
use crate::journal::{
    self, parse_record_header, RECORD_HEADER_SIZE, TYPE_CP, TYPE_IT, TYPE_IV, TYPE_JE, TYPE_JH,
    TYPE_PA, TYPE_PM, TYPE_TM, TYPE_TX,
};
use crate::tree::AccumulatorKind;
use crate::txn::{decode_ops, TxnOp};
use crate::wire;
use crate::{JournalAddr, PageAddr, Ts, TS_UNCOMMITTED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    /// The journal ended with JE: clean shutdown.
    Clean,
    /// The tail was a partial record, truncated at the crash point.
    CrashRecovered,
}

#[derive(Debug, Clone)]
pub struct RecoveredPage {
    pub volume_id: u64,
    pub page: PageAddr,
    pub ts: Ts,
    pub addr: JournalAddr,
}

/// A committed transaction's ops, with journal handles resolved to
/// durable identities (volume ids and tree names) since handle tables
/// die with their file.
#[derive(Debug, Clone)]
pub enum RecoveredOp {
    Store { volume_id: u64, tree: String, key: Vec<u8>, value: Vec<u8> },
    RemoveRange { volume_id: u64, tree: String, key1: Vec<u8>, key2: Vec<u8> },
    RemoveTree { volume_id: u64, tree: String },
    RemoveVolume { volume_id: u64 },
    Delta { volume_id: u64, tree: String, index: u16, kind: AccumulatorKind, value: i64 },
}

#[derive(Debug, Clone)]
pub struct RecoveredTxn {
    pub start_ts: Ts,
    pub commit_ts: Ts,
    pub ops: Vec<RecoveredOp>,
}

pub struct ScanOutcome {
    pub status: RecoveryStatus,
    pub next_seq: u64,
    pub last_ckpt_ts: Ts,
    pub max_ts: Ts,
    pub volumes: Vec<(u64, PathBuf)>,
    pub page_map: Vec<RecoveredPage>,
    pub committed: Vec<RecoveredTxn>,
}

/// Scan the journal directory. Ok(None) when no journal exists (fresh
/// engine).
pub fn scan(dir: &Path, file_size: u64) -> Result<Option<ScanOutcome>> {
    let mut seqs: Vec<u64> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(seq) = journal::file_seq(&entry.file_name().to_string_lossy()) {
            seqs.push(seq);
        }
    }
    if seqs.is_empty() {
        return Ok(None);
    }
    seqs.sort_unstable();

    let mut status = RecoveryStatus::CrashRecovered;
    let mut last_ckpt_ts: Ts = 0;
    let mut max_ts: Ts = 0;
    let mut volumes: HashMap<u64, PathBuf> = HashMap::new();
    let mut page_map: HashMap<(u64, PageAddr), (Ts, JournalAddr)> = HashMap::new();
    let mut pending: HashMap<Ts, Vec<RecoveredOp>> = HashMap::new();
    let mut committed: Vec<RecoveredTxn> = Vec::new();

    for (i, &seq) in seqs.iter().enumerate() {
        let is_last = i == seqs.len() - 1;
        let path = dir.join(journal::file_name(seq));
        let data = map_file(&path)?;
        debug!("scanning journal seq {seq}, {} bytes", data.len());

        // handle tables are scoped to one file.
        let mut vol_handles: HashMap<u32, u64> = HashMap::new();
        let mut tree_handles: HashMap<u32, (u64, String)> = HashMap::new();
        let mut ended_clean = false;

        let mut pos = 0usize;
        let mut first = true;
        loop {
            if pos + RECORD_HEADER_SIZE > data.len() {
                break;
            }
            // an unwritten (all-zero) tail is the crash-truncation
            // point, not corruption.
            if data[pos..pos + 4] == [0, 0, 0, 0] {
                break;
            }
            let header = match parse_record_header(&data[pos..]) {
                Ok(h) => h,
                Err(e) => {
                    if is_last {
                        warn!("journal truncated at {pos} in seq {seq}: {e}");
                        break;
                    }
                    return Err(e);
                }
            };
            if pos + header.len > data.len() {
                // a record that overruns the written extent is the tail
                // of an interrupted append. An earlier crash can leave
                // one in a file that is no longer the last, when the
                // recovered engine continued in a fresh file.
                warn!("partial record at {pos} in seq {seq}, treating as crash point");
                break;
            }
            let record_addr = seq * file_size + pos as u64;
            let payload = &data[pos + RECORD_HEADER_SIZE..pos + header.len];
            max_ts = max_ts.max(header.ts);

            if first && header.kind != TYPE_JH {
                return Err(Error::CorruptJournal(format!(
                    "file {seq} does not start with JH"
                )));
            }
            first = false;

            match header.kind {
                TYPE_JH => {
                    if payload.len() < 64 {
                        return Err(Error::CorruptJournal("JH payload".into()));
                    }
                    let version = wire::get_u64(payload);
                    if version != journal::JOURNAL_VERSION {
                        return Err(Error::CorruptJournal(format!(
                            "journal version {version}"
                        )));
                    }
                    let stored_size = wire::get_u64(&payload[8..]);
                    if stored_size != file_size {
                        return Err(Error::CorruptJournal(format!(
                            "journal file size {stored_size}, engine expects {file_size}"
                        )));
                    }
                    last_ckpt_ts = last_ckpt_ts.max(wire::get_u64(&payload[48..]));
                }
                TYPE_IV => {
                    if payload.len() < 12 {
                        return Err(Error::CorruptJournal("IV payload".into()));
                    }
                    let handle = wire::get_u32(payload);
                    let id = wire::get_u64(&payload[4..]);
                    let path = PathBuf::from(String::from_utf8_lossy(&payload[12..]).into_owned());
                    vol_handles.insert(handle, id);
                    volumes.insert(id, path);
                }
                TYPE_IT => {
                    if payload.len() < 8 {
                        return Err(Error::CorruptJournal("IT payload".into()));
                    }
                    let handle = wire::get_u32(payload);
                    let vh = wire::get_u32(&payload[4..]);
                    let name = String::from_utf8_lossy(&payload[8..]).into_owned();
                    let Some(&volume_id) = vol_handles.get(&vh) else {
                        return Err(Error::CorruptJournal(format!(
                            "IT before IV for volume handle {vh}"
                        )));
                    };
                    tree_handles.insert(handle, (volume_id, name));
                }
                TYPE_PA => {
                    if payload.len() < 12 {
                        return Err(Error::CorruptJournal("PA payload".into()));
                    }
                    let vh = wire::get_u32(payload);
                    let page = wire::get_u64(&payload[4..]);
                    let Some(&volume_id) = vol_handles.get(&vh) else {
                        return Err(Error::CorruptJournal(format!(
                            "PA before IV for volume handle {vh}"
                        )));
                    };
                    page_map.insert((volume_id, page), (header.ts, record_addr));
                }
                TYPE_PM | TYPE_TM => {
                    // rollover snapshots; the incremental maps built from
                    // PA/TX records over the surviving files subsume them.
                }
                TYPE_CP => {
                    last_ckpt_ts = header.ts;
                    // the checkpoint certifies everything at or below it:
                    // transactions no longer need redo.
                    committed.retain(|t| t.commit_ts > header.ts);
                }
                TYPE_TX => {
                    if payload.len() < 16 {
                        return Err(Error::CorruptJournal("TX payload".into()));
                    }
                    let commit_ts = wire::get_u64(payload);
                    let ops = decode_ops(&payload[16..])?;
                    let resolved = resolve_ops(&ops, &vol_handles, &tree_handles)?;
                    let start_ts = header.ts;
                    max_ts = max_ts.max(start_ts);
                    pending.entry(start_ts).or_default().extend(resolved);
                    if commit_ts != TS_UNCOMMITTED {
                        max_ts = max_ts.max(commit_ts);
                        let ops = pending.remove(&start_ts).unwrap_or_default();
                        committed.push(RecoveredTxn { start_ts, commit_ts, ops });
                    }
                }
                TYPE_JE => {
                    ended_clean = true;
                }
                other => {
                    return Err(Error::CorruptJournal(format!("record type {other:#06x}")));
                }
            }

            pos += header.len;
            if ended_clean {
                break;
            }
        }

        if is_last {
            status = if ended_clean { RecoveryStatus::Clean } else { RecoveryStatus::CrashRecovered };
        } else if !ended_clean {
            // survived an earlier crash; its tail was already discarded
            // by the recovery that opened the next file.
            debug!("journal seq {seq} ends without JE (earlier crash point)");
        }
    }

    // transactions in flight at the crash have no commit record: their
    // updates never reached the trees and are simply discarded.
    if !pending.is_empty() {
        debug!("discarding {} uncommitted transactions", pending.len());
    }

    Ok(Some(ScanOutcome {
        status,
        next_seq: seqs.last().expect("nonempty") + 1,
        last_ckpt_ts,
        max_ts,
        volumes: volumes.into_iter().collect(),
        page_map: page_map
            .into_iter()
            .map(|((volume_id, page), (ts, addr))| RecoveredPage { volume_id, page, ts, addr })
            .collect(),
        committed,
    }))
}

fn resolve_ops(
    ops: &[TxnOp],
    vol_handles: &HashMap<u32, u64>,
    tree_handles: &HashMap<u32, (u64, String)>,
) -> Result<Vec<RecoveredOp>> {
    let tree = |h: u32| -> Result<(u64, String)> {
        tree_handles
            .get(&h)
            .cloned()
            .ok_or_else(|| Error::CorruptJournal(format!("sub-record before IT for tree {h}")))
    };
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        out.push(match op {
            TxnOp::Store { tree: th, key, value } => {
                let (volume_id, name) = tree(*th)?;
                RecoveredOp::Store {
                    volume_id,
                    tree: name,
                    key: key.clone(),
                    value: value.clone(),
                }
            }
            TxnOp::Remove { tree: th, key } => {
                let (volume_id, name) = tree(*th)?;
                let mut key2 = key.clone();
                key2.push(0);
                RecoveredOp::RemoveRange { volume_id, tree: name, key1: key.clone(), key2 }
            }
            TxnOp::RemoveRange { tree: th, key1, key2 } => {
                let (volume_id, name) = tree(*th)?;
                RecoveredOp::RemoveRange {
                    volume_id,
                    tree: name,
                    key1: key1.clone(),
                    key2: key2.clone(),
                }
            }
            TxnOp::RemoveTree { tree: th } => {
                let (volume_id, name) = tree(*th)?;
                RecoveredOp::RemoveTree { volume_id, tree: name }
            }
            TxnOp::RemoveVolume { volume } => {
                let volume_id = *vol_handles.get(volume).ok_or_else(|| {
                    Error::CorruptJournal(format!("DV before IV for volume {volume}"))
                })?;
                RecoveredOp::RemoveVolume { volume_id }
            }
            TxnOp::Delta { tree: th, index, kind, value, .. } => {
                let (volume_id, name) = tree(*th)?;
                RecoveredOp::Delta {
                    volume_id,
                    tree: name,
                    index: *index,
                    kind: *kind,
                    value: *value,
                }
            }
        });
    }
    Ok(out)
}

fn map_file(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    let size = file.metadata()?.len() as usize;
    if size == 0 {
        return Ok(Vec::new());
    }
    let mmap = unsafe {
        MmapOptions::new(size)
            .map_err(map_err)?
            .with_file(&file, 0)
            .with_flags(MmapFlags::SHARED)
            .map()
            .map_err(map_err)?
    };
    Ok(mmap.as_slice().to_vec())
}

fn map_err(e: mmap_rs::Error) -> Error {
    Error::Io(std::io::Error::other(e))
}

#[cfg(test)]
mod test {
    use super::{scan, RecoveryStatus};
    use crate::journal::Journal;
    use crate::page::{Page, PageType};
    use crate::txn::{encode_ops, TxnOp};
    use crate::volume::Volume;
    use crate::TS_UNCOMMITTED;
    use std::sync::Arc;
    use std::time::Duration;

    const FILE_SIZE: u64 = 256 * 1024;

    #[test]
    fn test_scan_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan(dir.path(), FILE_SIZE).unwrap().is_none());
    }

    #[test]
    fn test_scan_clean_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        {
            let j = Journal::create(dir.path(), FILE_SIZE, Duration::from_millis(1)).unwrap();
            let volume =
                Arc::new(Volume::create(&dir.path().join("v.vol"), "v", 1024).unwrap());
            let vh = j.volume_handle(&volume).unwrap();
            let th = j.tree_handle(vh, "t").unwrap();

            let ops = vec![TxnOp::Store { tree: th, key: b"k".to_vec(), value: b"v".to_vec() }];
            j.append_transaction(10, 11, 0, &encode_ops(&ops)).unwrap();

            let mut p = Page::new(1024, PageType::Data, 11);
            p.insert(b"k", b"\x00v").unwrap();
            p.set_timestamp(11);
            j.append_page_image(vh, 3, p.bytes()).unwrap();
            j.seal().unwrap();
        }

        let outcome = scan(dir.path(), FILE_SIZE).unwrap().unwrap();
        assert_eq!(outcome.status, RecoveryStatus::Clean);
        assert_eq!(outcome.next_seq, 1);
        assert_eq!(outcome.volumes.len(), 1);
        assert_eq!(outcome.page_map.len(), 1);
        assert_eq!(outcome.committed.len(), 1);
        assert_eq!(outcome.committed[0].commit_ts, 11);
        assert!(outcome.max_ts >= 11);
    }

    #[test]
    fn test_scan_crash_truncation() {
        let dir = tempfile::tempdir().unwrap();
        {
            let j = Journal::create(dir.path(), FILE_SIZE, Duration::from_millis(1)).unwrap();
            let volume =
                Arc::new(Volume::create(&dir.path().join("v.vol"), "v", 1024).unwrap());
            let vh = j.volume_handle(&volume).unwrap();
            let th = j.tree_handle(vh, "t").unwrap();
            let ops = vec![TxnOp::Store { tree: th, key: b"k".to_vec(), value: b"v".to_vec() }];
            j.append_transaction(5, 6, 0, &encode_ops(&ops)).unwrap();
            // no seal: simulates kill -9.
        }
        let outcome = scan(dir.path(), FILE_SIZE).unwrap().unwrap();
        assert_eq!(outcome.status, RecoveryStatus::CrashRecovered);
        assert_eq!(outcome.committed.len(), 1);
    }

    #[test]
    fn test_uncommitted_chunks_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let j = Journal::create(dir.path(), FILE_SIZE, Duration::from_millis(1)).unwrap();
            let volume =
                Arc::new(Volume::create(&dir.path().join("v.vol"), "v", 1024).unwrap());
            let vh = j.volume_handle(&volume).unwrap();
            let th = j.tree_handle(vh, "t").unwrap();
            let ops = vec![TxnOp::Store { tree: th, key: b"x".to_vec(), value: b"y".to_vec() }];
            // interim chunk only, never committed.
            j.append_transaction(7, TS_UNCOMMITTED, 0, &encode_ops(&ops)).unwrap();
        }
        let outcome = scan(dir.path(), FILE_SIZE).unwrap().unwrap();
        assert!(outcome.committed.is_empty());
    }

    #[test]
    fn test_checkpoint_retires_redo() {
        let dir = tempfile::tempdir().unwrap();
        {
            let j = Journal::create(dir.path(), FILE_SIZE, Duration::from_millis(1)).unwrap();
            let volume =
                Arc::new(Volume::create(&dir.path().join("v.vol"), "v", 1024).unwrap());
            let vh = j.volume_handle(&volume).unwrap();
            let th = j.tree_handle(vh, "t").unwrap();
            let ops = vec![TxnOp::Store { tree: th, key: b"k".to_vec(), value: b"v".to_vec() }];
            j.append_transaction(5, 6, 0, &encode_ops(&ops)).unwrap();
            j.append_checkpoint(8).unwrap();
            j.append_transaction(9, 12, 0, &encode_ops(&ops)).unwrap();
        }
        let outcome = scan(dir.path(), FILE_SIZE).unwrap().unwrap();
        // only the post-checkpoint transaction needs redo.
        assert_eq!(outcome.committed.len(), 1);
        assert_eq!(outcome.committed[0].commit_ts, 12);
        assert_eq!(outcome.last_ckpt_ts, 8);
    }

    #[test]
    fn test_corrupt_record_in_sealed_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let j = Journal::create(dir.path(), 8 * 1024, Duration::from_millis(1)).unwrap();
            let volume =
                Arc::new(Volume::create(&dir.path().join("v.vol"), "v", 1024).unwrap());
            let vh = j.volume_handle(&volume).unwrap();
            // force a rollover so file 0 is sealed.
            for i in 0u64..32 {
                let p = Page::new(1024, PageType::Data, i);
                j.append_page_image(vh, i % 4, p.bytes()).unwrap();
            }
        }
        // clobber a record type in the sealed first file.
        let path = dir.path().join(crate::journal::file_name(0));
        let mut data = std::fs::read(&path).unwrap();
        // the second record starts after JH; wreck its type field.
        let jh_len = crate::wire::get_u32(&data[..4]) as usize;
        data[jh_len + 4] = 0xde;
        data[jh_len + 5] = 0xad;
        std::fs::write(&path, &data).unwrap();

        match scan(dir.path(), 8 * 1024) {
            Err(crate::error::Error::CorruptJournal(_)) => {}
            other => panic!("expected CorruptJournal, got {:?}", other.map(|_| ())),
        }
    }
}
