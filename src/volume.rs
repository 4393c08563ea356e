//! Paged volume files.
//!
//! A volume is one growable file of fixed-size pages. Page 0 is the head
//! page: volume identity plus the allocation state and the tree
//! directory, serialized behind a crc32c so a torn head write is caught
//! at open. All other durability flows through the journal; volume page
//! writes happen only on the copy-back/flush path after the matching
//! page image is durable in the journal.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use crc32c::crc32c;

use crate::error::{Error, Result};
use crate::page::{Page, PageType, NO_PAGE};
use crate::tree::TreeMeta;
use crate::wire;
use crate::PageAddr;

pub const VOLUME_MAGIC: &[u8; 4] = b"arbV";
pub const VOLUME_VERSION: u32 = 1;

// Head page field offsets (the 32-byte page header precedes them).
const HEAD_MAGIC: usize = 32;
const HEAD_CRC: usize = 36;
const HEAD_PAYLOAD_LEN: usize = 40;
const HEAD_PAYLOAD: usize = 48;

/// Mutable allocation and directory state, guarded by the volume mutex.
#[derive(Debug, Clone)]
pub struct VolumeMeta {
    /// Next never-yet-allocated page.
    pub next_page: PageAddr,
    /// Head of the free-page chain, NO_PAGE when empty.
    pub free_head: PageAddr,
    pub trees: Vec<TreeMeta>,
}

impl VolumeMeta {
    pub fn tree(&self, name: &str) -> Option<&TreeMeta> {
        self.trees.iter().find(|t| t.name == name)
    }

    pub fn tree_mut(&mut self, name: &str) -> Option<&mut TreeMeta> {
        self.trees.iter_mut().find(|t| t.name == name)
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

pub struct Volume {
    file: File,
    path: PathBuf,
    name: String,
    id: u64,
    page_size: usize,
    pub meta: Mutex<VolumeMeta>,
}

impl Volume {
    /// Create a volume file with a fresh head page. Fails if the file
    /// already exists.
    pub fn create(path: &Path, name: &str, page_size: usize) -> Result<Volume> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let id = mint_volume_id();
        let volume = Volume {
            file,
            path: path.to_path_buf(),
            name: name.to_string(),
            id,
            page_size,
            meta: Mutex::new(VolumeMeta {
                next_page: 1,
                free_head: NO_PAGE,
                trees: Vec::new(),
            }),
        };
        volume.write_head()?;
        volume.file.sync_data()?;
        Ok(volume)
    }

    /// Open an existing volume, validating the head page.
    pub fn open(path: &Path, name: &str, page_size: usize) -> Result<Volume> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut head = vec![0u8; page_size];
        file.read_exact_at(&mut head, 0)?;
        let (id, meta) = decode_head(&head, page_size)?;
        Ok(Volume {
            file,
            path: path.to_path_buf(),
            name: name.to_string(),
            id,
            page_size,
            meta: Mutex::new(meta),
        })
    }

    /// Open with anyhow context, for the engine's open path and the dump
    /// tool.
    pub fn open_with_context(path: &Path, name: &str, page_size: usize) -> anyhow::Result<Volume> {
        Self::open(path, name, page_size)
            .with_context(|| format!("open volume {name:?} at {}", path.display()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pages the file currently covers (allocated high-water mark).
    pub fn page_count(&self) -> PageAddr {
        self.meta.lock().expect("volume meta lock").next_page
    }

    // -------- raw page I/O --------

    /// Read the page image at `addr`. An allocated-but-never-written
    /// page reads as zeros.
    pub fn read_page(&self, addr: PageAddr) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        let off = addr
            .checked_mul(self.page_size as u64)
            .ok_or_else(|| Error::PageStructure(format!("page address {addr} overflow")))?;
        let len = self.file.metadata()?.len();
        if off >= len {
            return Ok(buf);
        }
        if off + self.page_size as u64 <= len {
            self.file.read_exact_at(&mut buf, off)?;
        } else {
            let avail = (len - off) as usize;
            self.file.read_exact_at(&mut buf[..avail], off)?;
        }
        Ok(buf)
    }

    /// Write a page image at `addr`, growing the file as needed. The
    /// caller is responsible for the WAL rule: a durable journal image
    /// of this page must exist first.
    pub fn write_page(&self, addr: PageAddr, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len(), self.page_size);
        let off = addr
            .checked_mul(self.page_size as u64)
            .ok_or_else(|| Error::PageStructure(format!("page address {addr} overflow")))?;
        self.file.write_all_at(bytes, off)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    // -------- head page --------

    /// Serialize the current meta into a head-page image.
    pub fn head_page_bytes(&self) -> Result<Vec<u8>> {
        let meta = self.meta.lock().expect("volume meta lock");
        encode_head(self.id, self.page_size, &meta)
    }

    /// Persist the head page directly. Used at create, checkpoint, and
    /// clean close; crash windows in between are covered by recovery
    /// replay.
    pub fn write_head(&self) -> Result<()> {
        let head = self.head_page_bytes()?;
        self.write_page(0, &head)
    }

    // -------- tree directory --------

    pub fn tree_names(&self) -> Vec<String> {
        let meta = self.meta.lock().expect("volume meta lock");
        meta.trees.iter().map(|t| t.name.clone()).collect()
    }

    pub fn tree_meta(&self, name: &str) -> Option<TreeMeta> {
        let meta = self.meta.lock().expect("volume meta lock");
        meta.tree(name).cloned()
    }

    /// Register a tree whose root has already been allocated. Checks the
    /// directory still fits the head page.
    pub fn add_tree(&self, tree: TreeMeta) -> Result<()> {
        let mut meta = self.meta.lock().expect("volume meta lock");
        if meta.tree(&tree.name).is_some() {
            return Ok(());
        }
        meta.trees.push(tree);
        let encoded = encode_head(self.id, self.page_size, &meta);
        if encoded.is_err() {
            meta.trees.pop();
        }
        encoded.map(|_| ())
    }

    pub fn update_tree<F, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut TreeMeta) -> T,
    {
        let mut meta = self.meta.lock().expect("volume meta lock");
        let tree = meta
            .tree_mut(name)
            .ok_or_else(|| Error::TreeNotFound(name.to_string()))?;
        Ok(f(tree))
    }

    pub fn remove_tree(&self, name: &str) -> Result<TreeMeta> {
        let mut meta = self.meta.lock().expect("volume meta lock");
        let idx = meta
            .trees
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| Error::TreeNotFound(name.to_string()))?;
        Ok(meta.trees.remove(idx))
    }
}

impl std::fmt::Display for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = self.meta.lock().expect("volume meta lock");
        write!(
            f,
            "Volume(name={}, id={:#018x}, page_size={}, pages={}, trees={})",
            self.name,
            self.id,
            self.page_size,
            meta.next_page,
            meta.trees.len()
        )
    }
}

fn mint_volume_id() -> u64 {
    // Not cryptographic; only needs to distinguish volumes in journal IV
    // records across recreate cycles.
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ (std::process::id() as u64).rotate_left(32) | 1
}

fn encode_head(id: u64, page_size: usize, meta: &VolumeMeta) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    let mut scratch = [0u8; 8];
    wire::put_u32(&mut scratch[..4], VOLUME_VERSION);
    payload.extend_from_slice(&scratch[..4]);
    wire::put_u64(&mut scratch, id);
    payload.extend_from_slice(&scratch);
    wire::put_u32(&mut scratch[..4], page_size as u32);
    payload.extend_from_slice(&scratch[..4]);
    wire::put_u64(&mut scratch, meta.next_page);
    payload.extend_from_slice(&scratch);
    wire::put_u64(&mut scratch, meta.free_head);
    payload.extend_from_slice(&scratch);
    wire::put_u16(&mut scratch[..2], meta.trees.len() as u16);
    payload.extend_from_slice(&scratch[..2]);
    for tree in &meta.trees {
        tree.encode_into(&mut payload);
    }

    if HEAD_PAYLOAD + payload.len() > page_size {
        return Err(Error::VolumeOverflow);
    }

    let mut page = Page::new(page_size, PageType::Head, 0).into_bytes();
    page[HEAD_MAGIC..HEAD_MAGIC + 4].copy_from_slice(VOLUME_MAGIC);
    wire::put_u32(&mut page[HEAD_CRC..], crc32c(&payload));
    wire::put_u32(&mut page[HEAD_PAYLOAD_LEN..], payload.len() as u32);
    page[HEAD_PAYLOAD..HEAD_PAYLOAD + payload.len()].copy_from_slice(&payload);
    Ok(page)
}

fn decode_head(head: &[u8], page_size: usize) -> Result<(u64, VolumeMeta)> {
    if &head[HEAD_MAGIC..HEAD_MAGIC + 4] != VOLUME_MAGIC {
        return Err(Error::PageStructure("volume head magic".into()));
    }
    let payload_len = wire::get_u32(&head[HEAD_PAYLOAD_LEN..]) as usize;
    if HEAD_PAYLOAD + payload_len > head.len() {
        return Err(Error::PageStructure("volume head payload length".into()));
    }
    let payload = &head[HEAD_PAYLOAD..HEAD_PAYLOAD + payload_len];
    let expected = wire::get_u32(&head[HEAD_CRC..]);
    let actual = crc32c(payload);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    let mut pos = 0;
    let version = wire::get_u32(&payload[pos..]);
    pos += 4;
    if version != VOLUME_VERSION {
        return Err(Error::PageStructure(format!("volume version {version}")));
    }
    let id = wire::get_u64(&payload[pos..]);
    pos += 8;
    let stored_page_size = wire::get_u32(&payload[pos..]) as usize;
    pos += 4;
    if stored_page_size != page_size {
        return Err(Error::PageStructure(format!(
            "volume page size {stored_page_size}, engine expects {page_size}"
        )));
    }
    let next_page = wire::get_u64(&payload[pos..]);
    pos += 8;
    let free_head = wire::get_u64(&payload[pos..]);
    pos += 8;
    let tree_count = wire::get_u16(&payload[pos..]) as usize;
    pos += 2;
    let mut trees = Vec::with_capacity(tree_count);
    for _ in 0..tree_count {
        trees.push(TreeMeta::decode_from(payload, &mut pos)?);
    }
    Ok((id, VolumeMeta { next_page, free_head, trees }))
}

#[cfg(test)]
mod test {
    use super::Volume;
    use crate::tree::TreeMeta;

    const PAGE: usize = 4096;

    #[test]
    fn test_create_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.vol");
        let id;
        {
            let v = Volume::create(&path, "data", PAGE).unwrap();
            id = v.id();
            v.add_tree(TreeMeta::new("orders", 7)).unwrap();
            {
                let mut meta = v.meta.lock().unwrap();
                meta.next_page = 12;
                meta.free_head = 4;
            }
            v.write_head().unwrap();
        }
        let v = Volume::open(&path, "data", PAGE).unwrap();
        assert_eq!(v.id(), id);
        let meta = v.meta.lock().unwrap();
        assert_eq!(meta.next_page, 12);
        assert_eq!(meta.free_head, 4);
        assert_eq!(meta.trees.len(), 1);
        assert_eq!(meta.tree("orders").unwrap().root, 7);
    }

    #[test]
    fn test_head_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.vol");
        {
            Volume::create(&path, "data", PAGE).unwrap();
        }
        // flip a payload byte
        use std::os::unix::fs::FileExt;
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.write_all_at(&[0xaa], 52).unwrap();
        match Volume::open(&path, "data", PAGE) {
            Err(crate::error::Error::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_unwritten_page_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.vol");
        let v = Volume::create(&path, "data", PAGE).unwrap();
        let page = v.read_page(9).unwrap();
        assert!(page.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_page_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.vol");
        let v = Volume::create(&path, "data", PAGE).unwrap();
        let mut img = vec![0u8; PAGE];
        img[0] = 1;
        img[PAGE - 1] = 0x5a;
        v.write_page(3, &img).unwrap();
        assert_eq!(v.read_page(3).unwrap(), img);
    }
}
