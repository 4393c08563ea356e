//! Exchange: the per-tree traversal/read/write handle, plus the tree
//! I/O layer it (and commit apply) drives.
//!
//! An exchange owns a mutable `Key`, a mutable `Value`, and a cached
//! descent path of (page address, generation) pairs. The cache is
//! revalidated by generation on every use: any page mutation bumps the
//! generation, so a stale cache (concurrent writer, sibling cross, root
//! change) falls back to a fresh root-to-leaf descent.
//!
//! Mutations never touch the tree directly: they claim the key for
//! conflict detection and buffer into the transaction. The tree write
//! path below (`TreeIo`) runs at commit apply time, under the engine's
//! apply lock, and during recovery redo.

use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;

use crate::buffer::{BufferPool, Intent, PagePin};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::page::{Page, PageType, LONG_POINTER_LEN, NO_PAGE, VALUE_INLINE, VALUE_LONG};
use crate::tree::{AccumulatorKind, TreeMeta, ACCUMULATOR_SLOTS};
use crate::txn::Transaction;
use crate::value::Value;
use crate::volume::Volume;
use crate::wire;
use crate::{PageAddr, Ts, TreeHandle, VolumeHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PathLevel {
    pub addr: PageAddr,
    pub generation: u64,
}

/// Tree-structure I/O over the buffer pool: descent, store with split
/// propagation, remove with merge, ordered entry iteration, long-record
/// chains, page allocation. All mutating entry points run under the
/// engine apply lock.
pub(crate) struct TreeIo<'a> {
    pool: &'a BufferPool,
    volume: &'a Arc<Volume>,
    vh: VolumeHandle,
    tree: &'a str,
}

impl<'a> TreeIo<'a> {
    pub fn new(
        pool: &'a BufferPool,
        volume: &'a Arc<Volume>,
        vh: VolumeHandle,
        tree: &'a str,
    ) -> TreeIo<'a> {
        TreeIo { pool, volume, vh, tree }
    }

    pub fn pin(&self, addr: PageAddr, intent: Intent) -> Result<PagePin<'a>> {
        self.pool.get(self.volume, self.vh, addr, intent, None)
    }

    pub fn root(&self) -> Option<(PageAddr, u32)> {
        self.volume.tree_meta(self.tree).map(|t| (t.root, t.depth))
    }

    /// Create the tree with a single empty leaf root, if absent.
    pub fn ensure_root(&self, ts: Ts) -> Result<()> {
        if self.volume.tree_meta(self.tree).is_some() {
            return Ok(());
        }
        let root = self.allocate(ts)?;
        {
            let pin = self.pin(root, Intent::Write)?;
            let mut data = pin.write();
            data.page.init(PageType::Data, ts);
            data.mark_dirty(ts);
        }
        self.volume.add_tree(TreeMeta::new(self.tree, root))
    }

    // -------- page allocation --------

    pub fn allocate(&self, ts: Ts) -> Result<PageAddr> {
        let mut meta = self.volume.meta.lock().expect("volume meta lock");
        if meta.free_head != NO_PAGE {
            let addr = meta.free_head;
            let next = {
                let pin = self.pin(addr, Intent::Read)?;
                let data = pin.read();
                data.page.free_next()
            };
            meta.free_head = next;
            return Ok(addr);
        }
        let addr = meta.next_page;
        meta.next_page += 1;
        Ok(addr)
    }

    pub fn free(&self, addr: PageAddr, ts: Ts) -> Result<()> {
        let mut meta = self.volume.meta.lock().expect("volume meta lock");
        {
            let pin = self.pin(addr, Intent::Write)?;
            let mut data = pin.write();
            data.page.init_garbage(ts, meta.free_head);
            data.mark_dirty(ts);
        }
        meta.free_head = addr;
        Ok(())
    }

    // -------- descent --------

    fn descend(&self, key: &[u8]) -> Result<Vec<PathLevel>> {
        let Some((root, _)) = self.root() else {
            return Err(Error::TreeNotFound(self.tree.to_string()));
        };
        let mut path = Vec::new();
        let mut addr = root;
        loop {
            let pin = self.pin(addr, Intent::Read)?;
            let data = pin.read();
            match data.page.page_type()? {
                PageType::Index => {
                    let idx = data.page.find_child(key)?;
                    let child = data.page.child_at(idx);
                    path.push(PathLevel { addr, generation: data.page.generation() });
                    drop(data);
                    addr = child;
                }
                PageType::Data => {
                    path.push(PathLevel { addr, generation: data.page.generation() });
                    return Ok(path);
                }
                other => {
                    return Err(Error::PageStructure(format!(
                        "descent hit {other:?} page at {addr}"
                    )));
                }
            }
        }
    }

    /// Descend to the leaf covering `key`, hopping right-sibling links
    /// when a concurrent (or replayed) split moved the key range past
    /// the parent's knowledge.
    pub fn leaf_for(&self, key: &[u8]) -> Result<Vec<PathLevel>> {
        let mut path = self.descend(key)?;
        loop {
            let leaf = path.last().expect("descent path");
            let (right, hop) = {
                let pin = self.pin(leaf.addr, Intent::Read)?;
                let data = pin.read();
                let right = data.page.right_sibling();
                if right == NO_PAGE {
                    (right, false)
                } else {
                    let rpin = self.pin(right, Intent::Read)?;
                    let rdata = rpin.read();
                    let hop = rdata.page.key_count() > 0
                        && rdata.page.key_at(0).as_slice() <= key;
                    (right, hop)
                }
            };
            if !hop {
                return Ok(path);
            }
            let generation = {
                let pin = self.pin(right, Intent::Read)?;
                pin.read().page.generation()
            };
            *path.last_mut().expect("descent path") = PathLevel { addr: right, generation };
        }
    }

    // -------- values --------

    pub fn decode_entry(&self, entry: &[u8]) -> Result<Vec<u8>> {
        match entry.first() {
            Some(&VALUE_INLINE) => Ok(entry[1..].to_vec()),
            Some(&VALUE_LONG) if entry.len() == LONG_POINTER_LEN => {
                let len = wire::get_u32(&entry[1..]) as usize;
                let head = wire::get_u64(&entry[5..]);
                self.read_chain(head, len)
            }
            _ => Err(Error::PageStructure("value kind prefix".into())),
        }
    }

    fn read_chain(&self, head: PageAddr, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut addr = head;
        while addr != NO_PAGE {
            let pin = self.pin(addr, Intent::Read)?;
            let data = pin.read();
            if data.page.page_type()? != PageType::LongRecord {
                return Err(Error::PageStructure("long-record chain page type".into()));
            }
            out.extend_from_slice(data.page.long_chunk()?);
            addr = data.page.long_next();
        }
        if out.len() != len {
            return Err(Error::PageStructure(format!(
                "long record length {} != {len}",
                out.len()
            )));
        }
        Ok(out)
    }

    fn write_chain(&self, value: &[u8], ts: Ts) -> Result<PageAddr> {
        let cap = Page::long_chunk_capacity(self.pool.page_size());
        let mut next = NO_PAGE;
        for chunk in value.chunks(cap).rev() {
            let addr = self.allocate(ts)?;
            let pin = self.pin(addr, Intent::Write)?;
            let mut data = pin.write();
            data.page.init_long(ts, chunk, next);
            data.mark_dirty(ts);
            next = addr;
        }
        Ok(next)
    }

    pub fn free_chain(&self, head: PageAddr, ts: Ts) -> Result<()> {
        let mut addr = head;
        while addr != NO_PAGE {
            let next = {
                let pin = self.pin(addr, Intent::Read)?;
                pin.read().page.long_next()
            };
            self.free(addr, ts)?;
            addr = next;
        }
        Ok(())
    }

    /// Existing long-record head for `key`, if its current entry is an
    /// indirect pointer.
    fn long_head_of(&self, key: &[u8]) -> Result<Option<PageAddr>> {
        let path = self.leaf_for(key)?;
        let pin = self.pin(path.last().expect("leaf").addr, Intent::Read)?;
        let data = pin.read();
        let (idx, exact) = data.page.find(key);
        if !exact {
            return Ok(None);
        }
        let entry = data.page.value_at(idx);
        if entry.first() == Some(&VALUE_LONG) && entry.len() == LONG_POINTER_LEN {
            Ok(Some(wire::get_u64(&entry[5..])))
        } else {
            Ok(None)
        }
    }

    // -------- point reads --------

    pub fn fetch(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root().is_none() {
            return Ok(None);
        }
        let path = self.leaf_for(key)?;
        let entry = {
            let pin = self.pin(path.last().expect("leaf").addr, Intent::Read)?;
            let data = pin.read();
            let (idx, exact) = data.page.find(key);
            if !exact {
                return Ok(None);
            }
            data.page.value_at(idx).to_vec()
        };
        self.decode_entry(&entry).map(Some)
    }

    // -------- store --------

    pub fn store(&self, key: &[u8], value: &[u8], ts: Ts) -> Result<()> {
        let threshold = self.pool.page_size() / 4;
        let old_chain = self.long_head_of(key)?;
        let entry = if 1 + value.len() > threshold {
            let head = self.write_chain(value, ts)?;
            let mut entry = vec![0u8; LONG_POINTER_LEN];
            entry[0] = VALUE_LONG;
            wire::put_u32(&mut entry[1..5], value.len() as u32);
            wire::put_u64(&mut entry[5..], head);
            entry
        } else {
            let mut entry = Vec::with_capacity(1 + value.len());
            entry.push(VALUE_INLINE);
            entry.extend_from_slice(value);
            entry
        };
        // the worst-case full-key entry must fit the emptier side of a
        // split page, which the minimum fill factor caps at 1/3 free.
        let limit = (self.pool.page_size() - 32) / 3;
        if 8 + 2 + key.len() + entry.len() > limit {
            return Err(Error::KeyTooLong(key.len() + entry.len()));
        }

        self.insert_entry(key, &entry, ts)?;
        if let Some(head) = old_chain {
            self.free_chain(head, ts)?;
        }
        Ok(())
    }

    fn insert_entry(&self, key: &[u8], entry: &[u8], ts: Ts) -> Result<()> {
        let mut path = self.leaf_for(key)?;
        let leaf = path.pop().expect("leaf").addr;
        {
            let pin = self.pin(leaf, Intent::Write)?;
            let mut data = pin.write();
            if data.page.insert(key, entry)? {
                data.mark_dirty(ts);
                return Ok(());
            }
        }
        self.split_and_insert(path, leaf, key, entry, ts)
    }

    fn split_and_insert(
        &self,
        path: Vec<PathLevel>,
        page_addr: PageAddr,
        key: &[u8],
        entry: &[u8],
        ts: Ts,
    ) -> Result<()> {
        let right_addr = self.allocate(ts)?;
        let pivot;
        {
            let left_pin = self.pin(page_addr, Intent::Write)?;
            let right_pin = self.pin(right_addr, Intent::Write)?;
            let mut left = left_pin.write();
            let mut right = right_pin.write();
            pivot = left.page.split_into(&mut right.page)?;
            left.page.set_right_sibling(right_addr);

            let target = if key < pivot.as_slice() { &mut left } else { &mut right };
            if !target.page.insert(key, entry)? {
                return Err(Error::KeyTooLong(key.len() + entry.len()));
            }
            left.mark_dirty(ts);
            right.mark_dirty(ts);
        }
        self.insert_pivot(path, page_addr, pivot, right_addr, ts)
    }

    /// Insert (pivot → right) into the parent level, splitting upward as
    /// needed. An empty path means the split page was the root.
    fn insert_pivot(
        &self,
        mut path: Vec<PathLevel>,
        left_addr: PageAddr,
        pivot: Vec<u8>,
        right_addr: PageAddr,
        ts: Ts,
    ) -> Result<()> {
        let mut child_entry = [0u8; 8];
        wire::put_u64(&mut child_entry, right_addr);

        let Some(parent) = path.pop() else {
            // Root split: a fresh index root with the old page as the
            // leftmost edge.
            let new_root = self.allocate(ts)?;
            {
                let pin = self.pin(new_root, Intent::Write)?;
                let mut data = pin.write();
                data.page.init(PageType::Index, ts);
                let mut left_entry = [0u8; 8];
                wire::put_u64(&mut left_entry, left_addr);
                data.page.insert(&[], &left_entry)?;
                data.page.insert(&pivot, &child_entry)?;
                data.mark_dirty(ts);
            }
            self.volume.update_tree(self.tree, |t| {
                t.root = new_root;
                t.depth += 1;
            })?;
            return Ok(());
        };

        {
            let pin = self.pin(parent.addr, Intent::Write)?;
            let mut data = pin.write();
            if data.page.insert(&pivot, &child_entry)? {
                data.mark_dirty(ts);
                return Ok(());
            }
        }

        // Parent is full: split it and re-place the pivot.
        let new_right = self.allocate(ts)?;
        let upper;
        {
            let left_pin = self.pin(parent.addr, Intent::Write)?;
            let right_pin = self.pin(new_right, Intent::Write)?;
            let mut left = left_pin.write();
            let mut right = right_pin.write();
            upper = left.page.split_into(&mut right.page)?;
            left.page.set_right_sibling(new_right);

            let target = if pivot.as_slice() < upper.as_slice() { &mut left } else { &mut right };
            if !target.page.insert(&pivot, &child_entry)? {
                return Err(Error::KeyTooLong(pivot.len()));
            }
            left.mark_dirty(ts);
            right.mark_dirty(ts);
        }
        self.insert_pivot(path, parent.addr, upper, new_right, ts)
    }

    // -------- remove --------

    pub fn remove(&self, key: &[u8], ts: Ts) -> Result<bool> {
        if self.root().is_none() {
            return Ok(false);
        }
        let path = self.leaf_for(key)?;
        let leaf = path.last().expect("leaf").addr;
        let freed_chain;
        {
            let pin = self.pin(leaf, Intent::Write)?;
            let mut data = pin.write();
            let (idx, exact) = data.page.find(key);
            if !exact {
                return Ok(false);
            }
            let entry = data.page.value_at(idx);
            freed_chain = if entry.first() == Some(&VALUE_LONG) && entry.len() == LONG_POINTER_LEN
            {
                Some(wire::get_u64(&entry[5..]))
            } else {
                None
            };
            data.page.remove_at(idx)?;
            data.mark_dirty(ts);
        }
        if let Some(head) = freed_chain {
            self.free_chain(head, ts)?;
        }
        self.rebalance(path, ts)?;
        Ok(true)
    }

    /// After a removal: absorb the right sibling when the pair fits one
    /// page (and shares a parent), drop emptied pages, shrink the root.
    fn rebalance(&self, mut path: Vec<PathLevel>, ts: Ts) -> Result<()> {
        while path.len() >= 2 {
            let level = path.pop().expect("level");
            let parent = *path.last().expect("parent");
            let merged = self.try_absorb(parent.addr, level.addr, ts)?;
            if !merged {
                break;
            }
        }
        self.shrink_root(ts)
    }

    /// Merge `page` with a neighbor under the same parent when the
    /// combined payload fits one page: the right neighbor folds into
    /// `page`, or `page` folds into its left neighbor. True when a merge
    /// happened (the parent may then itself be a merge candidate).
    fn try_absorb(&self, parent_addr: PageAddr, page_addr: PageAddr, ts: Ts) -> Result<bool> {
        let (pidx, count) = {
            let pin = self.pin(parent_addr, Intent::Read)?;
            let data = pin.read();
            if data.page.page_type()? != PageType::Index {
                return Ok(false);
            }
            let count = data.page.key_count();
            let Some(pidx) = (0..count).find(|&i| data.page.child_at(i) == page_addr) else {
                return Ok(false);
            };
            (pidx, count)
        };
        if pidx + 1 < count && self.absorb_pair(parent_addr, pidx, ts)? {
            return Ok(true);
        }
        if pidx > 0 && self.absorb_pair(parent_addr, pidx - 1, ts)? {
            return Ok(true);
        }
        Ok(false)
    }

    /// Fold the parent's child `left_idx + 1` into child `left_idx`.
    fn absorb_pair(&self, parent_addr: PageAddr, left_idx: usize, ts: Ts) -> Result<bool> {
        let (left_addr, right_addr, pivot) = {
            let pin = self.pin(parent_addr, Intent::Read)?;
            let data = pin.read();
            if left_idx + 1 >= data.page.key_count() {
                return Ok(false);
            }
            (
                data.page.child_at(left_idx),
                data.page.child_at(left_idx + 1),
                data.page.key_at(left_idx + 1),
            )
        };

        // Snapshot the neighbor; the apply lock makes this stable.
        let right_page = {
            let pin = self.pin(right_addr, Intent::Read)?;
            pin.read().page.clone()
        };
        {
            let pin = self.pin(left_addr, Intent::Write)?;
            let mut data = pin.write();
            if !data.page.can_absorb(&right_page) {
                return Ok(false);
            }
            // on index pages the parent separator re-keys the neighbor's
            // leftmost edge; leaves carry their keys in full.
            let rekey = if data.page.page_type()? == PageType::Index {
                Some(pivot.as_slice())
            } else {
                None
            };
            data.page.absorb(&right_page, rekey)?;
            data.mark_dirty(ts);
        }
        {
            let pin = self.pin(parent_addr, Intent::Write)?;
            let mut data = pin.write();
            data.page.remove_at(left_idx + 1)?;
            data.mark_dirty(ts);
        }
        self.free(right_addr, ts)?;
        Ok(true)
    }

    fn shrink_root(&self, ts: Ts) -> Result<()> {
        loop {
            let Some((root, depth)) = self.root() else { return Ok(()) };
            if depth <= 1 {
                return Ok(());
            }
            let only_child = {
                let pin = self.pin(root, Intent::Read)?;
                let data = pin.read();
                if data.page.page_type()? == PageType::Index && data.page.key_count() == 1 {
                    Some(data.page.child_at(0))
                } else {
                    None
                }
            };
            let Some(child) = only_child else { return Ok(()) };
            self.volume.update_tree(self.tree, |t| {
                t.root = child;
                t.depth -= 1;
            })?;
            self.free(root, ts)?;
        }
    }

    // -------- ordered iteration --------

    /// Smallest entry with key > `bound` (or ≥ when `inclusive`).
    /// Returns the reconstructed key and the decoded value.
    pub fn next_entry(&self, bound: &[u8], inclusive: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.root().is_none() {
            return Ok(None);
        }
        let path = self.leaf_for(bound)?;
        let mut addr = path.last().expect("leaf").addr;
        loop {
            let (found, right) = {
                let pin = self.pin(addr, Intent::Read)?;
                let data = pin.read();
                let (i, exact) = data.page.find(bound);
                let start = if exact && !inclusive { i + 1 } else { i };
                if start < data.page.key_count() {
                    (
                        Some((data.page.key_at(start), data.page.value_at(start).to_vec())),
                        NO_PAGE,
                    )
                } else {
                    (None, data.page.right_sibling())
                }
            };
            if let Some((key, entry)) = found {
                let value = self.decode_entry(&entry)?;
                return Ok(Some((key, value)));
            }
            if right == NO_PAGE {
                return Ok(None);
            }
            addr = right;
        }
    }

    /// Largest entry with key < `bound` (or ≤ when `inclusive`).
    pub fn prev_entry(&self, bound: &[u8], inclusive: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.root().is_none() {
            return Ok(None);
        }
        let path = self.leaf_for(bound)?;
        let leaf = path.last().expect("leaf").addr;
        {
            let pin = self.pin(leaf, Intent::Read)?;
            let data = pin.read();
            let (i, exact) = data.page.find(bound);
            let idx = if exact && inclusive {
                Some(i)
            } else if i > 0 {
                Some(i - 1)
            } else {
                None
            };
            if let Some(idx) = idx {
                let key = data.page.key_at(idx);
                let entry = data.page.value_at(idx).to_vec();
                drop(data);
                let value = self.decode_entry(&entry)?;
                return Ok(Some((key, value)));
            }
        }
        // The leaf held nothing below the bound: walk up for a left
        // neighbor, then down its rightmost spine.
        for depth in (0..path.len().saturating_sub(1)).rev() {
            let level = path[depth];
            let pin = self.pin(level.addr, Intent::Read)?;
            let data = pin.read();
            if data.page.page_type()? != PageType::Index {
                continue;
            }
            let child_here = path[depth + 1].addr;
            let count = data.page.key_count();
            let Some(idx) = (0..count).find(|&i| data.page.child_at(i) == child_here) else {
                continue;
            };
            if idx == 0 {
                continue;
            }
            let mut addr = data.page.child_at(idx - 1);
            drop(data);
            loop {
                let pin = self.pin(addr, Intent::Read)?;
                let data = pin.read();
                match data.page.page_type()? {
                    PageType::Index => {
                        let count = data.page.key_count();
                        if count == 0 {
                            return Ok(None);
                        }
                        addr = data.page.child_at(count - 1);
                    }
                    PageType::Data => {
                        let count = data.page.key_count();
                        if count == 0 {
                            return Ok(None);
                        }
                        let key = data.page.key_at(count - 1);
                        let entry = data.page.value_at(count - 1).to_vec();
                        drop(data);
                        let value = self.decode_entry(&entry)?;
                        return Ok(Some((key, value)));
                    }
                    _ => return Err(Error::PageStructure("rightmost spine".into())),
                }
            }
        }
        Ok(None)
    }

    // -------- tree removal --------

    /// Free every page of the tree (long-record chains included) and
    /// drop the directory entry.
    pub fn remove_tree(&self, ts: Ts) -> Result<()> {
        let Some((root, _)) = self.root() else { return Ok(()) };
        self.free_subtree(root, ts)?;
        let _ = self.volume.remove_tree(self.tree);
        Ok(())
    }

    fn free_subtree(&self, addr: PageAddr, ts: Ts) -> Result<()> {
        let mut children = Vec::new();
        let mut chains = Vec::new();
        {
            let pin = self.pin(addr, Intent::Read)?;
            let data = pin.read();
            match data.page.page_type()? {
                PageType::Index => {
                    for i in 0..data.page.key_count() {
                        children.push(data.page.child_at(i));
                    }
                }
                PageType::Data => {
                    for i in 0..data.page.key_count() {
                        let entry = data.page.value_at(i);
                        if entry.first() == Some(&VALUE_LONG)
                            && entry.len() == LONG_POINTER_LEN
                        {
                            chains.push(wire::get_u64(&entry[5..]));
                        }
                    }
                }
                _ => {}
            }
        }
        for child in children {
            self.free_subtree(child, ts)?;
        }
        for head in chains {
            self.free_chain(head, ts)?;
        }
        self.free(addr, ts)
    }
}

/// Point lookup honoring (and refreshing) the cursor's cached leaf.
/// Returns the decoded value and the cache to keep.
fn fetch_tree_cached(
    io: &TreeIo<'_>,
    key: &[u8],
    cached: Option<(PageAddr, u64)>,
) -> Result<(Option<Vec<u8>>, Option<(PageAddr, u64)>)> {
    if let Some((addr, generation)) = cached {
        let mut hit = None;
        {
            let pin = io.pin(addr, Intent::Read)?;
            let data = pin.read();
            let count = data.page.key_count();
            if data.page.generation() == generation
                && data.page.page_type()? == PageType::Data
                && count > 0
                && data.page.key_at(0).as_slice() <= key
                && key <= data.page.key_at(count - 1).as_slice()
            {
                let (idx, exact) = data.page.find(key);
                hit = Some(if exact {
                    Some(data.page.value_at(idx).to_vec())
                } else {
                    None
                });
            }
        }
        if let Some(found) = hit {
            let value = match found {
                Some(entry) => Some(io.decode_entry(&entry)?),
                None => None,
            };
            return Ok((value, cached));
        }
    }

    if io.root().is_none() {
        return Ok((None, None));
    }
    let path = io.leaf_for(key)?;
    let leaf = *path.last().expect("leaf");
    let (entry, generation) = {
        let pin = io.pin(leaf.addr, Intent::Read)?;
        let data = pin.read();
        let (idx, exact) = data.page.find(key);
        let entry = if exact { Some(data.page.value_at(idx).to_vec()) } else { None };
        (entry, data.page.generation())
    };
    let value = match entry {
        Some(entry) => Some(io.decode_entry(&entry)?),
        None => None,
    };
    Ok((value, Some((leaf.addr, generation))))
}

/// Per-tree cursor handle.
pub struct Exchange {
    engine: Engine,
    volume: Arc<Volume>,
    vh: VolumeHandle,
    tree_name: String,
    th: TreeHandle,
    key: Key,
    value: Value,
    /// (leaf address, generation) of the last descent, for the
    /// same-page fast path.
    cached_leaf: Option<(PageAddr, u64)>,
}

impl Exchange {
    pub(crate) fn new(
        engine: Engine,
        volume: Arc<Volume>,
        vh: VolumeHandle,
        tree_name: String,
        th: TreeHandle,
    ) -> Exchange {
        Exchange {
            engine,
            volume,
            vh,
            tree_name,
            th,
            key: Key::new(),
            value: Value::new(),
            cached_leaf: None,
        }
    }

    fn io(&self) -> TreeIo<'_> {
        TreeIo::new(&self.engine.inner.pool, &self.volume, self.vh, &self.tree_name)
    }

    pub fn tree_name(&self) -> &str {
        &self.tree_name
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn key_mut(&mut self) -> &mut Key {
        &mut self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    fn encoded_key(&self) -> Result<Vec<u8>> {
        if self.key.is_before() || self.key.is_after() {
            return Err(Error::InvalidKey("sentinel key in point operation"));
        }
        Ok(self.key.encoded().to_vec())
    }

    // -------- point operations --------

    /// Resolve the current key into the value buffer. Order: the
    /// transaction's own writes, then the snapshot overlay, then the
    /// tree. True when a value is defined afterwards.
    pub fn fetch(&mut self, txn: &Transaction) -> Result<bool> {
        let key = self.encoded_key()?;
        if let Some(writes) = txn.writes(self.th) {
            if let Some(resolved) = writes.resolve(&key) {
                match resolved {
                    Some(v) => self.value.adopt(v.to_vec()),
                    None => {
                        self.value.clear();
                    }
                }
                return Ok(self.value.is_defined());
            }
        }
        if let Some(snapshot) = self
            .engine
            .inner
            .txns
            .snapshot_value(self.th, &key, txn.start_ts())
        {
            match snapshot {
                Some(v) => self.value.adopt(v),
                None => {
                    self.value.clear();
                }
            }
            return Ok(self.value.is_defined());
        }
        match self.fetch_tree(&key)? {
            Some(v) => self.value.adopt(v),
            None => {
                self.value.clear();
            }
        }
        Ok(self.value.is_defined())
    }

    /// Tree lookup with the same-page fast path: if the cached leaf's
    /// generation still matches and the key falls inside its range, the
    /// full descent is skipped.
    fn fetch_tree(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        // direct field borrows keep `cached_leaf` assignable alongside
        // the I/O handle.
        let io = TreeIo::new(&self.engine.inner.pool, &self.volume, self.vh, &self.tree_name);
        let (result, cache) = fetch_tree_cached(&io, key, self.cached_leaf)?;
        self.cached_leaf = cache;
        Ok(result)
    }

    /// Buffer a store of the current key/value pair into the
    /// transaction, claiming the key for conflict detection.
    pub fn store(&mut self, txn: &mut Transaction) -> Result<()> {
        txn.check_active()?;
        let key = self.encoded_key()?;
        self.engine.inner.txns.claim(txn, self.th, &key)?;
        txn.record_store(self.th, key, self.value.as_bytes().to_vec());
        Ok(())
    }

    /// Buffer a removal of the current key. True when the key is
    /// currently visible to this transaction.
    pub fn remove(&mut self, txn: &mut Transaction) -> Result<bool> {
        txn.check_active()?;
        let key = self.encoded_key()?;
        self.engine.inner.txns.claim(txn, self.th, &key)?;
        let visible = self.fetch(txn)?;
        txn.record_remove(self.th, key);
        self.value.clear();
        Ok(visible)
    }

    /// Buffer removal of the half-open range [current key, `to`).
    pub fn remove_range(&mut self, to: &Key, txn: &mut Transaction) -> Result<()> {
        txn.check_active()?;
        let key1 = if self.key.is_before() { Vec::new() } else { self.key.encoded().to_vec() };
        let key2 = to.encoded().to_vec();
        if key1.as_slice() >= key2.as_slice() && !to.is_after() {
            return Ok(());
        }
        let key2 = if to.is_after() { vec![0xff] } else { key2 };
        if !key1.is_empty() {
            self.engine.inner.txns.claim(txn, self.th, &key1)?;
        }
        txn.record_remove_range(self.th, key1, key2);
        Ok(())
    }

    /// Buffer removal of the whole tree.
    pub fn remove_tree(&mut self, txn: &mut Transaction) -> Result<()> {
        txn.check_active()?;
        txn.record_remove_tree(self.th);
        self.cached_leaf = None;
        Ok(())
    }

    // -------- traversal --------

    pub fn next(&mut self, txn: &Transaction, skip_subtree: bool) -> Result<bool> {
        self.traverse(txn, Direction::Forward, !skip_subtree)
    }

    pub fn previous(&mut self, txn: &Transaction, skip_subtree: bool) -> Result<bool> {
        self.traverse(txn, Direction::Backward, !skip_subtree)
    }

    /// Move the cursor to the adjacent visible key. `deep` traversal
    /// visits every key; shallow traversal (`deep = false`) skips the
    /// current key's subtree and truncates the result to the cursor's
    /// segment depth, so it walks segment boundaries.
    ///
    /// Candidates merge the committed tree with the transaction's own
    /// write set; keys the transaction removed are invisible. Returns
    /// false (cursor unchanged) at the end of the tree.
    pub fn traverse(&mut self, txn: &Transaction, dir: Direction, deep: bool) -> Result<bool> {
        let depth = self.key.segment_count().max(1);
        let mut bound: Vec<u8> = match dir {
            Direction::Forward => {
                if self.key.is_after() {
                    return Ok(false);
                } else if self.key.is_before() {
                    Vec::new()
                } else if deep {
                    self.key.encoded().to_vec()
                } else {
                    let mut b = self.key.encoded().to_vec();
                    b.push(0xff);
                    b
                }
            }
            Direction::Backward => {
                if self.key.is_before() {
                    return Ok(false);
                } else if self.key.is_after() {
                    vec![0xff]
                } else {
                    self.key.encoded().to_vec()
                }
            }
        };

        loop {
            self.engine.check_interrupted()?;

            let tree_cand = match dir {
                Direction::Forward => self.io().next_entry(&bound, false)?,
                Direction::Backward => self.io().prev_entry(&bound, false)?,
            };
            let ws_cand = txn.writes(self.th).and_then(|w| match dir {
                Direction::Forward => w
                    .puts
                    .range::<Vec<u8>, _>((Excluded(bound.clone()), Unbounded))
                    .find(|(_, v)| v.is_some())
                    .map(|(k, v)| (k.clone(), v.clone().expect("present"))),
                Direction::Backward => w
                    .puts
                    .range::<Vec<u8>, _>(..bound.clone())
                    .rev()
                    .find(|(_, v)| v.is_some())
                    .map(|(k, v)| (k.clone(), v.clone().expect("present"))),
            });

            let candidate = match (tree_cand, ws_cand) {
                (None, None) => return Ok(false),
                (Some(t), None) => t,
                (None, Some(w)) => w,
                (Some(t), Some(w)) => match dir {
                    Direction::Forward => {
                        if w.0 <= t.0 { w } else { t }
                    }
                    Direction::Backward => {
                        if w.0 >= t.0 { w } else { t }
                    }
                },
            };
            let (cand_key, cand_value) = candidate;

            // keys this transaction removed are invisible.
            if let Some(writes) = txn.writes(self.th) {
                if matches!(writes.resolve(&cand_key), Some(None)) {
                    bound = cand_key;
                    continue;
                }
            }

            if deep {
                self.key.set_encoded(&cand_key);
                self.value.adopt(cand_value);
            } else {
                let mut full = Key::from_encoded(&cand_key);
                if full.segment_count() > depth {
                    full.truncate_to_segments(depth);
                    self.key = full;
                    // the truncated key is a logical grouping key; it
                    // only has a value if physically present.
                    let encoded = self.key.encoded().to_vec();
                    match self.fetch_tree(&encoded)? {
                        Some(v) => self.value.adopt(v),
                        None => {
                            self.value.clear();
                        }
                    }
                } else {
                    self.key = full;
                    self.value.adopt(cand_value);
                }
            }
            return Ok(true);
        }
    }

    // -------- accumulators --------

    /// Buffer an explicit accumulator delta (journaled as D1).
    pub fn accumulate(
        &mut self,
        txn: &mut Transaction,
        index: u16,
        kind: AccumulatorKind,
        delta: i64,
    ) -> Result<()> {
        txn.check_active()?;
        txn.record_delta(self.th, index % ACCUMULATOR_SLOTS as u16, kind, delta, true);
        Ok(())
    }

    /// Buffer the implicit +1 delta (journaled as D0).
    pub fn increment(
        &mut self,
        txn: &mut Transaction,
        index: u16,
        kind: AccumulatorKind,
    ) -> Result<()> {
        txn.check_active()?;
        txn.record_delta(self.th, index % ACCUMULATOR_SLOTS as u16, kind, 1, false);
        Ok(())
    }

    /// Committed accumulator value, plus this transaction's own
    /// buffered deltas when one is supplied.
    pub fn accumulator_value(&self, txn: Option<&Transaction>, index: u16) -> i64 {
        let index = index % ACCUMULATOR_SLOTS as u16;
        let base = self
            .volume
            .tree_meta(&self.tree_name)
            .map(|t| t.accumulators[index as usize].value)
            .unwrap_or(0);
        base + txn.map(|t| t.delta_sum(self.th, index)).unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::TreeIo;
    use crate::buffer::BufferPool;
    use crate::journal::Journal;
    use crate::page::NO_PAGE;
    use crate::volume::Volume;
    use std::sync::Arc;
    use std::time::Duration;

    const PAGE: usize = 1024;

    struct Fixture {
        _dir: tempfile::TempDir,
        volume: Arc<Volume>,
        pool: BufferPool,
        vh: crate::VolumeHandle,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let journal =
            Arc::new(Journal::create(dir.path(), 1024 * 1024, Duration::from_millis(1)).unwrap());
        let volume = Arc::new(Volume::create(&dir.path().join("v.vol"), "v", PAGE).unwrap());
        let vh = journal.volume_handle(&volume).unwrap();
        let pool = BufferPool::new(PAGE, PAGE * 32, journal);
        Fixture { _dir: dir, volume, pool, vh }
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key{i:06}").into_bytes()
    }

    #[test]
    fn test_store_fetch_through_splits() {
        let fx = fixture();
        let io = TreeIo::new(&fx.pool, &fx.volume, fx.vh, "t");
        io.ensure_root(1).unwrap();

        let n = 400u32;
        for i in 0..n {
            io.store(&key(i), format!("value{i}").as_bytes(), 2).unwrap();
        }
        let (_, depth) = io.root().unwrap();
        assert!(depth >= 2, "no split happened for {n} keys");
        for i in 0..n {
            let v = io.fetch(&key(i)).unwrap().unwrap();
            assert_eq!(v, format!("value{i}").into_bytes());
        }
        assert!(io.fetch(b"missing").unwrap().is_none());
    }

    #[test]
    fn test_iteration_crosses_leaves() {
        let fx = fixture();
        let io = TreeIo::new(&fx.pool, &fx.volume, fx.vh, "t");
        io.ensure_root(1).unwrap();
        let n = 300u32;
        for i in 0..n {
            io.store(&key(i), b"x", 2).unwrap();
        }

        let mut bound = Vec::new();
        let mut seen = 0u32;
        while let Some((k, _)) = io.next_entry(&bound, false).unwrap() {
            assert_eq!(k, key(seen));
            bound = k;
            seen += 1;
        }
        assert_eq!(seen, n);

        let mut bound = vec![0xffu8];
        let mut remaining = n;
        while let Some((k, _)) = io.prev_entry(&bound, false).unwrap() {
            remaining -= 1;
            assert_eq!(k, key(remaining));
            bound = k;
        }
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_remove_merges_and_shrinks_root() {
        let fx = fixture();
        let io = TreeIo::new(&fx.pool, &fx.volume, fx.vh, "t");
        io.ensure_root(1).unwrap();
        let n = 400u32;
        for i in 0..n {
            io.store(&key(i), b"padpadpadpadpad", 2).unwrap();
        }
        let (_, grown_depth) = io.root().unwrap();
        assert!(grown_depth >= 2);

        for i in 0..n {
            assert!(io.remove(&key(i), 3).unwrap());
        }
        assert!(io.next_entry(&[], true).unwrap().is_none());
        let (_, depth) = io.root().unwrap();
        assert_eq!(depth, 1, "root did not shrink back to a leaf");
        // freed pages went back to the allocator.
        assert_ne!(fx.volume.meta.lock().unwrap().free_head, NO_PAGE);
    }

    #[test]
    fn test_long_record_chain() {
        let fx = fixture();
        let io = TreeIo::new(&fx.pool, &fx.volume, fx.vh, "t");
        io.ensure_root(1).unwrap();

        let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        io.store(b"blob", &big, 2).unwrap();
        assert_eq!(io.fetch(b"blob").unwrap().unwrap(), big);

        // overwrite with a short value: the chain is freed.
        io.store(b"blob", b"tiny", 3).unwrap();
        assert_eq!(io.fetch(b"blob").unwrap().unwrap(), b"tiny".to_vec());
        assert_ne!(fx.volume.meta.lock().unwrap().free_head, NO_PAGE);
    }

    #[test]
    fn test_remove_tree_returns_pages() {
        let fx = fixture();
        let io = TreeIo::new(&fx.pool, &fx.volume, fx.vh, "t");
        io.ensure_root(1).unwrap();
        for i in 0..200u32 {
            io.store(&key(i), b"some payload here", 2).unwrap();
        }
        io.remove_tree(3).unwrap();
        assert!(io.root().is_none());
        assert_ne!(fx.volume.meta.lock().unwrap().free_head, NO_PAGE);
    }
}
