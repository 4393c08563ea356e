//! Fixed-size page format and B-tree node primitives.
//!
//! Layout of a data/index page:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ header (32 bytes)                                      │
//! ├────────────────────────────────────────────────────────┤
//! │ key block array, 8 bytes per entry, growing upward     │
//! │   ebc:u16 | klen:u16 | tail:u32                        │
//! │                        ...free...                      │
//! │ tail area, growing downward from the page end          │
//! │   vlen:u16 | suffix[klen] | value[vlen]                │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! `ebc` is the elision count: the number of leading bytes the entry's
//! key shares with the previous entry's key. Entry 0 always stores the
//! full key (ebc = 0). A stored ebc need not be maximal to be correct:
//! any entry lexically between two keys shares their common prefix, so
//! inserting between entries never invalidates a successor's elision.
//!
//! On index pages the value is always an 8-byte child page address and
//! the first entry has an empty key: the leftmost edge, covering every
//! key below the page's second entry.

use std::fmt::{self, Display};

use crate::error::{Error, Result};
use crate::wire;
use crate::{PageAddr, Ts};

pub const PAGE_HEADER_SIZE: usize = 32;
pub const KEY_BLOCK_SIZE: usize = 8;

// Header field offsets.
pub const PAGE_TYPE: usize = 0;
pub const PAGE_KEY_COUNT: usize = 2;
pub const PAGE_TAIL_OFFSET: usize = 4;
pub const PAGE_RIGHT_SIBLING: usize = 8;
pub const PAGE_GENERATION: usize = 16;
pub const PAGE_TIMESTAMP: usize = 24;

// Long-record page payload offsets.
pub const LONG_NEXT_PAGE: usize = 32;
pub const LONG_CHUNK_LEN: usize = 40;
pub const LONG_CHUNK_START: usize = 44;

// Free pages chain through the same slot as the long-record forward
// pointer.
pub const FREE_NEXT_PAGE: usize = LONG_NEXT_PAGE;

/// Value kind prefix on data pages.
pub const VALUE_INLINE: u8 = 0x00;
pub const VALUE_LONG: u8 = 0x01;
/// kind + length:u32 + head page:u64.
pub const LONG_POINTER_LEN: usize = 13;

/// Minimum post-split fill, as a fraction of the moved byte total.
const MIN_SPLIT_FILL_NUM: usize = 1;
const MIN_SPLIT_FILL_DEN: usize = 3;

/// Page address 0 doubles as "no page": page 0 of every volume is the
/// head page and never participates in a tree.
pub const NO_PAGE: PageAddr = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Data = 1,
    Index = 2,
    LongRecord = 3,
    Garbage = 4,
    Head = 5,
}

impl PageType {
    pub fn from_u8(v: u8) -> Result<PageType> {
        Ok(match v {
            1 => PageType::Data,
            2 => PageType::Index,
            3 => PageType::LongRecord,
            4 => PageType::Garbage,
            5 => PageType::Head,
            other => return Err(Error::PageStructure(format!("unknown page type {other}"))),
        })
    }
}

/// An owned page image. Lives inside a buffer-pool slot; all B-tree node
/// surgery happens through these methods.
#[derive(Clone)]
pub struct Page {
    buf: Vec<u8>,
}

impl Page {
    pub fn new(page_size: usize, kind: PageType, ts: Ts) -> Page {
        debug_assert!(page_size.is_power_of_two() && page_size >= 1024);
        let mut page = Page { buf: vec![0u8; page_size] };
        page.init(kind, ts);
        page
    }

    pub fn from_bytes(buf: Vec<u8>) -> Page {
        Page { buf }
    }

    /// Reset to an empty page of the given kind, keeping the buffer.
    /// The generation survives (and advances) so a reused page never
    /// matches a cursor's stale cached generation.
    pub fn init(&mut self, kind: PageType, ts: Ts) {
        let size = self.buf.len();
        let generation = self.generation().wrapping_add(1);
        self.buf.fill(0);
        self.buf[PAGE_TYPE] = kind as u8;
        wire::put_u32(&mut self.buf[PAGE_TAIL_OFFSET..], size as u32);
        wire::put_u64(&mut self.buf[PAGE_GENERATION..], generation);
        wire::put_u64(&mut self.buf[PAGE_TIMESTAMP..], ts);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn page_type(&self) -> Result<PageType> {
        PageType::from_u8(self.buf[PAGE_TYPE])
    }

    pub fn key_count(&self) -> usize {
        wire::get_u16(&self.buf[PAGE_KEY_COUNT..]) as usize
    }

    fn set_key_count(&mut self, n: usize) {
        wire::put_u16(&mut self.buf[PAGE_KEY_COUNT..], n as u16);
    }

    pub fn tail_offset(&self) -> usize {
        wire::get_u32(&self.buf[PAGE_TAIL_OFFSET..]) as usize
    }

    fn set_tail_offset(&mut self, off: usize) {
        wire::put_u32(&mut self.buf[PAGE_TAIL_OFFSET..], off as u32);
    }

    pub fn right_sibling(&self) -> PageAddr {
        wire::get_u64(&self.buf[PAGE_RIGHT_SIBLING..])
    }

    pub fn set_right_sibling(&mut self, page: PageAddr) {
        wire::put_u64(&mut self.buf[PAGE_RIGHT_SIBLING..], page);
    }

    pub fn generation(&self) -> u64 {
        wire::get_u64(&self.buf[PAGE_GENERATION..])
    }

    /// Bumped on every mutation under the slot's write lock; cursors use
    /// it to detect a stale cached path.
    pub fn bump_generation(&mut self) {
        let g = self.generation().wrapping_add(1);
        wire::put_u64(&mut self.buf[PAGE_GENERATION..], g);
    }

    pub fn timestamp(&self) -> Ts {
        wire::get_u64(&self.buf[PAGE_TIMESTAMP..])
    }

    pub fn set_timestamp(&mut self, ts: Ts) {
        wire::put_u64(&mut self.buf[PAGE_TIMESTAMP..], ts);
    }

    // -------- key block plumbing --------

    fn kb_off(i: usize) -> usize {
        PAGE_HEADER_SIZE + i * KEY_BLOCK_SIZE
    }

    fn kb_ebc(&self, i: usize) -> usize {
        wire::get_u16(&self.buf[Self::kb_off(i)..]) as usize
    }

    fn kb_klen(&self, i: usize) -> usize {
        wire::get_u16(&self.buf[Self::kb_off(i) + 2..]) as usize
    }

    fn kb_tail(&self, i: usize) -> usize {
        wire::get_u32(&self.buf[Self::kb_off(i) + 4..]) as usize
    }

    fn write_kb(&mut self, i: usize, ebc: usize, klen: usize, tail: usize) {
        let off = Self::kb_off(i);
        wire::put_u16(&mut self.buf[off..], ebc as u16);
        wire::put_u16(&mut self.buf[off + 2..], klen as u16);
        wire::put_u32(&mut self.buf[off + 4..], tail as u32);
    }

    fn vlen_at(&self, i: usize) -> usize {
        wire::get_u16(&self.buf[self.kb_tail(i)..]) as usize
    }

    fn suffix_at(&self, i: usize) -> &[u8] {
        let tail = self.kb_tail(i);
        &self.buf[tail + 2..tail + 2 + self.kb_klen(i)]
    }

    /// Raw value bytes of entry `i` (including the kind prefix on data
    /// pages, the child address on index pages).
    pub fn value_at(&self, i: usize) -> &[u8] {
        let tail = self.kb_tail(i);
        let start = tail + 2 + self.kb_klen(i);
        &self.buf[start..start + self.vlen_at(i)]
    }

    /// Child page address of entry `i` on an index page.
    pub fn child_at(&self, i: usize) -> PageAddr {
        wire::get_u64(self.value_at(i))
    }

    fn entry_len(&self, i: usize) -> usize {
        2 + self.kb_klen(i) + self.vlen_at(i)
    }

    /// Extend `key` from its shared prefix with entry `i`'s suffix so it
    /// holds the full reconstructed key of entry `i`. Only valid when
    /// `key` currently holds entry `i - 1`'s key (or anything for entry
    /// 0).
    fn apply_key(&self, i: usize, key: &mut Vec<u8>) {
        let ebc = self.kb_ebc(i);
        key.truncate(ebc);
        key.extend_from_slice(self.suffix_at(i));
    }

    /// Fully reconstructed key of entry `i`. O(i) scan, since elision
    /// chains from entry 0.
    pub fn key_at(&self, i: usize) -> Vec<u8> {
        let mut key = Vec::new();
        for j in 0..=i {
            self.apply_key(j, &mut key);
        }
        key
    }

    /// All (key, value) pairs, reconstructed. The rebuild/split/merge
    /// paths work on this flat form.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::with_capacity(self.key_count());
        let mut key = Vec::new();
        for i in 0..self.key_count() {
            self.apply_key(i, &mut key);
            out.push((key.clone(), self.value_at(i).to_vec()));
        }
        out
    }

    // -------- space accounting --------

    pub fn free_space(&self) -> usize {
        self.tail_offset() - (PAGE_HEADER_SIZE + self.key_count() * KEY_BLOCK_SIZE)
    }

    /// Tail bytes no longer referenced by any key block (left behind by
    /// in-place value shrinks and successor re-encodes).
    fn garbage(&self) -> usize {
        let live: usize = (0..self.key_count()).map(|i| self.entry_len(i)).sum();
        (self.size() - self.tail_offset()) - live
    }

    /// Rewrite the page from its flat entry list, recomputing maximal
    /// elision and squeezing out tail garbage.
    fn rebuild(&mut self, entries: &[(Vec<u8>, Vec<u8>)]) {
        let kind = self.buf[PAGE_TYPE];
        let sibling = self.right_sibling();
        let generation = self.generation();
        let ts = self.timestamp();

        let size = self.buf.len();
        let mut fresh = vec![0u8; size];
        fresh[PAGE_TYPE] = kind;
        let mut tail = size;
        let mut prev: &[u8] = &[];
        for (i, (key, value)) in entries.iter().enumerate() {
            let ebc = if i == 0 { 0 } else { lcp(prev, key) };
            let suffix = &key[ebc..];
            tail -= 2 + suffix.len() + value.len();
            wire::put_u16(&mut fresh[tail..], value.len() as u16);
            fresh[tail + 2..tail + 2 + suffix.len()].copy_from_slice(suffix);
            fresh[tail + 2 + suffix.len()..tail + 2 + suffix.len() + value.len()]
                .copy_from_slice(value);
            let off = Self::kb_off(i);
            wire::put_u16(&mut fresh[off..], ebc as u16);
            wire::put_u16(&mut fresh[off + 2..], suffix.len() as u16);
            wire::put_u32(&mut fresh[off + 4..], tail as u32);
            prev = key;
        }
        self.buf = fresh;
        self.set_key_count(entries.len());
        self.set_tail_offset(tail);
        self.set_right_sibling(sibling);
        wire::put_u64(&mut self.buf[PAGE_GENERATION..], generation);
        self.set_timestamp(ts);
    }

    // -------- search --------

    /// Position `key` within the page: `(i, true)` when entry `i` equals
    /// `key`, else `(i, false)` where `i` is the count of entries below
    /// `key` (the insertion point).
    pub fn find(&self, key: &[u8]) -> (usize, bool) {
        let mut cur = Vec::new();
        for i in 0..self.key_count() {
            self.apply_key(i, &mut cur);
            match cur.as_slice().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return (i, true),
                std::cmp::Ordering::Greater => return (i, false),
            }
        }
        (self.key_count(), false)
    }

    /// Index-page descent: the entry whose subtree covers `key`, i.e.
    /// the last entry with entry-key ≤ `key`. Entry 0 is the empty-key
    /// leftmost edge, so the result is always defined.
    pub fn find_child(&self, key: &[u8]) -> Result<usize> {
        if self.key_count() == 0 {
            return Err(Error::PageStructure("empty index page".into()));
        }
        let (i, exact) = self.find(key);
        if !exact && i == 0 {
            // entry 0 must be the empty-key leftmost edge.
            return Err(Error::PageStructure("key below leftmost edge".into()));
        }
        Ok(if exact { i } else { i - 1 })
    }

    // -------- mutation --------

    /// Insert (or overwrite) `key` → `value`. Returns false when the
    /// page lacks space even after a repack; the caller splits.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let (idx, exact) = self.find(key);
        if exact {
            return self.replace_value(idx, value);
        }

        let ebc = if idx == 0 { 0 } else { lcp(&self.key_at(idx - 1), key) };
        let suffix_len = key.len() - ebc;
        let need = KEY_BLOCK_SIZE + 2 + suffix_len + value.len();

        if self.free_space() < need {
            if self.free_space() + self.garbage() < need {
                return Ok(false);
            }
            let entries = self.entries();
            self.rebuild(&entries);
        }
        // A repack can only improve elision, so recompute against the
        // (unchanged) predecessor key is unnecessary.

        let tail = self.tail_offset() - (2 + suffix_len + value.len());
        wire::put_u16(&mut self.buf[tail..], value.len() as u16);
        self.buf[tail + 2..tail + 2 + suffix_len].copy_from_slice(&key[ebc..]);
        self.buf[tail + 2 + suffix_len..tail + 2 + suffix_len + value.len()].copy_from_slice(value);

        // Shift the key block array open at idx. The successor's stored
        // elision stays valid: any key between two others shares their
        // common prefix.
        let count = self.key_count();
        self.buf.copy_within(
            Self::kb_off(idx)..Self::kb_off(count),
            Self::kb_off(idx + 1),
        );
        self.write_kb(idx, ebc, suffix_len, tail);
        self.set_key_count(count + 1);
        self.set_tail_offset(tail);
        Ok(true)
    }

    /// Overwrite entry `idx`'s value. Shrinks in place; growth goes
    /// through a rebuild and reports false when the page cannot hold it
    /// (the caller splits and retries).
    fn replace_value(&mut self, idx: usize, value: &[u8]) -> Result<bool> {
        let old_len = self.vlen_at(idx);
        if value.len() <= old_len {
            let tail = self.kb_tail(idx);
            let start = tail + 2 + self.kb_klen(idx);
            self.buf[start..start + value.len()].copy_from_slice(value);
            wire::put_u16(&mut self.buf[tail..], value.len() as u16);
            return Ok(true);
        }
        let grow = value.len() - old_len;
        if self.free_space() + self.garbage() < grow {
            return Ok(false);
        }
        let mut entries = self.entries();
        entries[idx].1 = value.to_vec();
        self.rebuild(&entries);
        Ok(true)
    }

    /// True when `insert` of this entry would succeed, ignoring elision
    /// (worst-case full key).
    pub fn fits(&self, key_len: usize, value_len: usize) -> bool {
        self.free_space() + self.garbage() >= KEY_BLOCK_SIZE + 2 + key_len + value_len
    }

    /// Remove entry `idx`. Rebuilds the page: removal can lengthen the
    /// successor's stored suffix, and the rebuild handles that along
    /// with tail compaction in one pass.
    pub fn remove_at(&mut self, idx: usize) -> Result<()> {
        let count = self.key_count();
        if idx >= count {
            return Err(Error::PageStructure(format!(
                "remove index {idx} past count {count}"
            )));
        }
        let mut entries = self.entries();
        entries.remove(idx);
        self.rebuild(&entries);
        Ok(())
    }

    /// Split this page, moving the upper portion into `right` (a fresh
    /// page of the same kind). Returns the pivot key to insert into the
    /// parent. The split point minimizes the byte imbalance subject to a
    /// minimum fill on both sides.
    pub fn split_into(&mut self, right: &mut Page) -> Result<Vec<u8>> {
        let kind = self.page_type()?;
        let entries = self.entries();
        if entries.len() < 2 {
            return Err(Error::PageStructure("split of a page with < 2 entries".into()));
        }

        let sizes: Vec<usize> = entries
            .iter()
            .map(|(k, v)| KEY_BLOCK_SIZE + 2 + k.len() + v.len())
            .collect();
        let total: usize = sizes.iter().sum();
        let floor = total * MIN_SPLIT_FILL_NUM / MIN_SPLIT_FILL_DEN;

        let mut split = entries.len() / 2;
        let mut best_dev = usize::MAX;
        let mut left_bytes = 0usize;
        for s in 1..entries.len() {
            left_bytes += sizes[s - 1];
            let right_bytes = total - left_bytes;
            if left_bytes < floor || right_bytes < floor {
                continue;
            }
            let dev = left_bytes.abs_diff(right_bytes);
            if dev < best_dev {
                best_dev = dev;
                split = s;
            }
        }

        let pivot = entries[split].0.clone();
        right.init(kind, self.timestamp());
        match kind {
            PageType::Data => {
                // Leaf: the pivot entry stays in the right page.
                right.rebuild(&entries[split..]);
            }
            PageType::Index => {
                // Internal: the pivot key moves up; its child becomes the
                // right page's leftmost edge.
                let mut moved = Vec::with_capacity(entries.len() - split);
                moved.push((Vec::new(), entries[split].1.clone()));
                moved.extend_from_slice(&entries[split + 1..]);
                right.rebuild(&moved);
            }
            other => {
                return Err(Error::PageStructure(format!("split of {other:?} page")));
            }
        }
        self.rebuild(&entries[..split]);

        right.set_right_sibling(self.right_sibling());
        Ok(pivot)
    }

    /// Whether this page and `right` would fit in one page if merged.
    pub fn can_absorb(&self, right: &Page) -> bool {
        let usable = self.size() - PAGE_HEADER_SIZE;
        self.free_space() + self.garbage() + right.free_space() + right.garbage() >= usable
    }

    /// Pull every entry of the right sibling into this page. For index
    /// pages the sibling's leftmost edge is re-keyed with `pivot`, the
    /// parent key that used to separate the two pages.
    pub fn absorb(&mut self, right: &Page, pivot: Option<&[u8]>) -> Result<()> {
        let mut entries = self.entries();
        let mut incoming = right.entries();
        if let Some(pivot) = pivot {
            if let Some(first) = incoming.first_mut() {
                first.0 = pivot.to_vec();
            }
        }
        entries.extend(incoming);
        self.rebuild(&entries);
        self.set_right_sibling(right.right_sibling());
        Ok(())
    }

    // -------- long-record pages --------

    pub fn long_chunk_capacity(page_size: usize) -> usize {
        page_size - LONG_CHUNK_START
    }

    pub fn init_long(&mut self, ts: Ts, chunk: &[u8], next: PageAddr) {
        self.init(PageType::LongRecord, ts);
        wire::put_u64(&mut self.buf[LONG_NEXT_PAGE..], next);
        wire::put_u32(&mut self.buf[LONG_CHUNK_LEN..], chunk.len() as u32);
        self.buf[LONG_CHUNK_START..LONG_CHUNK_START + chunk.len()].copy_from_slice(chunk);
    }

    pub fn long_next(&self) -> PageAddr {
        wire::get_u64(&self.buf[LONG_NEXT_PAGE..])
    }

    pub fn long_chunk(&self) -> Result<&[u8]> {
        let len = wire::get_u32(&self.buf[LONG_CHUNK_LEN..]) as usize;
        if LONG_CHUNK_START + len > self.buf.len() {
            return Err(Error::PageStructure("long-record chunk length".into()));
        }
        Ok(&self.buf[LONG_CHUNK_START..LONG_CHUNK_START + len])
    }

    // -------- free-list pages --------

    pub fn init_garbage(&mut self, ts: Ts, next_free: PageAddr) {
        self.init(PageType::Garbage, ts);
        wire::put_u64(&mut self.buf[FREE_NEXT_PAGE..], next_free);
    }

    pub fn free_next(&self) -> PageAddr {
        wire::get_u64(&self.buf[FREE_NEXT_PAGE..])
    }

    // -------- consistency --------

    /// Check the free-space accounting and the strict ascending order of
    /// reconstructed keys.
    pub fn verify(&self) -> Result<()> {
        let kind = self.page_type()?;
        if !matches!(kind, PageType::Data | PageType::Index) {
            return Ok(());
        }
        let count = self.key_count();
        let kb_end = PAGE_HEADER_SIZE + count * KEY_BLOCK_SIZE;
        let tail = self.tail_offset();
        if kb_end > tail || tail > self.size() {
            return Err(Error::PageStructure(format!(
                "key blocks end {kb_end}, tail {tail}, size {}",
                self.size()
            )));
        }
        let mut prev: Option<Vec<u8>> = None;
        let mut cur = Vec::new();
        for i in 0..count {
            let t = self.kb_tail(i);
            if t < tail || t + self.entry_len(i) > self.size() {
                return Err(Error::PageStructure(format!("entry {i} tail {t} out of range")));
            }
            if i == 0 && self.kb_ebc(0) != 0 {
                return Err(Error::PageStructure("entry 0 with nonzero elision".into()));
            }
            self.apply_key(i, &mut cur);
            if let Some(ref p) = prev {
                if p.as_slice() >= cur.as_slice() {
                    return Err(Error::PageStructure(format!("keys out of order at entry {i}")));
                }
            }
            prev = Some(cur.clone());
        }
        Ok(())
    }
}

impl Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Page {{ type: {:?}, keys: {}, free: {}, right: {}, gen: {}, ts: {} }}",
            self.page_type().ok(),
            self.key_count(),
            self.free_space(),
            self.right_sibling(),
            self.generation(),
            self.timestamp(),
        )
    }
}

/// Length of the longest common prefix of two byte strings.
pub fn lcp(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod test {
    use super::{lcp, Page, PageType};

    const SIZE: usize = 4096;

    fn page() -> Page {
        Page::new(SIZE, PageType::Data, 1)
    }

    #[test]
    fn test_lcp() {
        assert_eq!(lcp(b"abc", b"abd"), 2);
        assert_eq!(lcp(b"", b"abd"), 0);
        assert_eq!(lcp(b"ab", b"ab"), 2);
    }

    #[test]
    fn test_insert_find_ordered() {
        let mut p = page();
        for i in [5u8, 1, 9, 3, 7] {
            assert!(p.insert(&[b'k', i], &[i]).unwrap());
        }
        p.verify().unwrap();
        assert_eq!(p.key_count(), 5);
        let entries = p.entries();
        let keys: Vec<_> = entries.iter().map(|(k, _)| k[1]).collect();
        assert_eq!(keys, vec![1, 3, 5, 7, 9]);

        let (i, exact) = p.find(&[b'k', 7]);
        assert!(exact);
        assert_eq!(p.value_at(i), &[7]);
        let (i, exact) = p.find(&[b'k', 6]);
        assert!(!exact);
        assert_eq!(i, 3);
    }

    #[test]
    fn test_elision_round_trip() {
        let mut p = page();
        let keys = [&b"prefix/alpha"[..], b"prefix/beta", b"prefix/betamax", b"zeta"];
        for k in keys {
            assert!(p.insert(k, b"v").unwrap());
        }
        p.verify().unwrap();
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(p.key_at(i), k.to_vec());
        }
        // middle entries actually elide their shared prefix.
        assert!(p.kb_ebc(1) > 0);
    }

    #[test]
    fn test_overwrite_value() {
        let mut p = page();
        p.insert(b"k", b"short").unwrap();
        p.insert(b"k", b"x").unwrap();
        let (i, exact) = p.find(b"k");
        assert!(exact);
        assert_eq!(p.value_at(i), b"x");
        p.insert(b"k", b"now considerably longer").unwrap();
        let (i, _) = p.find(b"k");
        assert_eq!(p.value_at(i), b"now considerably longer");
        p.verify().unwrap();
    }

    #[test]
    fn test_remove_reencodes_successor() {
        let mut p = page();
        p.insert(b"aa", b"1").unwrap();
        p.insert(b"aab", b"2").unwrap();
        p.insert(b"aac", b"3").unwrap();
        let (i, exact) = p.find(b"aab");
        assert!(exact);
        p.remove_at(i).unwrap();
        p.verify().unwrap();
        assert_eq!(p.key_at(0), b"aa".to_vec());
        assert_eq!(p.key_at(1), b"aac".to_vec());
    }

    #[test]
    fn test_fill_then_split() {
        let mut p = page();
        let mut i = 0u32;
        loop {
            let key = format!("key{i:06}");
            if !p.insert(key.as_bytes(), &[0u8; 24]).unwrap() {
                break;
            }
            i += 1;
        }
        assert!(i > 50);
        let before = p.entries();

        let mut right = Page::new(SIZE, PageType::Data, 1);
        let pivot = p.split_into(&mut right).unwrap();
        p.verify().unwrap();
        right.verify().unwrap();
        assert_eq!(right.key_at(0), pivot);
        assert!(p.entries().last().unwrap().0 < pivot);

        let mut after = p.entries();
        after.extend(right.entries());
        assert_eq!(before, after);
    }

    #[test]
    fn test_index_split_moves_pivot_up() {
        let mut p = Page::new(SIZE, PageType::Index, 1);
        p.insert(b"", &10u64.to_be_bytes()).unwrap();
        for i in 1u64..100 {
            let key = format!("idx{i:04}");
            p.insert(key.as_bytes(), &(10 + i).to_be_bytes()).unwrap();
        }
        let count = p.key_count();
        let mut right = Page::new(SIZE, PageType::Index, 1);
        let pivot = p.split_into(&mut right).unwrap();
        // the pivot key is on neither side; its child became the right
        // page's leftmost edge.
        assert_eq!(right.key_at(0), Vec::<u8>::new());
        assert_eq!(p.key_count() + right.key_count(), count);
        let (_, exact) = right.find(&pivot);
        assert!(!exact);
    }

    #[test]
    fn test_find_child_leftmost_edge() {
        let mut p = Page::new(SIZE, PageType::Index, 1);
        p.insert(b"", &1u64.to_be_bytes()).unwrap();
        p.insert(b"m", &2u64.to_be_bytes()).unwrap();
        assert_eq!(p.child_at(p.find_child(b"a").unwrap()), 1);
        assert_eq!(p.child_at(p.find_child(b"m").unwrap()), 2);
        assert_eq!(p.child_at(p.find_child(b"z").unwrap()), 2);
    }

    #[test]
    fn test_absorb() {
        let mut left = page();
        let mut right = page();
        left.insert(b"a", b"1").unwrap();
        left.insert(b"b", b"2").unwrap();
        right.insert(b"c", b"3").unwrap();
        right.set_right_sibling(77);
        assert!(left.can_absorb(&right));
        left.absorb(&right, None).unwrap();
        left.verify().unwrap();
        assert_eq!(left.key_count(), 3);
        assert_eq!(left.right_sibling(), 77);
    }

    #[test]
    fn test_long_record_page() {
        let mut p = Page::new(SIZE, PageType::LongRecord, 3);
        let chunk = vec![0xabu8; 100];
        p.init_long(3, &chunk, 42);
        assert_eq!(p.long_next(), 42);
        assert_eq!(p.long_chunk().unwrap(), chunk.as_slice());
    }

    #[test]
    fn test_verify_rejects_disorder() {
        let mut p = page();
        p.insert(b"a", b"1").unwrap();
        p.insert(b"b", b"2").unwrap();
        // corrupt entry 1's suffix to sort below entry 0.
        let tail = p.kb_tail(1);
        p.bytes_mut()[tail + 2] = b'A';
        assert!(p.verify().is_err());
    }
}
