//! Tree metadata and per-tree accumulators.
//!
//! A tree's durable state (root page, depth, accumulator slots) lives in
//! its volume's head-page directory; this module owns the record layout
//! and the accumulator arithmetic. Accumulator deltas ride inside
//! transaction envelopes as D0/D1 sub-records and are folded into the
//! head-page snapshot at checkpoint time.

use crate::error::{Error, Result};
use crate::wire;
use crate::PageAddr;

pub const ACCUMULATOR_SLOTS: usize = 8;

/// Serialized size of one directory entry, excluding the name bytes.
pub const TREE_META_FIXED: usize = 2 + 8 + 4 + ACCUMULATOR_SLOTS * 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AccumulatorKind {
    Sum = 0,
    Max = 1,
    Min = 2,
    Seq = 3,
}

impl AccumulatorKind {
    pub fn from_u16(v: u16) -> Result<AccumulatorKind> {
        Ok(match v {
            0 => AccumulatorKind::Sum,
            1 => AccumulatorKind::Max,
            2 => AccumulatorKind::Min,
            3 => AccumulatorKind::Seq,
            other => {
                return Err(Error::CorruptJournal(format!("accumulator kind {other}")));
            }
        })
    }
}

/// One accumulator slot: a kind fixed at first use plus the running
/// value. Sum and Seq fold by addition (Seq exists so a sequence can be
/// minted without colliding with an application Sum); Max/Min keep the
/// extremum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accumulator {
    pub kind: Option<AccumulatorKind>,
    pub value: i64,
}

impl Accumulator {
    pub const UNSET: Accumulator = Accumulator { kind: None, value: 0 };

    pub fn apply(&mut self, kind: AccumulatorKind, delta: i64) {
        let kind = *self.kind.get_or_insert(kind);
        self.value = match kind {
            AccumulatorKind::Sum | AccumulatorKind::Seq => self.value.wrapping_add(delta),
            AccumulatorKind::Max => self.value.max(delta),
            AccumulatorKind::Min => self.value.min(delta),
        };
    }
}

/// Durable per-tree state as stored in the volume head page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMeta {
    pub name: String,
    pub root: PageAddr,
    /// Length of every root-to-leaf path. 1 = the root is a leaf.
    pub depth: u32,
    pub accumulators: [Accumulator; ACCUMULATOR_SLOTS],
}

impl TreeMeta {
    pub fn new(name: &str, root: PageAddr) -> TreeMeta {
        TreeMeta {
            name: name.to_string(),
            root,
            depth: 1,
            accumulators: [Accumulator::UNSET; ACCUMULATOR_SLOTS],
        }
    }

    pub fn encoded_len(&self) -> usize {
        TREE_META_FIXED + self.name.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut fixed = [0u8; 2];
        wire::put_u16(&mut fixed, self.name.len() as u16);
        out.extend_from_slice(&fixed);
        out.extend_from_slice(self.name.as_bytes());
        let mut buf = [0u8; 8];
        wire::put_u64(&mut buf, self.root);
        out.extend_from_slice(&buf);
        let mut d = [0u8; 4];
        wire::put_u32(&mut d, self.depth);
        out.extend_from_slice(&d);
        for acc in &self.accumulators {
            let mut kv = [0u8; 10];
            let kind = acc.kind.map(|k| k as u16).unwrap_or(u16::MAX);
            wire::put_u16(&mut kv[..2], kind);
            wire::put_i64(&mut kv[2..], acc.value);
            out.extend_from_slice(&kv);
        }
    }

    /// Decode one entry at `pos`; advances `pos` past it.
    pub fn decode_from(buf: &[u8], pos: &mut usize) -> Result<TreeMeta> {
        let need = |p: usize, n: usize| -> Result<()> {
            if p + n > buf.len() {
                Err(Error::PageStructure("head-page tree directory truncated".into()))
            } else {
                Ok(())
            }
        };
        need(*pos, 2)?;
        let name_len = wire::get_u16(&buf[*pos..]) as usize;
        *pos += 2;
        need(*pos, name_len + 8 + 4)?;
        let name = std::str::from_utf8(&buf[*pos..*pos + name_len])
            .map_err(|e| Error::Conversion(e.to_string()))?
            .to_string();
        *pos += name_len;
        let root = wire::get_u64(&buf[*pos..]);
        *pos += 8;
        let depth = wire::get_u32(&buf[*pos..]);
        *pos += 4;
        let mut accumulators = [Accumulator::UNSET; ACCUMULATOR_SLOTS];
        for acc in accumulators.iter_mut() {
            need(*pos, 10)?;
            let kind = wire::get_u16(&buf[*pos..]);
            let value = wire::get_i64(&buf[*pos + 2..]);
            *pos += 10;
            acc.kind = if kind == u16::MAX {
                None
            } else {
                Some(AccumulatorKind::from_u16(kind)?)
            };
            acc.value = value;
        }
        Ok(TreeMeta { name, root, depth, accumulators })
    }
}

#[cfg(test)]
mod test {
    use super::{Accumulator, AccumulatorKind, TreeMeta};

    #[test]
    fn test_accumulator_kinds() {
        let mut a = Accumulator::UNSET;
        a.apply(AccumulatorKind::Sum, 5);
        a.apply(AccumulatorKind::Sum, -2);
        assert_eq!(a.value, 3);

        let mut m = Accumulator::UNSET;
        m.apply(AccumulatorKind::Max, 7);
        m.apply(AccumulatorKind::Max, 3);
        assert_eq!(m.value, 7);
    }

    #[test]
    fn test_kind_sticks_at_first_use() {
        let mut a = Accumulator::UNSET;
        a.apply(AccumulatorKind::Min, -4);
        // later deltas fold with the established kind, whatever the
        // sub-record claims.
        a.apply(AccumulatorKind::Sum, -9);
        assert_eq!(a.kind, Some(AccumulatorKind::Min));
        assert_eq!(a.value, -9);
    }

    #[test]
    fn test_meta_round_trip() {
        let mut meta = TreeMeta::new("orders", 17);
        meta.depth = 3;
        meta.accumulators[2].apply(AccumulatorKind::Seq, 41);
        let mut buf = Vec::new();
        meta.encode_into(&mut buf);
        assert_eq!(buf.len(), meta.encoded_len());
        let mut pos = 0;
        let back = TreeMeta::decode_from(&buf, &mut pos).unwrap();
        assert_eq!(pos, buf.len());
        assert_eq!(back, meta);
    }
}
