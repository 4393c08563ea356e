//! Order-preserving key codec.
//!
//! A key is a sequence of typed segments. Each segment is encoded as
//! `tag | escaped payload | 0x00`, chosen so that unsigned byte-wise
//! comparison of two encoded keys matches the semantic ordering of their
//! segment sequences. 0x00 and 0x01 are reserved framing bytes; payload
//! occurrences are escaped as (0x01, 0x20) and (0x01, 0x21). The escape
//! map is monotone, so escaping never perturbs the ordering.

use std::cmp::Ordering;
use std::fmt::{self, Debug, Display};

use crate::error::{Error, Result};
use crate::Ts;

/// Segment separator. A key never contains a raw 0x00 except as the
/// terminator written after each segment.
pub const SEPARATOR: u8 = 0x00;
/// Escape introducer.
pub const ESCAPE: u8 = 0x01;
const ESCAPED_00: u8 = 0x20;
const ESCAPED_01: u8 = 0x21;

/// The single byte of the AFTER sentinel. Greater than every tag, so the
/// sentinel lex-orders after all valid keys.
pub const AFTER_BYTE: u8 = 0xff;

/// Segment type tags. Ascending tag value defines cross-type ordering.
pub const TAG_BOOL: u8 = 0x14;
pub const TAG_I8: u8 = 0x20;
pub const TAG_I16: u8 = 0x21;
pub const TAG_I32: u8 = 0x22;
pub const TAG_I64: u8 = 0x23;
pub const TAG_TIMESTAMP: u8 = 0x28;
pub const TAG_F32: u8 = 0x30;
pub const TAG_F64: u8 = 0x31;
pub const TAG_STRING: u8 = 0x40;
pub const TAG_BYTES: u8 = 0x50;

/// Hard bound on the encoded key length. Inserts verify the combined
/// key+value entry also fits a split page; this bound merely keeps the
/// in-memory buffers and journal key_size fields (u16) honest.
pub const MAX_KEY_BYTES: usize = 2047;

/// Locale-specific string ordering hook. The default string encoding is
/// raw UTF-8 bytes; a collator replaces those bytes with its own
/// sort-key form.
pub trait Collator {
    fn collate(&self, s: &str) -> Vec<u8>;
}

/// Append-oriented key builder plus decode cursor.
#[derive(Clone, Default)]
pub struct Key {
    buf: Vec<u8>,
    /// Start offset of each appended segment, for `cut`.
    segments: Vec<usize>,
    /// Decode cursor, advanced by the decode_* methods.
    index: usize,
}

impl Key {
    pub fn new() -> Key {
        Key::default()
    }

    /// The BEFORE sentinel: the empty key, lex-least.
    pub fn before() -> Key {
        Key::new()
    }

    /// The AFTER sentinel: lex-greater than every valid key.
    pub fn after() -> Key {
        let mut k = Key::new();
        k.buf.push(AFTER_BYTE);
        k
    }

    pub fn is_before(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_after(&self) -> bool {
        self.buf.first() == Some(&AFTER_BYTE)
    }

    pub fn encoded(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Reset to the BEFORE sentinel.
    pub fn clear(&mut self) -> &mut Key {
        self.buf.clear();
        self.segments.clear();
        self.index = 0;
        self
    }

    /// Drop the last appended segment. `k.cut().append_i32(x)?` replaces
    /// the last segment in place, the idiom for iterative range probes.
    pub fn cut(&mut self) -> &mut Key {
        if let Some(start) = self.segments.pop() {
            self.buf.truncate(start);
            self.index = self.index.min(self.buf.len());
        }
        self
    }

    /// Keep only the first `n` segments (shallow-traversal truncation).
    pub fn truncate_to_segments(&mut self, n: usize) -> &mut Key {
        while self.segments.len() > n {
            self.cut();
        }
        self
    }

    /// Adopt raw encoded bytes (as stored in a page or journal record).
    pub fn set_encoded(&mut self, bytes: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(bytes);
        self.rebuild_segments();
        self.index = 0;
    }

    pub fn from_encoded(bytes: &[u8]) -> Key {
        let mut k = Key::new();
        k.set_encoded(bytes);
        k
    }

    fn rebuild_segments(&mut self) {
        self.segments.clear();
        if self.is_after() {
            return;
        }
        let mut pos = 0;
        while pos < self.buf.len() {
            self.segments.push(pos);
            // tag byte, then scan for the unescaped separator.
            pos += 1;
            while pos < self.buf.len() && self.buf[pos] != SEPARATOR {
                pos += if self.buf[pos] == ESCAPE { 2 } else { 1 };
            }
            pos += 1; // past the separator
        }
    }

    // -------- append --------

    fn begin_segment(&mut self, tag: u8) -> Result<usize> {
        if self.is_after() {
            return Err(Error::InvalidKey("append to AFTER sentinel"));
        }
        let start = self.buf.len();
        self.buf.push(tag);
        Ok(start)
    }

    fn end_segment(&mut self, start: usize) -> Result<&mut Key> {
        self.buf.push(SEPARATOR);
        if self.buf.len() > MAX_KEY_BYTES {
            let len = self.buf.len();
            self.buf.truncate(start);
            return Err(Error::KeyTooLong(len));
        }
        self.segments.push(start);
        Ok(self)
    }

    fn push_escaped(&mut self, payload: &[u8]) {
        for &b in payload {
            match b {
                SEPARATOR => {
                    self.buf.push(ESCAPE);
                    self.buf.push(ESCAPED_00);
                }
                ESCAPE => {
                    self.buf.push(ESCAPE);
                    self.buf.push(ESCAPED_01);
                }
                _ => self.buf.push(b),
            }
        }
    }

    pub fn append_bool(&mut self, v: bool) -> Result<&mut Key> {
        let start = self.begin_segment(TAG_BOOL)?;
        self.buf.push(if v { 0x03 } else { 0x02 });
        self.end_segment(start)
    }

    pub fn append_i8(&mut self, v: i8) -> Result<&mut Key> {
        let start = self.begin_segment(TAG_I8)?;
        self.push_escaped(&[(v as u8) ^ 0x80]);
        self.end_segment(start)
    }

    pub fn append_i16(&mut self, v: i16) -> Result<&mut Key> {
        let start = self.begin_segment(TAG_I16)?;
        self.push_escaped(&((v as u16) ^ 0x8000).to_be_bytes());
        self.end_segment(start)
    }

    pub fn append_i32(&mut self, v: i32) -> Result<&mut Key> {
        let start = self.begin_segment(TAG_I32)?;
        self.push_escaped(&((v as u32) ^ 0x8000_0000).to_be_bytes());
        self.end_segment(start)
    }

    pub fn append_i64(&mut self, v: i64) -> Result<&mut Key> {
        let start = self.begin_segment(TAG_I64)?;
        self.push_escaped(&((v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
        self.end_segment(start)
    }

    pub fn append_timestamp(&mut self, v: Ts) -> Result<&mut Key> {
        let start = self.begin_segment(TAG_TIMESTAMP)?;
        self.push_escaped(&v.to_be_bytes());
        self.end_segment(start)
    }

    pub fn append_f32(&mut self, v: f32) -> Result<&mut Key> {
        let start = self.begin_segment(TAG_F32)?;
        let bits = v.to_bits();
        let ordered = if bits & 0x8000_0000 != 0 { !bits } else { bits | 0x8000_0000 };
        self.push_escaped(&ordered.to_be_bytes());
        self.end_segment(start)
    }

    pub fn append_f64(&mut self, v: f64) -> Result<&mut Key> {
        let start = self.begin_segment(TAG_F64)?;
        let bits = v.to_bits();
        let ordered = if bits & 0x8000_0000_0000_0000 != 0 {
            !bits
        } else {
            bits | 0x8000_0000_0000_0000
        };
        self.push_escaped(&ordered.to_be_bytes());
        self.end_segment(start)
    }

    pub fn append_str(&mut self, v: &str) -> Result<&mut Key> {
        let start = self.begin_segment(TAG_STRING)?;
        self.push_escaped(v.as_bytes());
        self.end_segment(start)
    }

    /// String segment under a pluggable collation. Decoding a collated
    /// segment yields the sort-key bytes, not the original string.
    pub fn append_str_collated(&mut self, v: &str, collator: &dyn Collator) -> Result<&mut Key> {
        let start = self.begin_segment(TAG_STRING)?;
        let collated = collator.collate(v);
        self.push_escaped(&collated);
        self.end_segment(start)
    }

    pub fn append_bytes(&mut self, v: &[u8]) -> Result<&mut Key> {
        let start = self.begin_segment(TAG_BYTES)?;
        self.push_escaped(v);
        self.end_segment(start)
    }

    // -------- decode --------

    /// Rewind the decode cursor to the first segment.
    pub fn reset_index(&mut self) -> &mut Key {
        self.index = 0;
        self
    }

    fn next_segment(&mut self, want_tag: u8) -> Result<Vec<u8>> {
        if self.index >= self.buf.len() {
            return Err(Error::InvalidKey("decode past end of key"));
        }
        let tag = self.buf[self.index];
        if tag != want_tag {
            return Err(Error::Conversion(format!(
                "segment tag {tag:#04x}, expected {want_tag:#04x}"
            )));
        }
        let mut pos = self.index + 1;
        let mut payload = Vec::new();
        while pos < self.buf.len() && self.buf[pos] != SEPARATOR {
            if self.buf[pos] == ESCAPE {
                let esc = *self
                    .buf
                    .get(pos + 1)
                    .ok_or(Error::InvalidKey("dangling escape"))?;
                payload.push(match esc {
                    ESCAPED_00 => SEPARATOR,
                    ESCAPED_01 => ESCAPE,
                    _ => return Err(Error::InvalidKey("bad escape byte")),
                });
                pos += 2;
            } else {
                payload.push(self.buf[pos]);
                pos += 1;
            }
        }
        if pos >= self.buf.len() {
            return Err(Error::InvalidKey("unterminated segment"));
        }
        self.index = pos + 1;
        Ok(payload)
    }

    fn fixed<const N: usize>(payload: Vec<u8>) -> Result<[u8; N]> {
        payload
            .try_into()
            .map_err(|_| Error::InvalidKey("segment payload length"))
    }

    pub fn decode_bool(&mut self) -> Result<bool> {
        let payload = self.next_segment(TAG_BOOL)?;
        match payload.as_slice() {
            [0x02] => Ok(false),
            [0x03] => Ok(true),
            _ => Err(Error::InvalidKey("boolean payload")),
        }
    }

    pub fn decode_i8(&mut self) -> Result<i8> {
        let payload = Self::fixed::<1>(self.next_segment(TAG_I8)?)?;
        Ok((payload[0] ^ 0x80) as i8)
    }

    pub fn decode_i16(&mut self) -> Result<i16> {
        let payload = Self::fixed::<2>(self.next_segment(TAG_I16)?)?;
        Ok((u16::from_be_bytes(payload) ^ 0x8000) as i16)
    }

    pub fn decode_i32(&mut self) -> Result<i32> {
        let payload = Self::fixed::<4>(self.next_segment(TAG_I32)?)?;
        Ok((u32::from_be_bytes(payload) ^ 0x8000_0000) as i32)
    }

    pub fn decode_i64(&mut self) -> Result<i64> {
        let payload = Self::fixed::<8>(self.next_segment(TAG_I64)?)?;
        Ok((u64::from_be_bytes(payload) ^ 0x8000_0000_0000_0000) as i64)
    }

    pub fn decode_timestamp(&mut self) -> Result<Ts> {
        let payload = Self::fixed::<8>(self.next_segment(TAG_TIMESTAMP)?)?;
        Ok(u64::from_be_bytes(payload))
    }

    pub fn decode_f32(&mut self) -> Result<f32> {
        let payload = Self::fixed::<4>(self.next_segment(TAG_F32)?)?;
        let ordered = u32::from_be_bytes(payload);
        let bits = if ordered & 0x8000_0000 != 0 { ordered & !0x8000_0000 } else { !ordered };
        Ok(f32::from_bits(bits))
    }

    pub fn decode_f64(&mut self) -> Result<f64> {
        let payload = Self::fixed::<8>(self.next_segment(TAG_F64)?)?;
        let ordered = u64::from_be_bytes(payload);
        let bits = if ordered & 0x8000_0000_0000_0000 != 0 {
            ordered & !0x8000_0000_0000_0000
        } else {
            !ordered
        };
        Ok(f64::from_bits(bits))
    }

    pub fn decode_str(&mut self) -> Result<String> {
        let payload = self.next_segment(TAG_STRING)?;
        String::from_utf8(payload).map_err(|e| Error::Conversion(e.to_string()))
    }

    pub fn decode_bytes(&mut self) -> Result<Vec<u8>> {
        self.next_segment(TAG_BYTES)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Key) -> bool {
        self.buf == other.buf
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Key) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Key) -> Ordering {
        self.buf.cmp(&other.buf)
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:02x?})", self.buf)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_before() {
            return write!(f, "{{before}}");
        }
        if self.is_after() {
            return write!(f, "{{after}}");
        }
        write!(f, "{{{} segments, {} bytes}}", self.segments.len(), self.buf.len())
    }
}

#[cfg(test)]
mod test {
    use super::Key;

    fn enc_i32(v: i32) -> Vec<u8> {
        let mut k = Key::new();
        k.append_i32(v).unwrap();
        k.encoded().to_vec()
    }

    #[test]
    fn test_scalar_round_trip() {
        let mut k = Key::new();
        k.append_bool(true)
            .unwrap()
            .append_i8(-3)
            .unwrap()
            .append_i16(1234)
            .unwrap()
            .append_i32(-56789)
            .unwrap()
            .append_i64(i64::MIN)
            .unwrap()
            .append_timestamp(42)
            .unwrap()
            .append_f32(-1.5)
            .unwrap()
            .append_f64(std::f64::consts::PI)
            .unwrap()
            .append_str("héllo")
            .unwrap()
            .append_bytes(&[0, 1, 2, 0xff])
            .unwrap();

        k.reset_index();
        assert!(k.decode_bool().unwrap());
        assert_eq!(k.decode_i8().unwrap(), -3);
        assert_eq!(k.decode_i16().unwrap(), 1234);
        assert_eq!(k.decode_i32().unwrap(), -56789);
        assert_eq!(k.decode_i64().unwrap(), i64::MIN);
        assert_eq!(k.decode_timestamp().unwrap(), 42);
        assert_eq!(k.decode_f32().unwrap(), -1.5);
        assert_eq!(k.decode_f64().unwrap(), std::f64::consts::PI);
        assert_eq!(k.decode_str().unwrap(), "héllo");
        assert_eq!(k.decode_bytes().unwrap(), vec![0, 1, 2, 0xff]);
    }

    #[test]
    fn test_int_ordering() {
        let samples = [i32::MIN, -100, -1, 0, 1, 7, 100, i32::MAX];
        for w in samples.windows(2) {
            assert!(enc_i32(w[0]) < enc_i32(w[1]), "{} !< {}", w[0], w[1]);
        }
    }

    #[test]
    fn test_float_ordering() {
        let samples = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1e-9, 3.25, f64::INFINITY];
        let enc: Vec<_> = samples
            .iter()
            .map(|v| {
                let mut k = Key::new();
                k.append_f64(*v).unwrap();
                k.encoded().to_vec()
            })
            .collect();
        for w in enc.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn test_prefix_orders_first() {
        let mut a = Key::new();
        a.append_i32(5).unwrap();
        let mut b = a.clone();
        b.append_str("x").unwrap();
        assert!(a < b);

        // ...and the next sibling at the shallower depth sorts after both.
        let mut c = Key::new();
        c.append_i32(6).unwrap();
        assert!(b < c);
    }

    #[test]
    fn test_framing_bytes_escape() {
        let mut a = Key::new();
        a.append_bytes(&[0x00]).unwrap();
        let mut b = Key::new();
        b.append_bytes(&[0x01]).unwrap();
        let mut c = Key::new();
        c.append_bytes(&[0x02]).unwrap();
        assert!(a < b && b < c);

        a.reset_index();
        assert_eq!(a.decode_bytes().unwrap(), vec![0x00]);
    }

    #[test]
    fn test_sentinels() {
        let before = Key::before();
        let after = Key::after();
        let mid = Key::from_encoded(&enc_i32(0));
        assert!(before < mid && mid < after);
        assert!(before.is_before() && after.is_after());
    }

    #[test]
    fn test_cut_replaces_segment() {
        let mut k = Key::new();
        k.append_str("bucket").unwrap().append_i32(1).unwrap();
        let one = k.clone();
        k.cut().append_i32(2).unwrap();
        assert!(one < k);
        assert_eq!(k.segment_count(), 2);
    }

    #[test]
    fn test_decode_wrong_tag() {
        let mut k = Key::new();
        k.append_i32(9).unwrap();
        k.reset_index();
        assert!(k.decode_str().is_err());
    }

    #[test]
    fn test_key_too_long() {
        let mut k = Key::new();
        let big = vec![0x7fu8; 4000];
        assert!(matches!(
            k.append_bytes(&big),
            Err(crate::error::Error::KeyTooLong(_))
        ));
        // failed append leaves the key unchanged.
        assert_eq!(k.segment_count(), 0);
        assert!(k.is_before());
    }

    #[test]
    fn test_set_encoded_rebuilds_segments() {
        let mut k = Key::new();
        k.append_i32(3).unwrap().append_bytes(&[0, 1]).unwrap();
        let copy = Key::from_encoded(k.encoded());
        assert_eq!(copy.segment_count(), 2);
        assert_eq!(copy, k);
    }
}
