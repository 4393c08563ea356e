// Functions related to on-disk field encoding.
use byteorder::{BigEndian, ByteOrder};

// All on-disk integers are big-endian: the most significant byte is at
// the lowest address, so byte-wise comparison of encoded fields matches
// numeric comparison.
type E = BigEndian;

pub fn get_u16(buf: &[u8]) -> u16 {
    E::read_u16(buf)
}

pub fn get_u32(buf: &[u8]) -> u32 {
    E::read_u32(buf)
}

pub fn get_u64(buf: &[u8]) -> u64 {
    E::read_u64(buf)
}

pub fn get_i64(buf: &[u8]) -> i64 {
    E::read_i64(buf)
}

pub fn put_u16(buf: &mut [u8], v: u16) {
    E::write_u16(buf, v)
}

pub fn put_u32(buf: &mut [u8], v: u32) {
    E::write_u32(buf, v)
}

pub fn put_u64(buf: &mut [u8], v: u64) {
    E::write_u64(buf, v)
}

pub fn put_i64(buf: &mut [u8], v: i64) {
    E::write_i64(buf, v)
}

#[cfg(test)]
mod test {
    #[test]
    fn test_round_trip() {
        let mut buf = [0u8; 8];
        super::put_u64(&mut buf, 0x0102_0304_0506_0708);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(super::get_u64(&buf), 0x0102_0304_0506_0708);
        assert_eq!(super::get_u32(&buf), 0x0102_0304);
        assert_eq!(super::get_u16(&buf), 0x0102);
    }
}
