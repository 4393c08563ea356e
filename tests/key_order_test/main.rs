use bolero::check;

use arbor::Key;

// Property harness for the key codec: decode(encode(x)) == x for every
// recognized scalar, and x < y exactly when encode(x) < encode(y) under
// unsigned byte comparison, across single- and multi-segment keys.
fn main() {
    check!().with_type().for_each(
        |(a, b, x, y, raw): &(i64, i64, Vec<u8>, Vec<u8>, u64)| {
            scalar_round_trip(*a, x != y, x);
            int_order(*a, *b);
            bytes_order(x, y);
            float_order(f64::from_bits(*raw), *a as f64);
            composite_order(*a, x, *b, y);
        },
    );
}

fn scalar_round_trip(a: i64, flag: bool, bytes: &[u8]) {
    let mut k = Key::new();
    k.append_bool(flag)
        .unwrap()
        .append_i64(a)
        .unwrap()
        .append_i32(a as i32)
        .unwrap()
        .append_i16(a as i16)
        .unwrap()
        .append_i8(a as i8)
        .unwrap()
        .append_timestamp(a as u64)
        .unwrap();
    // a failed append (key length bound) leaves the key unchanged.
    let appended = k.append_bytes(bytes).is_ok();

    k.reset_index();
    assert_eq!(k.decode_bool().unwrap(), flag);
    assert_eq!(k.decode_i64().unwrap(), a);
    assert_eq!(k.decode_i32().unwrap(), a as i32);
    assert_eq!(k.decode_i16().unwrap(), a as i16);
    assert_eq!(k.decode_i8().unwrap(), a as i8);
    assert_eq!(k.decode_timestamp().unwrap(), a as u64);
    if appended {
        assert_eq!(k.decode_bytes().unwrap(), bytes.to_vec());
    }
}

fn int_order(a: i64, b: i64) {
    let mut ka = Key::new();
    ka.append_i64(a).unwrap();
    let mut kb = Key::new();
    kb.append_i64(b).unwrap();
    assert_eq!(a.cmp(&b), ka.encoded().cmp(kb.encoded()), "{a} vs {b}");
}

fn bytes_order(x: &[u8], y: &[u8]) {
    let (Ok(kx), Ok(ky)) = (key_of_bytes(x), key_of_bytes(y)) else {
        return; // over the key length bound; nothing to compare
    };
    assert_eq!(x.cmp(y), kx.encoded().cmp(ky.encoded()));
    let mut back = kx.clone();
    back.reset_index();
    assert_eq!(back.decode_bytes().unwrap(), x.to_vec());
}

fn key_of_bytes(x: &[u8]) -> Result<Key, arbor::Error> {
    let mut k = Key::new();
    k.append_bytes(x)?;
    Ok(k)
}

fn float_order(a: f64, b: f64) {
    if a.is_nan() || b.is_nan() {
        return;
    }
    let mut ka = Key::new();
    ka.append_f64(a).unwrap();
    let mut kb = Key::new();
    kb.append_f64(b).unwrap();
    if a < b {
        assert!(ka.encoded() < kb.encoded(), "{a} vs {b}");
    }
    if a > b {
        assert!(ka.encoded() > kb.encoded(), "{a} vs {b}");
    }
}

fn composite_order(a: i64, x: &[u8], b: i64, y: &[u8]) {
    let (Ok(ka), Ok(kb)) = (composite(a, x), composite(b, y)) else {
        return;
    };
    // segment-wise ordering: first segment decides, bytes break the tie.
    let expected = a.cmp(&b).then_with(|| x.cmp(y));
    assert_eq!(expected, ka.encoded().cmp(kb.encoded()));
}

fn composite(n: i64, tail: &[u8]) -> Result<Key, arbor::Error> {
    let mut k = Key::new();
    k.append_i64(n)?.append_bytes(tail)?;
    Ok(k)
}
