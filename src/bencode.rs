//! Thin layer over `serde_bencode`'s dynamic value type.
//!
//! Everything arriving from the network is untrusted, so decoding never
//! panics and malformed input is dropped at the boundary. The framing scan
//! exists because `ut_metadata` data messages carry raw piece bytes after
//! the bencoded header with no length field of their own.

use std::collections::HashMap;

pub use serde_bencode::value::Value;

/// Decode a complete bencoded value. `None` on any malformed input.
pub fn decode(bytes: &[u8]) -> Option<Value> {
    serde_bencode::from_bytes(bytes).ok()
}

/// Encode a value. Dict entries come out sorted by raw key bytes, which
/// bencoding requires.
pub fn encode(value: &Value) -> Option<Vec<u8>> {
    serde_bencode::to_bytes(value).ok()
}

pub fn bytes(b: &[u8]) -> Value {
    Value::Bytes(b.to_vec())
}

pub fn int(i: i64) -> Value {
    Value::Int(i)
}

pub fn dict(entries: Vec<(&[u8], Value)>) -> Value {
    let map: HashMap<Vec<u8>, Value> = entries
        .into_iter()
        .map(|(k, v)| (k.to_vec(), v))
        .collect();
    Value::Dict(map)
}

pub fn dict_get<'a>(value: &'a Value, key: &[u8]) -> Option<&'a Value> {
    match value {
        Value::Dict(entries) => entries.get(key),
        _ => None,
    }
}

pub fn get_bytes<'a>(value: &'a Value, key: &[u8]) -> Option<&'a [u8]> {
    match dict_get(value, key)? {
        Value::Bytes(b) => Some(b),
        _ => None,
    }
}

pub fn get_int(value: &Value, key: &[u8]) -> Option<i64> {
    match dict_get(value, key)? {
        Value::Int(i) => Some(*i),
        _ => None,
    }
}

pub fn get_dict<'a>(value: &'a Value, key: &[u8]) -> Option<&'a Value> {
    match dict_get(value, key)? {
        d @ Value::Dict(_) => Some(d),
        _ => None,
    }
}

pub fn get_list<'a>(value: &'a Value, key: &[u8]) -> Option<&'a [Value]> {
    match dict_get(value, key)? {
        Value::List(items) => Some(items),
        _ => None,
    }
}

/// Index one past the bencoded value starting at `start`, or `None` if the
/// buffer holds no complete well-formed value there. Dict keys are not
/// type-checked; the scan only cares about framing.
pub fn value_end(buf: &[u8], start: usize) -> Option<usize> {
    match buf.get(start)? {
        b'i' => {
            let rel = buf.get(start + 1..)?.iter().position(|&b| b == b'e')?;
            Some(start + 1 + rel + 1)
        }
        b'l' | b'd' => {
            let mut i = start + 1;
            loop {
                if *buf.get(i)? == b'e' {
                    return Some(i + 1);
                }
                i = value_end(buf, i)?;
            }
        }
        b'0'..=b'9' => {
            let rel = buf.get(start..)?.iter().position(|&b| b == b':')?;
            let colon = start + rel;
            let len: usize = std::str::from_utf8(&buf[start..colon])
                .ok()?
                .parse()
                .ok()?;
            let end = colon.checked_add(1)?.checked_add(len)?;
            (end <= buf.len()).then_some(end)
        }
        _ => None,
    }
}

/// Locate the first dict in `buf`, decode it, and hand back the bytes that
/// follow it. This is how piece payloads are split off `ut_metadata` data
/// messages.
pub fn split_framed_dict(buf: &[u8]) -> Option<(Value, &[u8])> {
    let start = buf.iter().position(|&b| b == b'd')?;
    let end = value_end(buf, start)?;
    let header = decode(&buf[start..end])?;
    if matches!(header, Value::Dict(_)) {
        Some((header, &buf[end..]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_canonical() {
        for input in [
            &b"i42e"[..],
            b"0:",
            b"4:spam",
            b"li1ei2e4:spame",
            b"d3:bar4:spam3:fooi42ee",
            b"d1:ad2:id2:abe1:q9:find_node1:t2:xy1:y1:qe",
        ] {
            let value = decode(input).unwrap();
            assert_eq!(encode(&value).unwrap(), input.to_vec());
        }
    }

    #[test]
    fn test_encode_sorts_dict_keys() {
        let value = dict(vec![
            (b"zz", int(1)),
            (b"a", bytes(b"x")),
            (b"m", dict(vec![(b"b", int(2)), (b"aa", int(3))])),
        ]);
        assert_eq!(
            encode(&value).unwrap(),
            b"d1:a1:x1:md2:aai3e1:bi2ee2:zzi1ee".to_vec()
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode(b"").is_none());
        assert!(decode(b"i42").is_none());
        assert!(decode(b"5:spam").is_none());
        assert!(decode(b"x").is_none());
    }

    #[test]
    fn test_accessors() {
        let value = decode(b"d3:fooi42e3:bar4:spam4:listli1ee4:subdd1:ki2eee").unwrap();
        assert_eq!(get_int(&value, b"foo"), Some(42));
        assert_eq!(get_bytes(&value, b"bar"), Some(&b"spam"[..]));
        assert_eq!(get_list(&value, b"list").map(<[Value]>::len), Some(1));
        assert!(get_dict(&value, b"subd").is_some());
        assert_eq!(get_int(&value, b"bar"), None);
        assert_eq!(get_bytes(&value, b"missing"), None);
    }

    #[test]
    fn test_value_end_scans_past_values() {
        assert_eq!(value_end(b"i42etail", 0), Some(4));
        assert_eq!(value_end(b"4:spamtail", 0), Some(6));
        assert_eq!(value_end(b"li1ei2eetail", 0), Some(8));
        assert_eq!(value_end(b"d1:ai1eetail", 0), Some(8));
        assert_eq!(value_end(b"xxd1:ai1ee", 2), Some(10));
    }

    #[test]
    fn test_value_end_rejects_truncated() {
        assert_eq!(value_end(b"", 0), None);
        assert_eq!(value_end(b"i42", 0), None);
        assert_eq!(value_end(b"9:shrt", 0), None);
        assert_eq!(value_end(b"li1e", 0), None);
        assert_eq!(value_end(b"d1:a", 0), None);
        assert_eq!(value_end(b"e", 0), None);
    }

    #[test]
    fn test_split_framed_dict() {
        let buf = b"d8:msg_typei1e5:piecei0e10:total_sizei30ee\x01\x02\x03";
        let (header, tail) = split_framed_dict(buf).unwrap();
        assert_eq!(get_int(&header, b"msg_type"), Some(1));
        assert_eq!(get_int(&header, b"piece"), Some(0));
        assert_eq!(get_int(&header, b"total_size"), Some(30));
        assert_eq!(tail, &[1, 2, 3]);
    }

    #[test]
    fn test_split_framed_dict_skips_leading_noise() {
        let buf = b"\x14\x01d5:piecei2e8:msg_typei1eeXYZ";
        let (header, tail) = split_framed_dict(buf).unwrap();
        assert_eq!(get_int(&header, b"piece"), Some(2));
        assert_eq!(tail, b"XYZ");
    }

    #[test]
    fn test_split_framed_dict_rejects_garbage() {
        assert!(split_framed_dict(b"no dict start marker here!").is_none());
        assert!(split_framed_dict(b"d1:a").is_none());
    }
}
