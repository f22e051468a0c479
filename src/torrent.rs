//! Interpretation of a fetched `info` dictionary.
//!
//! The dict arrives from an adversarial swarm, so every field access is
//! defensive: missing or odd-typed fields degrade to empty values instead of
//! failing the fetch (the SHA-1 check has already proven the bytes genuine).

use crate::bencode::{self, Value};
use crate::utils::hex_upper;
use std::net::SocketAddr;

/// One entry of a multi-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub length: i64,
    pub path: Vec<String>,
}

/// What the harvester keeps from a validated info dict.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub infohash_hex: String,
    pub name: String,
    pub total_size: i64,
    pub files: Vec<TorrentFile>,
    pub source_ip: String,
}

impl TorrentInfo {
    pub fn from_info_dict(info: &Value, infohash: &[u8; 20], source: SocketAddr) -> TorrentInfo {
        let raw_name = preferred_field(info, b"name.utf-8", b"name");
        let name = decode_text(raw_name, info).trim().to_string();

        let mut files = Vec::new();
        let mut total_size = 0i64;
        if let Some(list) = bencode::get_list(info, b"files") {
            for item in list {
                if !matches!(item, Value::Dict(_)) {
                    continue;
                }
                let length = bencode::get_int(item, b"length").unwrap_or(0);
                total_size = total_size.saturating_add(length);
                let raw_path = bencode::dict_get(item, b"path.utf-8")
                    .or_else(|| bencode::dict_get(item, b"path"));
                files.push(TorrentFile {
                    length,
                    path: decode_path_list(raw_path, info),
                });
            }
        } else if let Some(length) = bencode::get_int(info, b"length") {
            total_size = length;
        }

        TorrentInfo {
            infohash_hex: hex_upper(infohash),
            name,
            total_size,
            files,
            source_ip: source.ip().to_string(),
        }
    }

    pub fn magnet(&self) -> String {
        format!("magnet:?xt=urn:btih:{}", self.infohash_hex)
    }
}

fn preferred_field<'a>(dict: &'a Value, utf8_key: &[u8], plain_key: &[u8]) -> Option<&'a [u8]> {
    bencode::get_bytes(dict, utf8_key).or_else(|| bencode::get_bytes(dict, plain_key))
}

fn declared_encoding(info: &Value) -> Option<&'static encoding_rs::Encoding> {
    let label = bencode::get_bytes(info, b"encoding")?;
    encoding_rs::Encoding::for_label(label)
}

/// Decode a torrent text field: strict UTF-8 first, then whatever encoding
/// the info dict declares, then lossy UTF-8.
pub fn decode_text(raw: Option<&[u8]>, info: &Value) -> String {
    let Some(raw) = raw else {
        return String::new();
    };
    if let Ok(text) = std::str::from_utf8(raw) {
        return text.to_string();
    }
    if let Some(encoding) = declared_encoding(info) {
        return encoding.decode(raw).0.into_owned();
    }
    String::from_utf8_lossy(raw).into_owned()
}

fn decode_path_list(raw: Option<&Value>, info: &Value) -> Vec<String> {
    let Some(Value::List(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Bytes(b) => Some(decode_text(Some(b), info)),
            Value::Int(i) => Some(i.to_string()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decode;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn source() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881))
    }

    #[test]
    fn test_single_file_info() {
        let info = decode(b"d6:lengthi2048e4:name8:demo.isoe").unwrap();
        let parsed = TorrentInfo::from_info_dict(&info, &[0xAB; 20], source());
        assert_eq!(parsed.name, "demo.iso");
        assert_eq!(parsed.total_size, 2048);
        assert!(parsed.files.is_empty());
        assert_eq!(parsed.source_ip, "1.2.3.4");
        assert_eq!(parsed.infohash_hex.len(), 40);
        assert!(parsed.magnet().starts_with("magnet:?xt=urn:btih:ABAB"));
    }

    #[test]
    fn test_multi_file_info() {
        let info = decode(
            b"d5:filesld6:lengthi10e4:pathl1:a1:beed6:lengthi30e4:pathl1:ceee4:name3:dire",
        )
        .unwrap();
        let parsed = TorrentInfo::from_info_dict(&info, &[1; 20], source());
        assert_eq!(parsed.name, "dir");
        assert_eq!(parsed.total_size, 40);
        assert_eq!(
            parsed.files,
            vec![
                TorrentFile { length: 10, path: vec!["a".into(), "b".into()] },
                TorrentFile { length: 30, path: vec!["c".into()] },
            ]
        );
    }

    #[test]
    fn test_name_utf8_preferred() {
        let info = decode(b"d4:name3:old10:name.utf-83:newe").unwrap();
        let parsed = TorrentInfo::from_info_dict(&info, &[1; 20], source());
        assert_eq!(parsed.name, "new");
    }

    #[test]
    fn test_declared_encoding_fallback() {
        // 0xC4 0xE3 is GBK for U+4F60; invalid as UTF-8.
        let info = decode(b"d8:encoding3:gbk4:name2:\xC4\xE3e").unwrap();
        let parsed = TorrentInfo::from_info_dict(&info, &[1; 20], source());
        assert_eq!(parsed.name, "\u{4F60}");
    }

    #[test]
    fn test_lossy_fallback_without_encoding() {
        let info = decode(b"d4:name4:a\xFF\xFEbe").unwrap();
        let parsed = TorrentInfo::from_info_dict(&info, &[1; 20], source());
        assert_eq!(parsed.name, "a\u{FFFD}\u{FFFD}b");
    }

    #[test]
    fn test_odd_shapes_degrade_quietly() {
        let info = decode(b"d5:filesli1ed4:pathi7eeee").unwrap();
        let parsed = TorrentInfo::from_info_dict(&info, &[1; 20], source());
        assert_eq!(parsed.name, "");
        assert_eq!(parsed.total_size, 0);
        assert_eq!(parsed.files, vec![TorrentFile { length: 0, path: vec![] }]);
    }
}
