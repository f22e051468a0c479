use rand::Rng;
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};
use unicode_normalization::UnicodeNormalization;

/// Generates a fresh 20-byte identifier: SHA-1 over 20 bytes of entropy.
/// Used for our node id, per-connection peer ids and `find_node` targets.
pub fn random_id() -> [u8; 20] {
    let mut seed = [0u8; 20];
    rand::thread_rng().fill(&mut seed);
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.finalize().into()
}

pub fn entropy(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill(&mut buf[..]);
    buf
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Canonical text form of an infohash.
pub fn hex_upper(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02X}");
    }
    out
}

pub fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Flattens a torrent name into a single safe filesystem component:
/// NFKC-normalized, path separators and control characters replaced,
/// trimmed of whitespace and dots, capped at 180 characters.
pub fn safe_filename(name: &str, fallback: &str) -> String {
    let base = if name.is_empty() { fallback } else { name };
    let normalized: String = base.nfkc().collect();
    let replaced: String = normalized
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim().trim_matches('.').trim();
    let capped: String = trimmed.chars().take(180).collect();
    let capped = capped.trim_end();
    if capped.is_empty() {
        fallback.to_string()
    } else {
        capped.to_string()
    }
}
