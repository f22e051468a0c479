//! Peer reputation persisted as newline-delimited JSON.
//!
//! Two instances exist at runtime: one for DHT nodes that answered
//! `find_node` (bootstrap seeds) and one for peers that served metadata
//! (hint amplification). Records from the previous run are reloaded at
//! startup, then the file is truncated so it only accumulates peers
//! confirmed live during this run.

use crate::utils::unix_now;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Serialize, Deserialize)]
struct PeerRecord {
    ip: String,
    port: u16,
    last_ok: u64,
}

pub struct PeerStore {
    path: PathBuf,
    ttl_seconds: u64,
    max_peers: usize,
    peers: Mutex<HashMap<SocketAddr, u64>>,
}

impl PeerStore {
    pub fn open(path: impl Into<PathBuf>, ttl_seconds: u64, max_peers: usize) -> PeerStore {
        let path = path.into();
        let peers = load_previous(&path, ttl_seconds, max_peers);
        reset_file(&path);
        PeerStore {
            path,
            ttl_seconds,
            max_peers,
            peers: Mutex::new(peers),
        }
    }

    /// Record that `addr` just behaved. `last_ok` is monotone non-decreasing
    /// per address; the on-disk file gets one appended line per call.
    /// Filesystem trouble is ignored, memory stays authoritative.
    pub fn mark_ok(&self, addr: SocketAddr) {
        if addr.port() == 0 {
            return;
        }
        let now = unix_now();
        let mut peers = self.peers.lock().unwrap();

        let last = peers.entry(addr).or_insert(0);
        if now > *last {
            *last = now;
        }
        while peers.len() > self.max_peers {
            let Some(oldest) = peers.iter().min_by_key(|(_, ts)| **ts).map(|(a, _)| *a) else {
                break;
            };
            peers.remove(&oldest);
        }

        let record = PeerRecord {
            ip: addr.ip().to_string(),
            port: addr.port(),
            last_ok: now,
        };
        if let Ok(json) = serde_json::to_string(&record) {
            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&self.path) {
                let _ = writeln!(file, "{json}");
            }
        }
    }

    /// Up to `k` random addresses drawn from the `max(4k, k)` most recently
    /// confirmed entries.
    pub fn sample(&self, k: usize) -> Vec<SocketAddr> {
        if k == 0 {
            return Vec::new();
        }
        let mut entries: Vec<(SocketAddr, u64)> = {
            let peers = self.peers.lock().unwrap();
            peers.iter().map(|(a, ts)| (*a, *ts)).collect()
        };
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(k.saturating_mul(4).max(k));
        let pool: Vec<SocketAddr> = entries.into_iter().map(|(a, _)| a).collect();
        pool.choose_multiple(&mut rand::thread_rng(), k)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.peers.lock().unwrap().contains_key(&addr)
    }
}

fn load_previous(path: &Path, ttl_seconds: u64, max_peers: usize) -> HashMap<SocketAddr, u64> {
    let now = unix_now();
    let mut peers: HashMap<SocketAddr, u64> = HashMap::new();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return peers,
    };
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<PeerRecord>(line) else {
            continue;
        };
        if record.port == 0 {
            continue;
        }
        let Ok(ip) = record.ip.parse::<IpAddr>() else {
            continue;
        };
        if now.saturating_sub(record.last_ok) > ttl_seconds {
            continue;
        }
        let last = peers.entry(SocketAddr::new(ip, record.port)).or_insert(0);
        if record.last_ok > *last {
            *last = record.last_ok;
        }
    }
    if peers.len() > max_peers {
        let mut entries: Vec<(SocketAddr, u64)> = peers.into_iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(max_peers);
        peers = entries.into_iter().collect();
    }
    peers
}

fn reset_file(path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = fs::create_dir_all(parent);
        }
    }
    let _ = File::create(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port))
    }

    #[test]
    fn test_mark_ok_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.jsonl");

        let store = PeerStore::open(&path, 3600, 100);
        store.mark_ok(addr(1, 6881));
        store.mark_ok(addr(2, 6882));
        drop(store);

        let reloaded = PeerStore::open(&path, 3600, 100);
        assert!(reloaded.contains(addr(1, 6881)));
        assert!(reloaded.contains(addr(2, 6882)));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_open_truncates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.jsonl");

        let store = PeerStore::open(&path, 3600, 100);
        store.mark_ok(addr(1, 6881));
        drop(store);

        let _reloaded = PeerStore::open(&path, 3600, 100);
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_expired_records_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.jsonl");
        let now = unix_now();
        fs::write(
            &path,
            format!(
                "{{\"ip\":\"10.0.0.1\",\"port\":6881,\"last_ok\":{}}}\n\
                 {{\"ip\":\"10.0.0.2\",\"port\":6882,\"last_ok\":{}}}\n",
                now - 10,
                now - 7200,
            ),
        )
        .unwrap();

        let store = PeerStore::open(&path, 3600, 100);
        assert!(store.contains(addr(1, 6881)));
        assert!(!store.contains(addr(2, 6882)));
    }

    #[test]
    fn test_duplicate_lines_keep_newest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.jsonl");
        let now = unix_now();
        fs::write(
            &path,
            format!(
                "{{\"ip\":\"10.0.0.1\",\"port\":6881,\"last_ok\":{}}}\n\
                 {{\"ip\":\"10.0.0.1\",\"port\":6881,\"last_ok\":{}}}\n",
                now - 5,
                now - 50,
            ),
        )
        .unwrap();

        let store = PeerStore::open(&path, 3600, 100);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_garbage_lines_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.jsonl");
        let now = unix_now();
        fs::write(
            &path,
            format!(
                "not json\n\
                 {{\"ip\":\"bad ip\",\"port\":1,\"last_ok\":{now}}}\n\
                 {{\"ip\":\"10.0.0.3\",\"port\":0,\"last_ok\":{now}}}\n\
                 {{\"ip\":\"10.0.0.1\",\"port\":6881,\"last_ok\":{now}}}\n"
            ),
        )
        .unwrap();

        let store = PeerStore::open(&path, 3600, 100);
        assert_eq!(store.len(), 1);
        assert!(store.contains(addr(1, 6881)));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.jsonl");
        let now = unix_now();
        fs::write(
            &path,
            format!(
                "{{\"ip\":\"10.0.0.1\",\"port\":1001,\"last_ok\":{}}}\n\
                 {{\"ip\":\"10.0.0.2\",\"port\":1002,\"last_ok\":{}}}\n\
                 {{\"ip\":\"10.0.0.3\",\"port\":1003,\"last_ok\":{}}}\n",
                now - 300,
                now - 200,
                now - 100,
            ),
        )
        .unwrap();

        let store = PeerStore::open(&path, 3600, 2);
        assert_eq!(store.len(), 2);
        assert!(!store.contains(addr(1, 1001)));
        assert!(store.contains(addr(2, 1002)));
        assert!(store.contains(addr(3, 1003)));
    }

    #[test]
    fn test_sample_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::open(dir.path().join("peers.jsonl"), 3600, 100);
        for i in 1..=10u8 {
            store.mark_ok(addr(i, 6000 + u16::from(i)));
        }

        assert!(store.sample(0).is_empty());
        let picked = store.sample(4);
        assert_eq!(picked.len(), 4);
        let mut unique = picked.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 4);

        assert_eq!(store.sample(50).len(), 10);
    }
}
