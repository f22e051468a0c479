//! The dispatcher sits between the DHT node and the metadata fetchers:
//! it deduplicates observations, fans each fresh infohash out to known-good
//! peers, quarantines addresses that keep failing, and bounds how many fetch
//! workers run at once.

use crate::dht::node::InfohashSink;
use crate::logger::Logger;
use crate::metadata::{self, FetchStatus, StorageSink};
use crate::store::PeerStore;
use crate::utils::{hex_upper, random_id};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub struct DispatcherConfig {
    pub max_workers: usize,
    /// Known-good peers to try per fresh infohash, on top of the announcer.
    pub hint_k: usize,
    /// Seen-set size that triggers a full flush.
    pub seen_flush_limit: usize,
    pub bad_ttl: Duration,
    pub fail_window: Duration,
    pub fail_threshold: u32,
    pub fetch_timeout: Duration,
    pub peer_store_path: PathBuf,
    pub peer_store_ttl_seconds: u64,
    pub peer_store_max: usize,
    pub heartbeat_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            max_workers: 100,
            hint_k: 5,
            seen_flush_limit: 60_000,
            bad_ttl: Duration::from_secs(300),
            fail_window: Duration::from_secs(180),
            fail_threshold: 3,
            fetch_timeout: Duration::from_secs(6),
            peer_store_path: PathBuf::from("state/metadata_peers.jsonl"),
            peer_store_ttl_seconds: 72 * 3600,
            peer_store_max: 1000,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

pub struct Dispatcher {
    cfg: DispatcherConfig,
    work_tx: Sender<(SocketAddr, [u8; 20])>,
    work_rx: Receiver<(SocketAddr, [u8; 20])>,
    // Bounded token channel doubling as the counting semaphore: send to
    // acquire a worker slot, recv to release one.
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
    seen: Mutex<HashSet<(String, SocketAddr)>>,
    bad: Mutex<HashMap<SocketAddr, Instant>>,
    fail_counts: Mutex<HashMap<SocketAddr, (u32, Instant)>>,
    peer_store: PeerStore,
    ok_count: AtomicU64,
    fail_count: AtomicU64,
    sink: Arc<dyn StorageSink>,
    logger: Arc<Logger>,
}

impl Dispatcher {
    pub fn new(
        cfg: DispatcherConfig,
        sink: Arc<dyn StorageSink>,
        logger: Arc<Logger>,
    ) -> Arc<Dispatcher> {
        let (work_tx, work_rx) = channel::unbounded();
        let (slot_tx, slot_rx) = channel::bounded(cfg.max_workers.max(1));
        let peer_store = PeerStore::open(
            &cfg.peer_store_path,
            cfg.peer_store_ttl_seconds,
            cfg.peer_store_max,
        );
        Arc::new(Dispatcher {
            cfg,
            work_tx,
            work_rx,
            slot_tx,
            slot_rx,
            seen: Mutex::new(HashSet::new()),
            bad: Mutex::new(HashMap::new()),
            fail_counts: Mutex::new(HashMap::new()),
            peer_store,
            ok_count: AtomicU64::new(0),
            fail_count: AtomicU64::new(0),
            sink,
            logger,
        })
    }

    /// Start the dequeue loop on its own thread.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        thread::spawn(move || this.run());
    }

    fn run(self: Arc<Self>) {
        let mut last_heartbeat = Instant::now();
        self.heartbeat();
        loop {
            if last_heartbeat.elapsed() >= self.cfg.heartbeat_interval {
                self.heartbeat();
                last_heartbeat = Instant::now();
            }
            let (address, infohash) = match self.work_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            };
            // Blocks while all slots are taken; this is the only back-pressure.
            if self.slot_tx.send(()).is_err() {
                return;
            }
            let this = Arc::clone(&self);
            thread::spawn(move || this.worker(address, infohash));
        }
    }

    fn worker(&self, address: SocketAddr, infohash: [u8; 20]) {
        let status = metadata::fetch_metadata(
            address,
            &infohash,
            random_id,
            self.sink.as_ref(),
            &self.logger,
            self.cfg.fetch_timeout,
        );
        if status == FetchStatus::Ok {
            self.ok_count.fetch_add(1, Ordering::Relaxed);
            self.peer_store.mark_ok(address);
        } else {
            self.fail_count.fetch_add(1, Ordering::Relaxed);
            if status.damages_reputation() {
                self.record_failure(address);
            }
        }
        let _ = self.slot_rx.recv();
    }

    /// Admit `(infohash, address)` into the work queue at most once per
    /// seen-set generation. Returns whether it was enqueued.
    fn enqueue_once(&self, infohash: &[u8; 20], address: SocketAddr) -> bool {
        if address.port() == 0 {
            return false;
        }
        if self.is_bad(address) {
            return false;
        }
        let hid = hex_upper(infohash);
        {
            let mut seen = self.seen.lock().unwrap();
            if !seen.insert((hid.clone(), address)) {
                return false;
            }
            if seen.len() > self.cfg.seen_flush_limit {
                // Bounded memory beats perfect dedup; ancient triples may
                // re-enqueue after a flush.
                seen.clear();
            }
        }
        self.logger.line(&format!("[INFO] [infohash] {hid} from {address}"));
        let _ = self.work_tx.send((address, *infohash));
        true
    }

    fn record_failure(&self, address: SocketAddr) {
        let now = Instant::now();
        let crossed = {
            let mut counts = self.fail_counts.lock().unwrap();
            let entry = counts
                .entry(address)
                .or_insert((0, now + self.cfg.fail_window));
            if entry.1 <= now {
                *entry = (0, now + self.cfg.fail_window);
            }
            entry.0 += 1;
            entry.0 >= self.cfg.fail_threshold
        };
        if crossed {
            debug!("quarantining {address}");
            self.bad
                .lock()
                .unwrap()
                .insert(address, Instant::now() + self.cfg.bad_ttl);
        }
    }

    fn is_bad(&self, address: SocketAddr) -> bool {
        let mut bad = self.bad.lock().unwrap();
        let Some(&until) = bad.get(&address) else {
            return false;
        };
        if until > Instant::now() {
            true
        } else {
            // expired entries leave lazily, on lookup
            bad.remove(&address);
            false
        }
    }

    fn heartbeat(&self) {
        self.logger.line(&format!(
            "[INFO] hb q {} workers {} bad {} seen {} ok {} fail {}",
            self.work_rx.len(),
            self.slot_rx.len(),
            self.bad.lock().unwrap().len(),
            self.seen.lock().unwrap().len(),
            self.ok_count.load(Ordering::Relaxed),
            self.fail_count.load(Ordering::Relaxed),
        ));
    }
}

impl InfohashSink for Dispatcher {
    /// Non-blocking entry point for the DHT receive thread: enqueue the
    /// observation, then amplify a fresh infohash to peers that served
    /// metadata before.
    fn log_infohash(&self, infohash: &[u8; 20], address: SocketAddr) {
        if !self.enqueue_once(infohash, address) {
            return;
        }
        for hint in self.peer_store.sample(self.cfg.hint_k) {
            if hint == address {
                continue;
            }
            self.enqueue_once(infohash, hint);
        }
    }
}
