//! The DHT presence: a UDP KRPC endpoint crafted to attract, not to serve.
//!
//! The node joins the overlay with `find_node`, then answers `get_peers` and
//! `announce_peer` with ids synthesized to sit next to whatever the asker is
//! looking for. It stores nothing and returns empty node lists; its only
//! product is the stream of `(infohash, peer)` observations handed to the
//! dispatcher.

use crate::bencode::{self, Value};
use crate::dht::krpc::{self, KNode};
use crate::logger::Logger;
use crate::store::PeerStore;
use crate::utils::{entropy, random_id};
use anyhow::{Context, Result};
use log::{debug, warn};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// The well-known entry points into the public DHT.
pub const BOOTSTRAP_NODES: [&str; 3] = [
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Short receive deadline so the status line and counters stay fresh even
/// while the socket is quiet.
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(100);

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

/// Where harvested `(infohash, address)` observations go.
pub trait InfohashSink: Send + Sync {
    fn log_infohash(&self, infohash: &[u8; 20], address: SocketAddr);
}

pub struct DhtConfig {
    pub bind_addr: SocketAddr,
    pub bootstrap_hosts: Vec<String>,
    /// Node queue capacity; also sets the drainer pace to one pop per
    /// `1 / max_node_qsize` seconds.
    pub max_node_qsize: usize,
    pub rejoin_interval: Duration,
    /// Prefix length shared by synthesized neighbor ids and announce tokens.
    pub token_length: usize,
    pub tid_length: usize,
    pub bootstrap_store_path: PathBuf,
    pub bootstrap_ttl_seconds: u64,
    pub bootstrap_max_peers: usize,
    /// How many stored bootstrap peers to blend into each join round.
    pub bootstrap_extra_k: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 6882)),
            bootstrap_hosts: BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            max_node_qsize: 200,
            rejoin_interval: Duration::from_secs(3),
            token_length: 2,
            tid_length: 2,
            bootstrap_store_path: PathBuf::from("state/dht_bootstrap.jsonl"),
            bootstrap_ttl_seconds: 72 * 3600,
            bootstrap_max_peers: 5000,
            bootstrap_extra_k: 50,
        }
    }
}

pub struct DhtNode {
    cfg: DhtConfig,
    nid: [u8; 20],
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    nodes: Mutex<VecDeque<KNode>>,
    bootstrap_store: PeerStore,
    bootstrap_extra: Vec<SocketAddr>,
    rx: AtomicU64,
    tx: AtomicU64,
    q_announce: AtomicU64,
    q_get_peers: AtomicU64,
    sink: Arc<dyn InfohashSink>,
    logger: Arc<Logger>,
}

impl DhtNode {
    /// Bind the UDP socket and start the receive loop, the node-queue drainer
    /// and the rejoin timer. Failing to bind is the only fatal error in the
    /// whole system.
    pub fn spawn(
        cfg: DhtConfig,
        sink: Arc<dyn InfohashSink>,
        logger: Arc<Logger>,
    ) -> Result<Arc<DhtNode>> {
        let mut socket = UdpSocket::bind(cfg.bind_addr)
            .with_context(|| format!("binding UDP socket on {}", cfg.bind_addr))?;
        let local_addr = socket.local_addr().context("reading bound address")?;
        let poll = Poll::new().context("creating poll instance")?;
        poll.registry()
            .register(&mut socket, Token(0), Interest::READABLE)
            .context("registering UDP socket")?;

        let bootstrap_store = PeerStore::open(
            &cfg.bootstrap_store_path,
            cfg.bootstrap_ttl_seconds,
            cfg.bootstrap_max_peers,
        );
        let bootstrap_extra = bootstrap_store.sample(cfg.bootstrap_extra_k);

        let node = Arc::new(DhtNode {
            nid: random_id(),
            socket: Arc::new(socket),
            local_addr,
            nodes: Mutex::new(VecDeque::new()),
            bootstrap_store,
            bootstrap_extra,
            rx: AtomicU64::new(0),
            tx: AtomicU64::new(0),
            q_announce: AtomicU64::new(0),
            q_get_peers: AtomicU64::new(0),
            sink,
            logger,
            cfg,
        });

        let recv = Arc::clone(&node);
        thread::spawn(move || recv.recv_loop(poll));
        let drain = Arc::clone(&node);
        thread::spawn(move || drain.drain_loop());
        let rejoin = Arc::clone(&node);
        thread::spawn(move || rejoin.rejoin_loop());
        Ok(node)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn recv_loop(&self, mut poll: Poll) {
        let mut events = Events::with_capacity(16);
        let mut buf = [0u8; 65536];
        let mut spin = 0usize;
        loop {
            if let Err(err) = poll.poll(&mut events, Some(RECV_POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("dht poll failed: {err}");
                thread::sleep(RECV_POLL_TIMEOUT);
                continue;
            }
            loop {
                let (len, from) = match self.socket.recv_from(&mut buf) {
                    Ok(pair) => pair,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        debug!("udp recv failed: {err}");
                        break;
                    }
                };
                self.rx.fetch_add(1, Ordering::Relaxed);
                self.handle_packet(&buf[..len], from);

                let c = SPINNER[spin & 3];
                spin = spin.wrapping_add(1);
                self.logger
                    .status(&format!("{c} {} last {}", self.stats_line(), from.ip()));
            }
        }
    }

    fn stats_line(&self) -> String {
        format!(
            "rx {} tx {} nodes {} announce {} get_peers {}",
            self.rx.load(Ordering::Relaxed),
            self.tx.load(Ordering::Relaxed),
            self.nodes.lock().unwrap().len(),
            self.q_announce.load(Ordering::Relaxed),
            self.q_get_peers.load(Ordering::Relaxed),
        )
    }

    /// The swarm sends plenty of junk; anything that does not decode is
    /// dropped without ceremony.
    fn handle_packet(&self, data: &[u8], from: SocketAddr) {
        let Some(&first) = data.first() else { return };
        if !matches!(first, b'd' | b'l' | b'i' | b'0'..=b'9') {
            return;
        }
        let Some(msg) = bencode::decode(data) else { return };
        match bencode::get_bytes(&msg, b"y") {
            Some(y) if y == b"r" => self.on_response(&msg, from),
            Some(y) if y == b"q" => self.on_query(&msg, from),
            _ => {}
        }
    }

    fn on_response(&self, msg: &Value, from: SocketAddr) {
        let Some(r) = bencode::get_dict(msg, b"r") else { return };
        // Responses without a node list are noise to us.
        let Some(raw) = bencode::get_bytes(r, b"nodes") else { return };
        let nodes = krpc::decode_nodes(raw);
        if nodes.is_empty() {
            return;
        }
        self.bootstrap_store.mark_ok(from);

        let mut queue = self.nodes.lock().unwrap();
        for node in nodes {
            if node.addr.port() == 0 {
                continue;
            }
            if IpAddr::V4(*node.addr.ip()) == self.local_addr.ip() {
                continue;
            }
            while queue.len() >= self.cfg.max_node_qsize {
                queue.pop_front();
            }
            queue.push_back(node);
        }
    }

    fn on_query(&self, msg: &Value, from: SocketAddr) {
        match bencode::get_bytes(msg, b"q") {
            Some(q) if q == b"get_peers" => {
                self.q_get_peers.fetch_add(1, Ordering::Relaxed);
                self.on_get_peers(msg, from);
            }
            Some(q) if q == b"announce_peer" => {
                self.q_announce.fetch_add(1, Ordering::Relaxed);
                self.on_announce_peer(msg, from);
            }
            _ => self.play_dead(msg, from),
        }
    }

    /// Claim the infohash's neighborhood, hand out a token, and return an
    /// empty node list so the asker comes back to us and nobody else.
    fn on_get_peers(&self, msg: &Value, from: SocketAddr) {
        let Some(tid) = bencode::get_bytes(msg, b"t") else { return };
        let Some(a) = bencode::get_dict(msg, b"a") else { return };
        let Some(infohash) = bencode::get_bytes(a, b"info_hash") else { return };
        let token_len = self.cfg.token_length.min(infohash.len());
        let id = krpc::neighbor_id(infohash, &self.nid, self.cfg.token_length);
        let reply = krpc::get_peers_reply(tid, &id, &infohash[..token_len]);
        self.send(&reply, from);
    }

    fn on_announce_peer(&self, msg: &Value, from: SocketAddr) {
        self.harvest_announce(msg, from);
        // Acknowledge no matter what; being agreeable keeps the traffic coming.
        self.reply_ok(msg, from);
    }

    fn harvest_announce(&self, msg: &Value, from: SocketAddr) {
        let Some(a) = bencode::get_dict(msg, b"a") else { return };
        let Some(raw_hash) = bencode::get_bytes(a, b"info_hash") else { return };
        let Ok(infohash) = <[u8; 20]>::try_from(raw_hash) else { return };
        let Some(token) = bencode::get_bytes(a, b"token") else { return };
        let token_len = self.cfg.token_length.min(infohash.len());
        if token != &infohash[..token_len] {
            return;
        }

        let implied = bencode::get_int(a, b"implied_port").unwrap_or(0) != 0;
        let tcp_port = if implied {
            from.port()
        } else {
            match bencode::get_int(a, b"port") {
                Some(p) if (1..=65535).contains(&p) => p as u16,
                _ => return,
            }
        };

        // The announced port may or may not be where the peer actually talks
        // TCP; when it differs from the UDP source port, try both.
        self.sink
            .log_infohash(&infohash, SocketAddr::new(from.ip(), tcp_port));
        if from.port() != tcp_port {
            self.sink.log_infohash(&infohash, from);
        }
    }

    fn reply_ok(&self, msg: &Value, from: SocketAddr) {
        let Some(tid) = bencode::get_bytes(msg, b"t") else { return };
        let Some(peer_id) = bencode::get_dict(msg, b"a").and_then(|a| bencode::get_bytes(a, b"id"))
        else {
            return;
        };
        let id = krpc::neighbor_id(peer_id, &self.nid, self.cfg.token_length);
        self.send(&krpc::announce_ok_reply(tid, &id), from);
    }

    fn play_dead(&self, msg: &Value, from: SocketAddr) {
        let Some(tid) = bencode::get_bytes(msg, b"t") else { return };
        self.send(&krpc::server_error_reply(tid), from);
    }

    fn send(&self, msg: &Value, to: SocketAddr) {
        let Some(payload) = bencode::encode(msg) else { return };
        match self.socket.send_to(&payload, to) {
            Ok(_) => {
                self.tx.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => debug!("udp send to {to} failed: {err}"),
        }
    }

    fn send_find_node(&self, to: SocketAddr, peer_id: Option<&[u8; 20]>) {
        let id = match peer_id {
            Some(nid) => krpc::neighbor_id(nid, &self.nid, self.cfg.token_length),
            None => self.nid,
        };
        let tid = entropy(self.cfg.tid_length);
        self.send(&krpc::find_node_query(&tid, &id, &random_id()), to);
    }

    fn join_dht(&self) {
        for host in &self.cfg.bootstrap_hosts {
            let resolved = match host.to_socket_addrs() {
                Ok(mut addrs) => addrs.find(SocketAddr::is_ipv4),
                Err(err) => {
                    debug!("resolving {host} failed: {err}");
                    None
                }
            };
            if let Some(addr) = resolved {
                self.send_find_node(addr, None);
            }
        }
        for addr in &self.bootstrap_extra {
            self.send_find_node(*addr, None);
        }
    }

    fn rejoin_loop(&self) {
        loop {
            self.logger.status(&self.stats_line());
            if self.nodes.lock().unwrap().is_empty() {
                self.join_dht();
            }
            thread::sleep(self.cfg.rejoin_interval);
        }
    }

    /// Pop one stored node per tick and probe it with a neighbor-of-it id,
    /// pacing so the queue turns over about once a second at capacity.
    fn drain_loop(&self) {
        let pace = Duration::from_secs_f64(1.0 / self.cfg.max_node_qsize.max(1) as f64);
        loop {
            let node = self.nodes.lock().unwrap().pop_front();
            if let Some(node) = node {
                self.send_find_node(SocketAddr::V4(node.addr), Some(&node.id));
            }
            thread::sleep(pace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::time::Instant;

    #[derive(Default)]
    struct CaptureSink {
        observed: Mutex<Vec<([u8; 20], SocketAddr)>>,
    }

    impl CaptureSink {
        fn wait_for(&self, count: usize, deadline: Duration) -> Vec<([u8; 20], SocketAddr)> {
            let start = Instant::now();
            loop {
                {
                    let observed = self.observed.lock().unwrap();
                    if observed.len() >= count {
                        return observed.clone();
                    }
                }
                if start.elapsed() > deadline {
                    return self.observed.lock().unwrap().clone();
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    impl InfohashSink for CaptureSink {
        fn log_infohash(&self, infohash: &[u8; 20], address: SocketAddr) {
            self.observed.lock().unwrap().push((*infohash, address));
        }
    }

    struct Harness {
        node: Arc<DhtNode>,
        sink: Arc<CaptureSink>,
        client: UdpSocket,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DhtConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            bootstrap_hosts: Vec::new(),
            bootstrap_store_path: dir.path().join("dht_bootstrap.jsonl"),
            bootstrap_extra_k: 0,
            ..DhtConfig::default()
        };
        let sink = Arc::new(CaptureSink::default());
        let node = DhtNode::spawn(
            cfg,
            Arc::clone(&sink) as Arc<dyn InfohashSink>,
            Arc::new(Logger::new(false)),
        )
        .unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        Harness { node, sink, client, _dir: dir }
    }

    fn exchange(harness: &Harness, msg: &Value) -> Option<Value> {
        let payload = bencode::encode(msg).unwrap();
        harness
            .client
            .send_to(&payload, harness.node.local_addr())
            .unwrap();
        let mut buf = [0u8; 4096];
        let (len, _) = harness.client.recv_from(&mut buf).ok()?;
        bencode::decode(&buf[..len])
    }

    fn announce_msg(infohash: &[u8; 20], token: &[u8], port: i64, implied: Option<i64>) -> Value {
        let mut args = vec![
            (&b"id"[..], bencode::bytes(&[3u8; 20])),
            (&b"info_hash"[..], bencode::bytes(infohash)),
            (&b"port"[..], bencode::int(port)),
            (&b"token"[..], bencode::bytes(token)),
        ];
        if let Some(flag) = implied {
            args.push((&b"implied_port"[..], bencode::int(flag)));
        }
        bencode::dict(vec![
            (b"t", bencode::bytes(b"aa")),
            (b"y", bencode::bytes(b"q")),
            (b"q", bencode::bytes(b"announce_peer")),
            (b"a", bencode::dict(args)),
        ])
    }

    #[test]
    fn test_announce_peer_enqueues_both_port_candidates() {
        let h = harness();
        let infohash = [0xABu8; 20];
        let reply = exchange(&h, &announce_msg(&infohash, &infohash[..2], 6881, None)).unwrap();

        assert_eq!(bencode::get_bytes(&reply, b"y"), Some(&b"r"[..]));
        let r = bencode::get_dict(&reply, b"r").unwrap();
        let id = bencode::get_bytes(r, b"id").unwrap();
        assert_eq!(id.len(), 20);
        // neighbor of the announcer's id
        assert_eq!(&id[..2], &[3u8, 3u8]);

        let client_addr = h.client.local_addr().unwrap();
        let observed = h.sink.wait_for(2, Duration::from_secs(2));
        assert_eq!(observed.len(), 2);
        assert!(observed.contains(&(infohash, SocketAddr::from(([127, 0, 0, 1], 6881)))));
        assert!(observed
            .contains(&(infohash, SocketAddr::from(([127, 0, 0, 1], client_addr.port())))));
    }

    #[test]
    fn test_announce_peer_implied_port_uses_source() {
        let h = harness();
        let infohash = [0x11u8; 20];
        let reply = exchange(&h, &announce_msg(&infohash, &infohash[..2], 1, Some(1))).unwrap();
        assert_eq!(bencode::get_bytes(&reply, b"y"), Some(&b"r"[..]));

        let client_port = h.client.local_addr().unwrap().port();
        let observed = h.sink.wait_for(1, Duration::from_secs(2));
        assert_eq!(observed.len(), 1);
        assert_eq!(
            observed[0],
            (infohash, SocketAddr::from(([127, 0, 0, 1], client_port)))
        );
    }

    #[test]
    fn test_announce_peer_bad_token_still_acknowledged() {
        let h = harness();
        let infohash = [0xABu8; 20];
        let reply = exchange(&h, &announce_msg(&infohash, b"no", 6881, None)).unwrap();

        // polite reply, no harvest
        assert_eq!(bencode::get_bytes(&reply, b"y"), Some(&b"r"[..]));
        let observed = h.sink.wait_for(1, Duration::from_millis(300));
        assert!(observed.is_empty());
    }

    #[test]
    fn test_get_peers_reply_masquerades_as_neighborhood() {
        let h = harness();
        let infohash = [0xCDu8; 20];
        let query = bencode::dict(vec![
            (b"t", bencode::bytes(b"gp")),
            (b"y", bencode::bytes(b"q")),
            (b"q", bencode::bytes(b"get_peers")),
            (
                b"a",
                bencode::dict(vec![
                    (b"id", bencode::bytes(&[9u8; 20])),
                    (b"info_hash", bencode::bytes(&infohash)),
                ]),
            ),
        ]);
        let reply = exchange(&h, &query).unwrap();

        assert_eq!(bencode::get_bytes(&reply, b"t"), Some(&b"gp"[..]));
        assert_eq!(bencode::get_bytes(&reply, b"y"), Some(&b"r"[..]));
        let r = bencode::get_dict(&reply, b"r").unwrap();
        assert_eq!(bencode::get_bytes(r, b"nodes"), Some(&b""[..]));
        assert_eq!(bencode::get_bytes(r, b"token"), Some(&infohash[..2]));
        let id = bencode::get_bytes(r, b"id").unwrap();
        assert_eq!(&id[..2], &infohash[..2]);
    }

    #[test]
    fn test_unknown_query_gets_server_error() {
        let h = harness();
        let query = bencode::dict(vec![
            (b"t", bencode::bytes(b"pi")),
            (b"y", bencode::bytes(b"q")),
            (b"q", bencode::bytes(b"ping")),
            (b"a", bencode::dict(vec![(b"id", bencode::bytes(&[9u8; 20]))])),
        ]);
        let reply = exchange(&h, &query).unwrap();

        assert_eq!(bencode::get_bytes(&reply, b"y"), Some(&b"e"[..]));
        let error = bencode::dict_get(&reply, b"e").unwrap();
        let Value::List(items) = error else {
            panic!("error field is not a list");
        };
        assert!(matches!(items[0], Value::Int(202)));
        assert!(matches!(&items[1], Value::Bytes(msg) if msg == b"Server Error"));
    }

    #[test]
    fn test_malformed_packet_is_ignored() {
        let h = harness();
        h.client
            .send_to(b"\xFF\xFE garbage", h.node.local_addr())
            .unwrap();
        // a valid query afterwards still gets served
        let infohash = [0x55u8; 20];
        let reply = exchange(&h, &announce_msg(&infohash, &infohash[..2], 6881, None));
        assert!(reply.is_some());
    }
}
