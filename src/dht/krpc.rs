//! BEP-5 KRPC message construction and the compact node codec.

use crate::bencode::{self, Value};
use byteorder::{BigEndian, ByteOrder};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Bytes per entry in a compact node list: 20-byte id, 4-byte IPv4, 2-byte port.
pub const COMPACT_NODE_LEN: usize = 26;

/// A remote DHT node learned from a `find_node` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KNode {
    pub id: [u8; 20],
    pub addr: SocketAddrV4,
}

/// Decode a compact node list. Anything that is not a whole number of
/// entries is rejected outright.
pub fn decode_nodes(raw: &[u8]) -> Vec<KNode> {
    if raw.len() % COMPACT_NODE_LEN != 0 {
        return Vec::new();
    }
    let mut nodes = Vec::with_capacity(raw.len() / COMPACT_NODE_LEN);
    for chunk in raw.chunks_exact(COMPACT_NODE_LEN) {
        let mut id = [0u8; 20];
        id.copy_from_slice(&chunk[..20]);
        let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = BigEndian::read_u16(&chunk[24..26]);
        nodes.push(KNode {
            id,
            addr: SocketAddrV4::new(ip, port),
        });
    }
    nodes
}

/// Synthesize an id sharing `prefix` leading bytes with `target` and keeping
/// our own tail. Presenting such ids makes remote routing tables file us next
/// to `target`, so traffic for that neighborhood lands here.
pub fn neighbor_id(target: &[u8], own_id: &[u8; 20], prefix: usize) -> [u8; 20] {
    let mut id = *own_id;
    let n = prefix.min(target.len()).min(id.len());
    id[..n].copy_from_slice(&target[..n]);
    id
}

pub fn find_node_query(tid: &[u8], id: &[u8; 20], target: &[u8; 20]) -> Value {
    bencode::dict(vec![
        (b"t", bencode::bytes(tid)),
        (b"y", bencode::bytes(b"q")),
        (b"q", bencode::bytes(b"find_node")),
        (
            b"a",
            bencode::dict(vec![
                (b"id", bencode::bytes(id)),
                (b"target", bencode::bytes(target)),
            ]),
        ),
    ])
}

/// Reply to `get_peers`: deliberately empty `nodes` (we never want to be
/// queried as a router, only reachable), token echoing the infohash prefix.
pub fn get_peers_reply(tid: &[u8], id: &[u8; 20], token: &[u8]) -> Value {
    bencode::dict(vec![
        (b"t", bencode::bytes(tid)),
        (b"y", bencode::bytes(b"r")),
        (
            b"r",
            bencode::dict(vec![
                (b"id", bencode::bytes(id)),
                (b"nodes", bencode::bytes(b"")),
                (b"token", bencode::bytes(token)),
            ]),
        ),
    ])
}

pub fn announce_ok_reply(tid: &[u8], id: &[u8; 20]) -> Value {
    bencode::dict(vec![
        (b"t", bencode::bytes(tid)),
        (b"y", bencode::bytes(b"r")),
        (b"r", bencode::dict(vec![(b"id", bencode::bytes(id))])),
    ])
}

pub fn server_error_reply(tid: &[u8]) -> Value {
    bencode::dict(vec![
        (b"t", bencode::bytes(tid)),
        (b"y", bencode::bytes(b"e")),
        (
            b"e",
            Value::List(vec![Value::Int(202), bencode::bytes(b"Server Error")]),
        ),
    ])
}
