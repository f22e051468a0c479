//! Metadata fetch over the BitTorrent wire protocol.
//!
//! One TCP conversation per `(address, infohash)` pair: plain BitTorrent
//! handshake with the extension bit set, BEP-10 extension handshake to learn
//! the peer's `ut_metadata` id and the metadata size, then one BEP-9 request
//! per 16 KiB piece. The reassembled bytes must SHA-1 to the infohash.
//!
//! Nothing here throws past the entry point: every outcome collapses into a
//! [`FetchStatus`] the dispatcher uses for bookkeeping.

use crate::bencode::{self, Value};
use crate::logger::Logger;
use crate::torrent::TorrentInfo;
use crate::utils::hex_upper;
use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use log::debug;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use sha1::{Digest, Sha1};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const BT_PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const EXT_MSG_ID: u8 = 20;
const EXT_HANDSHAKE_ID: u8 = 0;
const MAX_EXT_HANDSHAKE_LEN: u32 = 2_000_000;

pub const METADATA_PIECE_LEN: usize = 16 * 1024;
pub const MAX_METADATA_PIECES: usize = 4096;

/// Outcome of one fetch attempt. Routed to the dispatcher, never thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Ok,
    HandshakeFail,
    ExtFail,
    BadPieces,
    NoPieces,
    Sha1Mismatch,
    Timeout,
    OsError,
    Exception,
}

impl FetchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchStatus::Ok => "ok",
            FetchStatus::HandshakeFail => "handshake_fail",
            FetchStatus::ExtFail => "ext_fail",
            FetchStatus::BadPieces => "bad_pieces",
            FetchStatus::NoPieces => "no_pieces",
            FetchStatus::Sha1Mismatch => "sha1_mismatch",
            FetchStatus::Timeout => "timeout",
            FetchStatus::OsError => "os_error",
            FetchStatus::Exception => "exception",
        }
    }

    /// Failures that indict the address itself rather than the payload.
    pub fn damages_reputation(self) -> bool {
        matches!(self, FetchStatus::Timeout | FetchStatus::OsError)
    }
}

/// Where validated torrents go. An error here surfaces as
/// [`FetchStatus::Exception`] for the attempt.
pub trait StorageSink: Send + Sync {
    fn store(&self, info: &TorrentInfo, torrent_bytes: &[u8], address: SocketAddr) -> Result<()>;
}

pub fn fetch_metadata(
    address: SocketAddr,
    infohash: &[u8; 20],
    random_id: fn() -> [u8; 20],
    sink: &dyn StorageSink,
    logger: &Logger,
    timeout: Duration,
) -> FetchStatus {
    let hid = hex_upper(infohash);
    match fetch_inner(address, infohash, &hid, random_id, sink, logger, timeout) {
        Ok(status) => status,
        Err(err) => {
            let status = classify_error(&err);
            logger.meta(&format!("{} {hid} {address} {err:#}", status.as_str()));
            status
        }
    }
}

fn classify_error(err: &anyhow::Error) -> FetchStatus {
    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return match io_err.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FetchStatus::Timeout,
                _ => FetchStatus::OsError,
            };
        }
    }
    FetchStatus::Exception
}

fn fetch_inner(
    address: SocketAddr,
    infohash: &[u8; 20],
    hid: &str,
    random_id: fn() -> [u8; 20],
    sink: &dyn StorageSink,
    logger: &Logger,
    timeout: Duration,
) -> Result<FetchStatus> {
    logger.meta(&format!("connect {hid} {address}"));
    let mut wire = PeerWire::connect(address, timeout)?;

    // 1. BitTorrent handshake, extension-protocol bit set.
    wire.send_all(&handshake_frame(infohash, &random_id()))?;
    let reply = wire.recv_exact(68)?;
    if !check_handshake(&reply, infohash) {
        logger.meta(&format!("handshake_fail {hid} {address}"));
        return Ok(FetchStatus::HandshakeFail);
    }

    // 2. Extension handshake: we advertise ut_metadata, the peer tells us its
    //    id for it and the metadata size.
    let hello = bencode::dict(vec![(
        b"m",
        bencode::dict(vec![(b"ut_metadata", bencode::int(1))]),
    )]);
    let payload = bencode::encode(&hello).ok_or_else(|| anyhow!("encoding ext handshake"))?;
    wire.send_all(&ext_message(EXT_HANDSHAKE_ID, &payload))?;

    let (ut_metadata, metadata_size) = match recv_ext_handshake(&mut wire, hid, address, logger)? {
        Some(pair) => pair,
        None => return Ok(FetchStatus::ExtFail),
    };

    let pieces = piece_count(metadata_size);
    if pieces == 0 || pieces > MAX_METADATA_PIECES {
        logger.meta(&format!(
            "bad_pieces {hid} {address} size {metadata_size} pieces {pieces}"
        ));
        return Ok(FetchStatus::BadPieces);
    }

    // 3. Pull each piece. Peers stream the reply without a framing cue we can
    //    rely on, so drain until the line goes quiet and split afterwards.
    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(pieces);
    for piece in 0..pieces {
        let request = bencode::dict(vec![
            (b"msg_type", bencode::int(0)),
            (b"piece", bencode::int(piece as i64)),
        ]);
        let payload = bencode::encode(&request).ok_or_else(|| anyhow!("encoding piece request"))?;
        wire.send_all(&ext_message(ut_metadata, &payload))?;

        let blob = wire.recv_until_idle();
        if blob.is_empty() {
            continue;
        }
        match extract_piece_data(&blob, piece) {
            Some(data) => parts.push(data),
            None => debug!("piece {piece} of {hid}: unrecognized framing, skipped"),
        }
    }

    if parts.is_empty() {
        logger.meta(&format!(
            "no_pieces {hid} {address} size {metadata_size} pieces {pieces}"
        ));
        return Ok(FetchStatus::NoPieces);
    }

    // 4. Verify and hand off.
    let metadata = parts.concat();
    let mut hasher = Sha1::new();
    hasher.update(&metadata);
    let digest: [u8; 20] = hasher.finalize().into();
    if digest != *infohash {
        logger.meta(&format!("sha1_mismatch {hid} {address}"));
        return Ok(FetchStatus::Sha1Mismatch);
    }

    let info_dict = bencode::decode(&metadata)
        .ok_or_else(|| anyhow!("verified metadata is not a bencoded dict"))?;

    let mut torrent_bytes = Vec::with_capacity(metadata.len() + 8);
    torrent_bytes.extend_from_slice(b"d4:info");
    torrent_bytes.extend_from_slice(&metadata);
    torrent_bytes.push(b'e');

    let record = TorrentInfo::from_info_dict(&info_dict, infohash, address);
    // A sink failure is our problem, not the peer's; keep it off the
    // reputation books.
    if let Err(err) = sink.store(&record, &torrent_bytes, address) {
        logger.meta(&format!("exception {hid} {address} {err:#}"));
        return Ok(FetchStatus::Exception);
    }
    logger.meta(&format!("saved {hid} {address}"));
    Ok(FetchStatus::Ok)
}

fn recv_ext_handshake(
    wire: &mut PeerWire,
    hid: &str,
    address: SocketAddr,
    logger: &Logger,
) -> Result<Option<(u8, i64)>> {
    let prefix = wire.recv_exact(4)?;
    if prefix.len() != 4 {
        logger.meta(&format!("ext_fail {hid} {address} reason no_len_prefix"));
        return Ok(None);
    }
    let msg_len = BigEndian::read_u32(&prefix);
    if msg_len == 0 || msg_len > MAX_EXT_HANDSHAKE_LEN {
        logger.meta(&format!("ext_fail {hid} {address} reason bad_len {msg_len}"));
        return Ok(None);
    }
    let body = wire.recv_exact(msg_len as usize)?;
    if body.len() != msg_len as usize {
        logger.meta(&format!(
            "ext_fail {hid} {address} reason short_body got {} want {msg_len}",
            body.len()
        ));
        return Ok(None);
    }
    if body.len() < 2 || body[0] != EXT_MSG_ID || body[1] != EXT_HANDSHAKE_ID {
        logger.meta(&format!("ext_fail {hid} {address} reason not_ext_handshake"));
        return Ok(None);
    }

    // Tolerate trailing bytes after the handshake dict.
    let handshake = bencode::value_end(&body[2..], 0)
        .and_then(|end| bencode::decode(&body[2..2 + end]));
    let Some(handshake) = handshake else {
        logger.meta(&format!("ext_fail {hid} {address} reason parse_fail"));
        return Ok(None);
    };

    let ut_metadata = bencode::get_dict(&handshake, b"m")
        .and_then(|m| bencode::get_int(m, b"ut_metadata"));
    let metadata_size = bencode::get_int(&handshake, b"metadata_size");
    match (ut_metadata, metadata_size) {
        (Some(ut), Some(size)) if (1..=255).contains(&ut) => Ok(Some((ut as u8, size))),
        _ => {
            logger.meta(&format!("ext_fail {hid} {address} reason missing_fields"));
            Ok(None)
        }
    }
}

pub fn piece_count(metadata_size: i64) -> usize {
    if metadata_size <= 0 {
        return 0;
    }
    let piece_len = METADATA_PIECE_LEN as i64;
    ((metadata_size + piece_len - 1) / piece_len) as usize
}

fn handshake_frame(infohash: &[u8; 20], peer_id: &[u8; 20]) -> [u8; 68] {
    let mut frame = [0u8; 68];
    frame[0] = BT_PROTOCOL.len() as u8;
    frame[1..20].copy_from_slice(BT_PROTOCOL);
    frame[25] = 0x10; // reserved bit: extension protocol (BEP-10)
    frame[28..48].copy_from_slice(infohash);
    frame[48..68].copy_from_slice(peer_id);
    frame
}

/// The peer must mirror protocol string and infohash. Its reserved bits are
/// not checked; only a failed extension handshake sinks the fetch.
fn check_handshake(frame: &[u8], infohash: &[u8; 20]) -> bool {
    frame.len() == 68
        && frame[0] as usize == BT_PROTOCOL.len()
        && &frame[1..20] == BT_PROTOCOL
        && &frame[28..48] == infohash
}

/// Length-prefixed extension message: `<len><0x14><ext id><payload>`.
fn ext_message(ext_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(6 + payload.len());
    msg.extend_from_slice(&((payload.len() + 2) as u32).to_be_bytes());
    msg.push(EXT_MSG_ID);
    msg.push(ext_id);
    msg.extend_from_slice(payload);
    msg
}

/// Split the piece bytes out of a drained reply. The `"ee"` marker shortcut
/// covers the common `{msg_type, piece, total_size}` header; the bencode scan
/// handles everything else.
fn extract_piece_data(blob: &[u8], piece: usize) -> Option<Vec<u8>> {
    if let Some(idx) = find_subslice(blob, b"ee") {
        return Some(blob[idx + 2..].to_vec());
    }
    let (header, tail) = bencode::split_framed_dict(blob)?;
    if bencode::get_int(&header, b"msg_type")? != 1 {
        return None;
    }
    if bencode::get_int(&header, b"piece")? != piece as i64 {
        return None;
    }
    Some(tail.to_vec())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// One polled non-blocking TCP conversation.
struct PeerWire {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    timeout: Duration,
}

impl PeerWire {
    fn connect(address: SocketAddr, timeout: Duration) -> io::Result<PeerWire> {
        let mut stream = TcpStream::connect(address)?;
        let poll = Poll::new()?;
        poll.registry().register(
            &mut stream,
            Token(0),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let mut wire = PeerWire {
            stream,
            poll,
            events: Events::with_capacity(8),
            timeout,
        };
        wire.wait_connected()?;
        Ok(wire)
    }

    fn wait_connected(&mut self) -> io::Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            self.poll_until(deadline)?;
            if let Some(err) = self.stream.take_error()? {
                return Err(err);
            }
            match self.stream.peer_addr() {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => continue,
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn poll_until(&mut self, deadline: Instant) -> io::Result<()> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(io::ErrorKind::TimedOut.into());
            }
            self.poll.poll(&mut self.events, Some(deadline - now))?;
            if !self.events.is_empty() {
                return Ok(());
            }
        }
    }

    fn send_all(&mut self, data: &[u8]) -> io::Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut written = 0;
        while written < data.len() {
            match self.stream.write(&data[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.poll_until(deadline)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read exactly `n` bytes, or fewer if the peer closes first. Errors with
    /// `TimedOut` when the deadline passes while waiting; callers treat a
    /// short result as a protocol failure.
    fn recv_exact(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = BytesMut::with_capacity(n.min(64 * 1024));
        let mut chunk = [0u8; 4096];
        while buf.len() < n {
            let want = (n - buf.len()).min(chunk.len());
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(got) => buf.extend_from_slice(&chunk[..got]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.poll_until(deadline)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(buf.to_vec())
    }

    /// Accumulate whatever the peer streams for one piece. Stops `timeout`
    /// after the last byte once data has arrived, `2 × timeout` after the
    /// drain began, or at EOF. Socket errors end the drain rather than the
    /// fetch; the caller judges the bytes it got.
    fn recv_until_idle(&mut self) -> Vec<u8> {
        let start = Instant::now();
        let mut last_data = start;
        let mut total = BytesMut::new();
        let mut chunk = [0u8; 4096];
        loop {
            let now = Instant::now();
            if !total.is_empty() && now.duration_since(last_data) > self.timeout {
                break;
            }
            if now.duration_since(start) > self.timeout * 2 {
                break;
            }
            let _ = self
                .poll
                .poll(&mut self.events, Some(Duration::from_millis(50)));
            loop {
                match self.stream.read(&mut chunk) {
                    Ok(0) => return total.to_vec(),
                    Ok(got) => {
                        total.extend_from_slice(&chunk[..got]);
                        last_data = Instant::now();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => return total.to_vec(),
                }
            }
        }
        total.to_vec()
    }
}
