//! Standalone utility: turn a `.torrent` file into a magnet link by
//! re-encoding its `info` dict canonically and hashing it.

use anyhow::{bail, Context, Result};
use clap::Parser;
use dht_spider::bencode::{self, Value};
use dht_spider::torrent::TorrentInfo;
use dht_spider::utils::hex_lower;
use sha1::{Digest, Sha1};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "magnet",
    version,
    about = "Generate a magnet link from a .torrent file (v1 SHA-1 infohash)"
)]
struct Cli {
    /// Path to the .torrent file
    torrent: PathBuf,
    /// Also print name, size and the leading file entries
    #[clap(long)]
    long: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let raw = fs::read(&args.torrent)
        .with_context(|| format!("reading {}", args.torrent.display()))?;

    let end = bencode::value_end(&raw, 0).context("not a bencoded file")?;
    if end != raw.len() {
        bail!("extra data after torrent bencode");
    }
    let meta = bencode::decode(&raw).context("invalid bencode")?;
    let info = match bencode::dict_get(&meta, b"info") {
        Some(info @ Value::Dict(_)) => info,
        _ => bail!("missing info dict"),
    };

    let info_bytes = bencode::encode(info).context("re-encoding info dict")?;
    let mut hasher = Sha1::new();
    hasher.update(&info_bytes);
    let infohash: [u8; 20] = hasher.finalize().into();

    let mut magnet = format!("magnet:?xt=urn:btih:{}", hex_lower(&infohash));
    if let Some(name) = bencode::get_bytes(info, b"name") {
        if let Ok(name) = std::str::from_utf8(name) {
            magnet.push_str("&dn=");
            magnet.push_str(&urlencoding::encode(name));
        }
    }
    println!("{magnet}");

    if args.long {
        print_summary(info, &meta, &infohash);
    }
    Ok(())
}

fn print_summary(info: &Value, meta: &Value, infohash: &[u8; 20]) {
    let unused = SocketAddr::from(([0, 0, 0, 0], 0));
    let record = TorrentInfo::from_info_dict(info, infohash, unused);
    println!("name: {}", record.name);
    println!("infohash: {}", record.infohash_hex);
    println!("total_bytes: {}", record.total_size);
    if let Some(announce) = bencode::get_bytes(meta, b"announce") {
        println!("announce: {}", String::from_utf8_lossy(announce));
    }
    if !record.files.is_empty() {
        println!("files:");
        for entry in record.files.iter().take(50) {
            println!("  {} {}", entry.length, entry.path.join(" / "));
        }
    }
}
