//! Where validated torrents end up: the append-only text log and the
//! `BT/` directory of reconstructed `.torrent` files.

use crate::logger::Logger;
use crate::metadata::StorageSink;
use crate::torrent::TorrentInfo;
use crate::utils::safe_filename;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// How many file entries a log block lists before cutting off.
const LOG_FILE_LIMIT: usize = 10;

pub struct OutputConfig {
    /// `None` means print-only: nothing is persisted.
    pub log_path: Option<PathBuf>,
    pub save_torrents: bool,
    pub torrent_dir: PathBuf,
}

pub struct OutputSink {
    cfg: OutputConfig,
    logger: Arc<Logger>,
    /// Infohashes already written this run.
    written: Mutex<HashSet<String>>,
}

impl OutputSink {
    pub fn new(cfg: OutputConfig, logger: Arc<Logger>) -> Result<OutputSink> {
        if cfg.log_path.is_some() && cfg.save_torrents {
            fs::create_dir_all(&cfg.torrent_dir)
                .with_context(|| format!("creating {}", cfg.torrent_dir.display()))?;
        }
        Ok(OutputSink {
            cfg,
            logger,
            written: Mutex::new(HashSet::new()),
        })
    }

    fn write_log_block(&self, info: &TorrentInfo, sender: &str) -> Result<()> {
        let Some(log_path) = &self.cfg.log_path else {
            return Ok(());
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("opening {}", log_path.display()))?;
        writeln!(file, "BT Name:{}", info.name)?;
        writeln!(file, "Sender:{sender}")?;
        writeln!(file, "infohash:{}", info.infohash_hex)?;
        writeln!(file, "{}", info.magnet())?;
        for entry in info.files.iter().take(LOG_FILE_LIMIT) {
            let first = entry.path.first().map(String::as_str).unwrap_or("");
            writeln!(file, "   {} {}", first, entry.length)?;
        }
        writeln!(file)?;
        writeln!(file)?;
        Ok(())
    }

    fn write_torrent_file(&self, info: &TorrentInfo, torrent_bytes: &[u8]) -> Result<()> {
        if self.cfg.log_path.is_none() || !self.cfg.save_torrents {
            return Ok(());
        }
        let name = safe_filename(info.name.trim(), &info.infohash_hex);
        let path = self.cfg.torrent_dir.join(format!("{name}.torrent"));
        fs::write(&path, torrent_bytes)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

impl StorageSink for OutputSink {
    fn store(&self, info: &TorrentInfo, torrent_bytes: &[u8], address: SocketAddr) -> Result<()> {
        {
            let mut written = self.written.lock().unwrap();
            if !written.insert(info.infohash_hex.clone()) {
                return Ok(());
            }
        }

        let sender = address.to_string();
        self.logger
            .torrent_block(&info.name, &sender, &info.infohash_hex);
        for entry in info.files.iter().take(LOG_FILE_LIMIT) {
            let first = entry.path.first().map(String::as_str).unwrap_or("");
            self.logger.line(&format!("   {} {}", first, entry.length));
        }

        self.write_log_block(info, &sender)?;
        self.write_torrent_file(info, torrent_bytes)?;
        Ok(())
    }
}
