//! Terminal renderer: a status line pinned above a scroll region, scrolling
//! log lines below it, and boxed blocks for discovered torrents.
//!
//! When stdout is not an interactive ANSI terminal (`NO_COLOR`, `TERM=dumb`,
//! redirected output) everything degrades to plain text.

use ansi_term::{Colour, Style};
use console::Term;
use regex::Regex;
use std::io::{self, Write};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

const STATUS_REDRAW_INTERVAL: Duration = Duration::from_millis(20);
const STATUS_MAX_CHARS: usize = 800;
const BOX_MAX_WIDTH: usize = 140;

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("\x1b\\[[0-9;]*m").unwrap())
}

pub fn strip_ansi(text: &str) -> String {
    ansi_re().replace_all(text, "").into_owned()
}

/// Truncate to a display width, keeping ANSI escapes intact and unbilled.
fn truncate_visual(text: &str, max_width: usize) -> String {
    let mut out = String::new();
    let mut width = 0;
    let mut rest = text;
    while !rest.is_empty() {
        if let Some(m) = ansi_re().find(rest) {
            if m.start() == 0 {
                out.push_str(m.as_str());
                rest = &rest[m.end()..];
                continue;
            }
        }
        let Some(ch) = rest.chars().next() else { break };
        let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
        if width + ch_width > max_width {
            break;
        }
        out.push(ch);
        width += ch_width;
        rest = &rest[ch.len_utf8()..];
    }
    out
}

struct LoggerState {
    last_status: String,
    last_redraw: Instant,
    scroll_active: bool,
}

pub struct Logger {
    ansi: bool,
    enable_status: bool,
    status_tag: String,
    state: Mutex<LoggerState>,
}

impl Logger {
    pub fn new(enable_status: bool) -> Logger {
        let logger = Logger {
            ansi: detect_ansi(),
            enable_status,
            status_tag: "[ DHT ]".to_string(),
            state: Mutex::new(LoggerState {
                last_status: String::new(),
                last_redraw: Instant::now(),
                scroll_active: false,
            }),
        };
        if logger.ansi && logger.enable_status {
            let mut state = logger.state.lock().unwrap();
            logger.init_scroll_region_locked(&mut state);
        }
        logger
    }

    /// Repaint the pinned status line. Rate-limited; the latest message is
    /// kept so scrolling output can force a repaint.
    pub fn status(&self, msg: &str) {
        if !self.enable_status {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if self.ansi {
            self.init_scroll_region_locked(&mut state);
        }
        state.last_status = msg.to_string();
        if state.last_redraw.elapsed() < STATUS_REDRAW_INTERVAL {
            return;
        }
        state.last_redraw = Instant::now();
        self.draw_status_locked(&state);
    }

    /// Write one scrolling line, then restore the status line on top.
    pub fn line(&self, text: &str) {
        let state = self.state.lock().unwrap();
        let mut out = io::stdout();
        let _ = writeln!(out, "{text}");
        let _ = out.flush();
        if self.ansi && self.enable_status && !state.last_status.is_empty() {
            self.draw_status_locked(&state);
        }
    }

    pub fn info(&self, text: &str) {
        self.line(&format!("[INFO] {text}"));
    }

    pub fn warn(&self, text: &str) {
        let prefix = self.paint(Colour::Yellow.normal(), "[WARN]");
        self.line(&format!("{prefix} {text}"));
    }

    pub fn error(&self, text: &str) {
        let prefix = self.paint(Colour::Red.normal(), "[ERROR]");
        self.line(&format!("{prefix} {text}"));
    }

    /// Metadata-fetch progress lines.
    pub fn meta(&self, text: &str) {
        let prefix = self.paint(Colour::Cyan.normal(), "[INFO][META]");
        self.line(&format!("{prefix} {text}"));
    }

    /// Boxed summary of one discovered torrent.
    pub fn torrent_block(&self, name: &str, sender: &str, infohash_hex: &str) {
        let dim = Style::new().dimmed();
        let magnet = format!("magnet:?xt=urn:btih:{infohash_hex}");
        let rows = [
            format!("{} {}", self.paint(dim, "BT Name:"), name),
            format!("{} {}", self.paint(dim, "Sender:"), sender),
            format!(
                "{} {}",
                self.paint(dim, "infohash:"),
                self.paint(Colour::Cyan.normal(), infohash_hex)
            ),
            format!(
                "{} {}",
                self.paint(dim, "magnet:"),
                self.paint(Colour::Green.normal(), &magnet)
            ),
        ];
        let title = self.paint(Style::new().bold(), "TORRENT");
        for row in box_lines(&title, &rows) {
            self.line(&row);
        }
    }

    /// Undo the scroll region. Called once on shutdown.
    pub fn restore(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.scroll_active {
            return;
        }
        state.scroll_active = false;
        let mut out = io::stdout();
        let _ = write!(out, "\x1b[r");
        let _ = out.flush();
    }

    fn paint(&self, style: Style, text: &str) -> String {
        if self.ansi {
            style.paint(text).to_string()
        } else {
            text.to_string()
        }
    }

    fn init_scroll_region_locked(&self, state: &mut LoggerState) {
        if state.scroll_active {
            return;
        }
        let (rows, _cols) = Term::stdout().size();
        if rows < 3 {
            return;
        }
        state.scroll_active = true;
        let mut out = io::stdout();
        let _ = write!(out, "\x1b[2;{rows}r\x1b[{rows};1H");
        let _ = out.flush();
    }

    fn draw_status_locked(&self, state: &LoggerState) {
        let line = format!("{} {}", self.status_tag, state.last_status);
        let line: String = line.trim_end().chars().take(STATUS_MAX_CHARS).collect();
        let mut out = io::stdout();
        if self.ansi {
            let painted = Colour::Green.paint(line).to_string();
            let _ = write!(out, "\x1b7\x1b[1;1H\x1b[2K{painted}\x1b8");
        } else {
            let _ = write!(out, "\r{line}");
        }
        let _ = out.flush();
    }
}

fn detect_ansi() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    match std::env::var("TERM") {
        Ok(term) if term.is_empty() || term == "dumb" => return false,
        Err(_) => return false,
        Ok(_) => {}
    }
    console::user_attended()
}

fn box_lines(title: &str, rows: &[String]) -> Vec<String> {
    let title_width = UnicodeWidthStr::width(strip_ansi(title).as_str());
    let rows_width = rows
        .iter()
        .map(|row| UnicodeWidthStr::width(strip_ansi(row).as_str()))
        .max()
        .unwrap_or(0);
    let width = title_width.max(rows_width).min(BOX_MAX_WIDTH);

    let mut out = Vec::with_capacity(rows.len() + 2);
    out.push(format!(
        "┌─ {}{} ─┐",
        title,
        " ".repeat(width.saturating_sub(title_width))
    ));
    for row in rows {
        let truncated = truncate_visual(row, width);
        let pad = width.saturating_sub(UnicodeWidthStr::width(strip_ansi(&truncated).as_str()));
        out.push(format!("│  {}{}  │", truncated, " ".repeat(pad)));
    }
    out.push(format!("└{}┘", "─".repeat(width + 4)));
    out
}
