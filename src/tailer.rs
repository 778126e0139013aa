//! Tails a rotating MT5 terminal log and yields decoded lines.
//!
//! The terminal writes UTF-16LE without a byte-order mark and swaps the file
//! out daily, so the tailer decodes incrementally from a shared binary read
//! and watches file identity and size to catch rotation and truncation.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const REOPEN_DEBOUNCE: Duration = Duration::from_millis(200);
const READ_CHUNK: usize = 8192;

/// Text encoding of the tailed log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEncoding {
    Utf16Le,
    Utf16Be,
    Utf8,
}

impl std::str::FromStr for LogEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf-16" | "utf16" | "utf-16-le" | "utf16le" | "utf-16le" => Ok(Self::Utf16Le),
            "utf-16-be" | "utf16be" | "utf-16be" => Ok(Self::Utf16Be),
            "utf-8" | "utf8" | "utf-8-sig" | "utf8sig" => Ok(Self::Utf8),
            other => Err(format!("unsupported log encoding: {other}")),
        }
    }
}

impl std::fmt::Display for LogEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Utf16Le => write!(f, "utf-16-le"),
            Self::Utf16Be => write!(f, "utf-16-be"),
            Self::Utf8 => write!(f, "utf-8"),
        }
    }
}

/// Incremental decoder that buffers partial code units between reads and
/// hands out complete lines. A BOM at stream start is consumed, never required.
struct LineDecoder {
    encoding: LogEncoding,
    carry: Vec<u8>,
    pending_lead: Option<u16>,
    text: String,
    at_start: bool,
}

impl LineDecoder {
    fn new(encoding: LogEncoding) -> Self {
        Self {
            encoding,
            carry: Vec::new(),
            pending_lead: None,
            text: String::new(),
            at_start: true,
        }
    }

    /// Drop partial decode state after a reopen. Complete lines have already
    /// been popped by then; only an unterminated tail can be lost.
    fn reset(&mut self, at_start: bool) {
        self.carry.clear();
        self.pending_lead = None;
        self.text.clear();
        self.at_start = at_start;
    }

    fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.carry.extend_from_slice(bytes);
        match self.encoding {
            LogEncoding::Utf8 => self.decode_utf8()?,
            LogEncoding::Utf16Le | LogEncoding::Utf16Be => self.decode_utf16()?,
        }
        if self.at_start && !self.text.is_empty() {
            if self.text.starts_with('\u{feff}') {
                self.text.remove(0);
            }
            self.at_start = false;
        }
        Ok(())
    }

    fn decode_utf8(&mut self) -> Result<()> {
        match std::str::from_utf8(&self.carry) {
            Ok(s) => {
                self.text.push_str(s);
                self.carry.clear();
            }
            Err(e) => {
                if e.error_len().is_some() {
                    bail!("invalid UTF-8 at byte {} of read chunk", e.valid_up_to());
                }
                // Incomplete trailing sequence, keep it for the next read
                let valid = e.valid_up_to();
                let s = std::str::from_utf8(&self.carry[..valid])?;
                self.text.push_str(s);
                self.carry.drain(..valid);
            }
        }
        Ok(())
    }

    fn decode_utf16(&mut self) -> Result<()> {
        let usable = self.carry.len() & !1;
        let mut units = Vec::with_capacity(usable / 2 + 1);
        if let Some(lead) = self.pending_lead.take() {
            units.push(lead);
        }
        for pair in self.carry[..usable].chunks_exact(2) {
            let unit = match self.encoding {
                LogEncoding::Utf16Be => u16::from_be_bytes([pair[0], pair[1]]),
                _ => u16::from_le_bytes([pair[0], pair[1]]),
            };
            units.push(unit);
        }
        self.carry.drain(..usable);

        let mut i = 0;
        while i < units.len() {
            let unit = units[i];
            if (0xD800..0xDC00).contains(&unit) {
                if i + 1 == units.len() {
                    // Lead surrogate split across reads
                    self.pending_lead = Some(unit);
                    break;
                }
                let trail = units[i + 1];
                if !(0xDC00..0xE000).contains(&trail) {
                    bail!("invalid UTF-16: unpaired lead surrogate {unit:#06x}");
                }
                let cp = 0x10000 + (((unit as u32 - 0xD800) << 10) | (trail as u32 - 0xDC00));
                if let Some(c) = char::from_u32(cp) {
                    self.text.push(c);
                }
                i += 2;
            } else if (0xDC00..0xE000).contains(&unit) {
                bail!("invalid UTF-16: unpaired trail surrogate {unit:#06x}");
            } else {
                if let Some(c) = char::from_u32(unit as u32) {
                    self.text.push(c);
                }
                i += 1;
            }
        }
        Ok(())
    }

    /// Next complete line, with the `\r\n` / `\n` terminator stripped
    fn pop_line(&mut self) -> Option<String> {
        let pos = self.text.find('\n')?;
        let mut line: String = self.text.drain(..=pos).collect();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    /// Unterminated trailing text, for the one-shot reader
    fn take_remainder(&mut self) -> Option<String> {
        if self.text.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.text))
        }
    }
}

/// Live tail over a growing, rotating log file.
///
/// `next_line` never terminates on its own: a missing file means "no data
/// yet" and rotation/truncation triggers a reopen. Only unexpected I/O or
/// decode failures return an error, which the owning task should log.
pub struct LogTailer {
    path: PathBuf,
    encoding: LogEncoding,
    from_beginning: bool,
    file: Option<File>,
    offset: u64,
    file_id: Option<u64>,
    decoder: LineDecoder,
    opened_once: bool,
    buf: Vec<u8>,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, encoding: LogEncoding, from_beginning: bool) -> Self {
        Self {
            path: path.into(),
            encoding,
            from_beginning,
            file: None,
            offset: 0,
            file_id: None,
            decoder: LineDecoder::new(encoding),
            opened_once: false,
            buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Wait for and return the next decoded line appended to the log.
    pub async fn next_line(&mut self) -> Result<String> {
        loop {
            if let Some(line) = self.decoder.pop_line() {
                return Ok(line);
            }

            if self.file.is_none() && !self.open_file().await? {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
            let Some(file) = self.file.as_mut() else {
                continue;
            };

            let n = file
                .read(&mut self.buf)
                .await
                .with_context(|| format!("reading {}", self.path.display()))?;
            if n > 0 {
                self.offset += n as u64;
                self.decoder.push(&self.buf[..n])?;
                continue;
            }

            // At EOF on the current handle: look for rotation or truncation
            match tokio::fs::metadata(&self.path).await {
                Ok(meta) => {
                    let identity_changed = match (self.file_id, file_identity(&meta)) {
                        (Some(old), Some(new)) => old != new,
                        _ => false,
                    };
                    if identity_changed || meta.len() < self.offset {
                        warn!("log rotated or truncated, reopening {}", self.path.display());
                        self.file = None;
                        tokio::time::sleep(REOPEN_DEBOUNCE).await;
                        continue;
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    // Producer may be mid-rotation; drop the handle and re-poll
                    self.file = None;
                    tokio::time::sleep(REOPEN_DEBOUNCE).await;
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("stat {}", self.path.display()));
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Open (or reopen) the log. Returns false when the file does not exist
    /// yet. `from_beginning` applies only to the very first open; any reopen
    /// resumes from the new end of file.
    async fn open_file(&mut self) -> Result<bool> {
        let mut file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("opening {}", self.path.display())),
        };
        let meta = file
            .metadata()
            .await
            .with_context(|| format!("stat {}", self.path.display()))?;

        if self.opened_once || !self.from_beginning {
            // The file can grow between the stat and the seek; trust the
            // position the seek reports, not the earlier metadata
            self.offset = file
                .seek(SeekFrom::End(0))
                .await
                .with_context(|| format!("seeking to end of {}", self.path.display()))?;
        } else {
            self.offset = 0;
        }

        self.file_id = file_identity(&meta);
        self.decoder.reset(self.offset == 0);
        self.opened_once = true;
        self.file = Some(file);
        Ok(true)
    }
}

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> Option<u64> {
    // No stable identity available; truncation is still caught by size
    None
}

/// Decode every line currently in the file and return them. One-shot
/// inspection only; an unterminated final line is included as-is.
pub async fn read_lines_once(path: &Path, encoding: LogEncoding) -> Result<Vec<String>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut decoder = LineDecoder::new(encoding);
    decoder.push(&bytes)?;
    let mut lines = Vec::new();
    while let Some(line) = decoder.pop_line() {
        lines.push(line);
    }
    if let Some(rest) = decoder.take_remainder() {
        lines.push(rest);
    }
    Ok(lines)
}

/// Log what the tailer is about to work with: existence, size, a hex peek at
/// the first bytes, and the first decoded line. Diagnostics only.
pub async fn probe(path: &Path, encoding: LogEncoding) {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(_) => {
            info!("probe: {} does not exist yet", path.display());
            return;
        }
    };
    info!("probe: size={}", meta.len());

    let mut head = vec![0u8; 64];
    let n = match File::open(path).await {
        Ok(mut f) => match f.read(&mut head).await {
            Ok(n) => n,
            Err(e) => {
                warn!("probe: read failed: {e}");
                return;
            }
        },
        Err(e) => {
            warn!("probe: open failed: {e}");
            return;
        }
    };
    let hex: Vec<String> = head[..n].iter().map(|b| format!("{b:02x}")).collect();
    info!("probe: raw head: {}", hex.join(" "));

    let mut decoder = LineDecoder::new(encoding);
    match decoder.push(&head[..n]) {
        Ok(()) => {
            let first = decoder.pop_line().or_else(|| decoder.take_remainder());
            info!("probe: decoded first line: {:?}", first.unwrap_or_default());
        }
        Err(e) => warn!("probe: decode failed: {e}"),
    }
}
