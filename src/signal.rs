//! Parser for MT5 terminal alert-log lines.
//!
//! Terminal logs are tab-separated with a variable number of leading
//! diagnostic columns, so fields are inferred from the end of the line:
//! the last column is the alert message, the one before it names the
//! indicator that raised it (e.g. `Dark Bands MT5 (BTCUSD,M5)`).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static ARROW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*Alert:\s+(?P<side>Buy|Sell)\s+Arrow\s+(?P<symbol>[A-Z0-9]+)\s+(?P<tf>[A-Z]\d+)\s+(?P<sig_time>\d{1,2}:\d{2})\s*$",
    )
    .unwrap()
});

static DARK_POINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*Alert:\s+Dark Point\s+(?P<symbol>[A-Z0-9]+)\s+(?P<tf>[A-Z]\d+)\s+(?P<sig_date>\d{4}\.\d{2}\.\d{2})\s+(?P<sig_time>\d{1,2}:\d{2})\s+(?P<side>Buy|Sell)\s+Entry\s+at:\s+(?P<price>[0-9]+(?:\.[0-9]+)?)\s*$",
    )
    .unwrap()
});

static SRC_CTX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<src>.+?)\s*\((?P<symbol>[A-Z0-9]+),(?P<tf>[A-Z0-9]+)\)\s*$").unwrap());

/// Time column detector (e.g. `23:45:01.244` or `04:10:00`)
static TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,2}:\d{2}:\d{2}(?:\.\d+)?$").unwrap());

/// Which alert shape produced the signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Arrow,
    DarkPoint,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arrow => "arrow",
            Self::DarkPoint => "dark_point",
        }
    }
}

/// Trade direction extracted from the alert text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Wire-format order type the EA expects
    pub fn as_order_type(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// One structured trading alert extracted from a log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub side: Side,
    pub symbol: String,
    pub timeframe: String,
    /// Intraday time from an Arrow alert (e.g. "23:05")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_time: Option<String>,
    /// Full timestamp from a Dark Point alert ("YYYY-MM-DD H:MM")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_datetime: Option<String>,
    /// Entry price, Dark Point alerts only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    /// The log's own timestamp column, empty if none was found
    pub log_time: String,
    /// Indicator name from the source-context column, empty if unparseable
    pub source: String,
}

impl Signal {
    /// Timestamp to carry into the order comment, whichever shape provided one
    pub fn timestamp(&self) -> &str {
        self.signal_time
            .as_deref()
            .or(self.signal_datetime.as_deref())
            .unwrap_or("")
    }
}

/// Parse a tab-split log line into a signal, tolerant of layout.
///
/// Both of these real layouts are supported by inferring from the end:
/// - `0\tOK\t04:10:00.966\tDark Bands MT5 (BTCUSD,M5)\tAlert: Buy Arrow  XAUUSD M5 23:05`
/// - `0\t23:45:01.244\tDark Bands MT5 (BTCUSD,M1)\tAlert: Sell Arrow  BTCUSD M1 18:44`
///
/// Returns `None` when the line has fewer than three columns or the message
/// matches no known alert shape; that is a skip, not an error.
pub fn parse_signal(cols: &[&str]) -> Option<Signal> {
    if cols.len() < 3 {
        return None;
    }

    let message = cols[cols.len() - 1];
    let src_ctx = cols[cols.len() - 2];

    // First time-like column before the last two becomes the log time
    let log_time = cols[..cols.len() - 2]
        .iter()
        .find(|c| TIME_RE.is_match(c))
        .map(|c| (*c).to_string())
        .unwrap_or_default();

    let source = SRC_CTX_RE
        .captures(src_ctx)
        .map(|m| m["src"].trim().to_string())
        .unwrap_or_default();

    if let Some(m) = ARROW_RE.captures(message) {
        return Some(Signal {
            kind: SignalKind::Arrow,
            side: side_from(&m["side"]),
            symbol: m["symbol"].to_uppercase(),
            timeframe: m["tf"].to_uppercase(),
            signal_time: Some(m["sig_time"].to_string()),
            signal_datetime: None,
            entry_price: None,
            log_time,
            source,
        });
    }

    if let Some(m) = DARK_POINT_RE.captures(message) {
        let entry_price: f64 = m["price"].parse().ok()?;
        // 2025.09.06 -> 2025-09-06 for ISO friendliness
        let datetime = format!("{} {}", m["sig_date"].replace('.', "-"), &m["sig_time"]);
        return Some(Signal {
            kind: SignalKind::DarkPoint,
            side: side_from(&m["side"]),
            symbol: m["symbol"].to_uppercase(),
            timeframe: m["tf"].to_uppercase(),
            signal_time: None,
            signal_datetime: Some(datetime),
            entry_price: Some(entry_price),
            log_time,
            source,
        });
    }

    None
}

fn side_from(raw: &str) -> Side {
    if raw.eq_ignore_ascii_case("buy") {
        Side::Buy
    } else {
        Side::Sell
    }
}
