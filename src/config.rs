//! Configuration surface: every knob is a flag or an FX_* environment
//! variable, with `.env` loaded by the binary before parsing.

use std::collections::HashSet;
use std::path::PathBuf;

use clap::Parser;

use crate::dispatch::{AtrParams, DispatchConfig};
use crate::tailer::LogEncoding;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// Port for the order gateway
    #[arg(long, env = "FX_MARKET_PORT", default_value = "12301")]
    pub port: u16,

    /// Path to the MT5 terminal log to tail
    #[arg(long, env = "FX_LOG_PATH", default_value = "20250906.log")]
    pub log_path: PathBuf,

    /// Text encoding of the log file
    #[arg(long, env = "FX_LOG_ENCODING", default_value = "utf-16-le")]
    pub log_encoding: LogEncoding,

    /// Lot size for market orders built from signals
    #[arg(long, env = "FX_DEFAULT_VOLUME", default_value = "0.01")]
    pub default_volume: f64,

    /// Magic number stamped on every order
    #[arg(long, env = "FX_MAGIC_NUMBER", default_value = "987654")]
    pub magic_number: i64,

    /// Defer SL/TP to the EA's ATR computation (on/off)
    #[arg(long, env = "FX_ATR_MODE", default_value = "on", value_parser = parse_switch, action = clap::ArgAction::Set)]
    pub atr_mode: bool,

    /// ATR lookback period
    #[arg(long, env = "FX_ATR_PERIOD", default_value = "14")]
    pub atr_period: u32,

    /// ATR multiplier for the stop loss
    #[arg(long, env = "FX_ATR_MULT_SL", default_value = "2.0")]
    pub atr_mult_sl: f64,

    /// ATR multiplier for the take profit
    #[arg(long, env = "FX_ATR_MULT_TP", default_value = "3.0")]
    pub atr_mult_tp: f64,

    /// Comma-separated symbol allow-list; empty allows every symbol
    #[arg(long, env = "FX_SYMBOLS", default_value = "")]
    pub symbols: String,

    /// Process existing log content before tailing (on/off)
    #[arg(long, env = "FX_TAIL_FROM_BEGINNING", default_value = "off", value_parser = parse_switch, action = clap::ArgAction::Set)]
    pub from_beginning: bool,

    /// Log file diagnostics before tailing starts (on/off)
    #[arg(long, env = "FX_PROBE_ON_START", default_value = "on", value_parser = parse_switch, action = clap::ArgAction::Set)]
    pub probe_on_start: bool,
}

impl Config {
    /// Uppercased allow-list, or `None` when the knob is empty
    pub fn symbol_filter(&self) -> Option<HashSet<String>> {
        let set: HashSet<String> = self
            .symbols
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_uppercase)
            .collect();
        if set.is_empty() {
            None
        } else {
            Some(set)
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            default_volume: self.default_volume,
            magic_number: self.magic_number,
            atr: self.atr_mode.then(|| AtrParams {
                period: self.atr_period,
                mult_sl: self.atr_mult_sl,
                mult_tp: self.atr_mult_tp,
            }),
            symbol_filter: self.symbol_filter(),
        }
    }
}

/// Accepts the usual on/off spellings so env values like `FX_ATR_MODE=yes` work
fn parse_switch(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(format!("expected on/off, got {other:?}")),
    }
}
