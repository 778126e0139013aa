// Library crate - exports the signal bridge building blocks

pub mod config;
pub mod dispatch;
pub mod server;
pub mod signal;
pub mod tailer;

// Re-export commonly used types
pub use dispatch::{DispatchConfig, Order, OrderDispatcher};
pub use signal::{parse_signal, Signal, SignalKind, Side};
pub use tailer::{LogEncoding, LogTailer};
