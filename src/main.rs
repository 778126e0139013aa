use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, info};

use fx_signal_bridge::config::Config;
use fx_signal_bridge::dispatch::OrderDispatcher;
use fx_signal_bridge::tailer::{self, LogTailer};
use fx_signal_bridge::{server, signal};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fx_signal_bridge=info".parse().unwrap()),
        )
        .init();

    let config = Config::parse();

    info!("Starting FX signal bridge");
    info!("Port: {}", config.port);
    info!(
        "Log: {} (encoding={}, from_beginning={})",
        config.log_path.display(),
        config.log_encoding,
        config.from_beginning
    );
    info!("ATR mode: {}", if config.atr_mode { "on" } else { "off" });
    if let Some(filter) = config.symbol_filter() {
        info!("Symbol allow-list: {:?}", filter);
    }

    let dispatcher = Arc::new(OrderDispatcher::new(config.dispatch_config()));

    // Spawn the log tailing task; the HTTP surface keeps serving even if it
    // dies, so its failure has to be loud.
    let tail_config = config.clone();
    let tail_dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        if let Err(e) = run_signal_tail(tail_config, tail_dispatcher).await {
            error!("Signal tailer error: {e:#}");
        }
    });

    let app = server::router(dispatcher);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Market server running on port {}", config.port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Tail the terminal log forever, feeding parsed signals to the dispatcher
async fn run_signal_tail(config: Config, dispatcher: Arc<OrderDispatcher>) -> Result<()> {
    info!("Tailing log for signals: {}", config.log_path.display());

    if config.probe_on_start {
        tailer::probe(&config.log_path, config.log_encoding).await;
    }

    let mut tailer = LogTailer::new(&config.log_path, config.log_encoding, config.from_beginning);
    loop {
        let line = tailer.next_line().await?;
        debug!("tail: {line}");

        let cols: Vec<&str> = line.split('\t').collect();
        let Some(sig) = signal::parse_signal(&cols) else {
            debug!("no signal match");
            continue;
        };
        debug!("parsed signal: {sig:?}");
        dispatcher.enqueue_from_signal(&sig).await;
    }
}
