#[macro_use]
pub mod error;          // Error types and the file_error! macro
pub mod config;         // Configuration management
pub mod datalog_writer; // JSON lines readings log
pub mod options;        // Command line options parsing
pub mod poller;         // Per-inverter connect and poll loop
pub mod prelude;        // Common imports and types
pub mod sma;            // SMA Bluetooth protocol stack
pub mod transport;      // Byte streams to the Bluetooth root device
pub mod utils;          // Utility functions

// Get the package version from Cargo.toml
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::datalog_writer::DatalogWriter;
use crate::options::Options;
use crate::poller::Poller;
use crate::prelude::*;

use {anyhow::Result, std::io::Write, tokio::sync::broadcast};

/// Installs the logger. `RUST_LOG` wins over the configured level.
fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("trace");
    let result = env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to initialise logging: {}", e);
    }
    if std::env::var_os("RUST_LOG").is_none() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

fn apply_loglevel(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    match log::LevelFilter::from_str(level) {
        Ok(filter) => log::set_max_level(filter),
        Err(_) => warn!("Unknown log level {}, keeping info", level),
    }
}

/// Main application entry point
///
/// Loads the configuration, starts one poller per enabled inverter and
/// runs until `shutdown_rx` fires or the `--time` limit passes.
pub async fn app(mut shutdown_rx: broadcast::Receiver<()>, options: Options) -> Result<()> {
    init_logging();

    info!("sma-bridge {} starting with config file: {}", CARGO_PKG_VERSION, options.config_file);

    let config = ConfigWrapper::new(options.config_file.clone())?;
    apply_loglevel(&config.loglevel());

    let datalog = match config.datalog_file() {
        Some(path) => Some(DatalogWriter::new(&path)?),
        None => None,
    };

    let (stop_tx, _) = broadcast::channel(1);

    info!("  Creating Poller instances...");
    let mut handles = Vec::new();
    for inverter in config.enabled_inverters() {
        let poller = Poller::new(config.clone(), inverter, datalog.clone(), stop_tx.subscribe());
        handles.push(tokio::spawn(poller.start()));
    }
    info!("{} poller(s) started", handles.len());

    let runtime = async {
        match options.runtime {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = shutdown_rx.recv() => info!("Shutdown signal received, stopping pollers..."),
        _ = runtime => info!("Runtime limit reached, stopping pollers..."),
    }
    let _ = stop_tx.send(());

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Error waiting for poller task: {}", e);
        }
    }

    if let Some(datalog) = &datalog {
        info!("{} datalog lines written", datalog.lines_written());
    }
    info!("Application shutdown complete");
    Ok(())
}
