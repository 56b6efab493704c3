//! wfd-encoderd
//!
//! Runs one encoder for the session described in the config file until
//! Ctrl+C, then stops it.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use wfd_encoderd::config::Config;
use wfd_encoderd::encoder::{EncoderController, EncoderState, SystemBusConnector};
use wfd_encoderd::logging;

fn main() -> Result<()> {
    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|a| a == "--config" || a == "-c")
        .map(|i| {
            args.get(i + 1)
                .map(PathBuf::from)
                .context("--config needs a path")
        })
        .transpose()?;

    let _log_guard = logging::init_logging()?;
    info!("wfd-encoderd starting...");
    info!("Logging to {:?}", logging::get_log_dir()?);

    let config = match &config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded from {:?}", config.config_path());

    // One encoder needs no worker pool
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    // Ctrl+C asks the encoder to stop; a second one is handled the same way
    let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let _ = shutdown_tx.send(());
    })?;

    let result = runtime.block_on(run(config, shutdown_rx));
    if let Err(e) = &result {
        error!("Encoder session failed: {:#}", e);
    }

    info!("Shutdown complete");
    result
}

async fn run(config: Config, mut shutdown_rx: mpsc::UnboundedReceiver<()>) -> Result<()> {
    let encoder = EncoderController::spawn(
        &Handle::current(),
        Arc::new(SystemBusConnector),
        config.encoder.clone(),
        &config.session,
    )
    .context("Failed to spawn encoder")?;

    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    encoder.set_handler(move |_: &EncoderController, state: EncoderState| {
        let _ = state_tx.send(state);
    });

    wait_for_state(&encoder, &mut state_rx, EncoderState::Spawned).await?;
    info!("Encoder is on the bus as {:?}", encoder.bus_name());

    encoder
        .configure(&config.session)
        .await
        .context("Failed to configure encoder")?;
    encoder.start().await.context("Failed to start encoder")?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            state = state_rx.recv() => match state {
                Some(EncoderState::Terminated) | None => {
                    warn!("Encoder terminated on its own");
                    encoder.clear_handler();
                    return Ok(());
                }
                Some(state) => info!("Encoder is now {}", state),
            },
        }
    }

    if let Err(e) = encoder.stop().await {
        warn!("Encoder did not acknowledge Stop: {}", e);
    }
    wait_for_state(&encoder, &mut state_rx, EncoderState::Terminated).await?;
    encoder.clear_handler();

    Ok(())
}

/// Wait until the encoder reaches `target`.
///
/// Fails if it terminates first.
async fn wait_for_state(
    encoder: &EncoderController,
    states: &mut mpsc::UnboundedReceiver<EncoderState>,
    target: EncoderState,
) -> Result<()> {
    loop {
        // The handler may have been installed after the transition
        let current = encoder.state();
        if current == target {
            return Ok(());
        }
        if current == EncoderState::Terminated {
            bail!("Encoder terminated while waiting for {}", target);
        }

        if states.recv().await.is_none() {
            bail!("Encoder state handler went away");
        }
    }
}

fn print_help() {
    println!("wfd-encoderd - Wifi-Display encoder controller");
    println!();
    println!("USAGE:");
    println!("    wfd-encoderd [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help           Print this help message");
    println!("    -c, --config PATH    Use this config file instead of the default");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG                 Set log level (e.g., debug, info, warn)");
    println!("    WFD_ENCODERD_LOG_PATH    Override the log directory");
}
