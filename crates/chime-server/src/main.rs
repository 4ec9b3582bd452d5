//! Chime audio server daemon
//!
//! Loads configuration, brings up the hardware (or the stub device),
//! opens the primary mixed output and, when capture is enabled, the
//! primary input, then parks. Clients attach through the library API;
//! this binary only keeps the server alive and logs a periodic status
//! dump at debug level.
//!
//! ## Command line flags
//!
//! - `--config <path>`: configuration file (default: chime.yaml)
//! - `--dump`: print the server status once after startup

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use chime_core::config::{load_config, ServerConfig};
use chime_core::AudioServer;

fn main() -> Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("chime.yaml"));
    let print_dump = args.iter().any(|a| a == "--dump");

    let config: ServerConfig = load_config(&config_path);
    log::info!(
        "chimed starting: {} Hz, {} frame blocks, {:?} device",
        config.sample_rate,
        config.frame_count,
        config.hal
    );

    let capture = config.capture_allowed;
    let mut server = AudioServer::new(config);
    server
        .open_output()
        .context("failed to open the primary output")?;
    if capture {
        if let Err(e) = server.open_input() {
            log::warn!("no capture available: {}", e);
        }
    }

    if print_dump {
        print!("{}", server.dump());
    }

    log::info!("chimed up");
    loop {
        std::thread::sleep(Duration::from_secs(60));
        log::debug!("status:\n{}", server.dump());
    }
}
