//! Save Tracker - main entry point
//!
//! Runs the tracker in the foreground until `q` is entered or Ctrl+C.

use clap::error::ErrorKind;
use clap::Parser;
use save_tracker::{Cli, Config, Controller, SystemCaptureGateway};
use std::io::BufRead;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.kind() == ErrorKind::DisplayHelp => {
            print_header();
            e.print()?;
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };

    let config_path = cli.config_path();
    let (mut config, source) = Config::load_with_source(&config_path)?;
    cli.apply_to(&mut config);

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    print_banner(&config);
    info!("Configuration: {}", source);

    let gateway = Arc::new(SystemCaptureGateway::new(config.timing.capture_timeout()));
    let controller = Controller::new(config, gateway)?;

    let shutdown = CancellationToken::new();
    install_exit_triggers(shutdown.clone())?;

    let mut running = controller.start()?;
    info!("YOU CAN TYPE 'q' AND PRESS ENTER ANY TIME TO EXIT");

    running.run_until(shutdown.cancelled()).await;
    running.shutdown().await?;

    Ok(())
}

fn print_header() {
    println!(":::: SAVE TRACKER ::::");
    println!("-------------------------------------");
}

fn print_banner(config: &Config) {
    let tracking = &config.tracking;

    print_header();
    println!("Origin:          {}", tracking.watch_path.display());
    println!("Search pattern:  {}", tracking.watch_pattern);
    println!("Backup path:     {}", tracking.backup_dir().display());
    println!("Backup format:   {}", tracking.naming_format);
    println!("Process name:    {}", tracking.process_name);
    if let Some(size) = tracking.image_size {
        println!("Image size:      {}", size);
    }
    println!("-------------------------------------");
}

/// Cancel `shutdown` on Ctrl+C or when `q` is read from stdin
fn install_exit_triggers(shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || on_signal.cancel())?;

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                    shutdown.cancel();
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Cannot read stdin: {}", e);
                    return;
                }
            }
        }
        debug!("stdin closed, only Ctrl+C will stop the tracker");
    });

    Ok(())
}
