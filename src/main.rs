//! wayveil — input anonymization daemon for wlroots compositors.
//!
//! Entry point: argument handling, logging, privilege check, startup
//! delay, then the engine's event loop. The only normal exit is the
//! escape combo (code 0); every other exit path is a fatal error
//! reported on stderr (code 1).

use std::process::ExitCode;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tracing::info;

use wayveil::config::{Args, Config};
use wayveil::engine;

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    let _ = err.print();
                    ExitCode::SUCCESS
                }
                _ => {
                    eprintln!("FATAL ERROR: {err}");
                    let _ = Args::command().print_help();
                    ExitCode::FAILURE
                }
            };
        }
    };

    init_logging(args.verbose);
    info!(
        "wayveil v{} ({} {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_DATE")
    );

    if !nix::unistd::getuid().is_root() {
        eprintln!("FATAL ERROR: must be run as root to grab input devices");
        return ExitCode::FAILURE;
    }

    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("FATAL ERROR: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    // Let the Wayland session settle before exclusive-grabbing devices;
    // grabbing during session startup can wedge the compositor's own
    // input setup.
    if config.startup_delay > 0 {
        std::thread::sleep(Duration::from_millis(config.startup_delay));
    }

    match engine::run(config) {
        Ok(()) => {
            info!("terminated by escape key combo");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("FATAL ERROR: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("wayveil={level},warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
