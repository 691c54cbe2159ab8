//! `gsm-fleetd <config.json>`
//!
//! Starts the fleet described by the configuration file and serves the
//! operator console on stdin/stdout. Set `RUST_LOG` to control logging.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use gsm_fleet_core::{FleetConfig, Gateway};
use gsm_fleet_serial::console::{handle_line, Reply};
use gsm_fleet_serial::hardware;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("usage: gsm-fleetd <config.json>");
        return ExitCode::from(2);
    };

    let config = match FleetConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let gateway = match Gateway::from_config(&config, hardware(&config)) {
        Ok(gateway) => gateway,
        Err(e) => {
            log::error!("failed to start fleet: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!("gsm-fleetd ready ({} modules configured)", config.modules.len());

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::error!("failed to read command: {}", e);
                break;
            }
        };
        match handle_line(&gateway, &line) {
            Reply::Respond(value) => {
                if writeln!(stdout, "{}", value).and_then(|_| stdout.flush()).is_err() {
                    break;
                }
            }
            Reply::Quit => break,
            Reply::Ignore => {}
        }
    }

    gateway.shutdown();
    ExitCode::SUCCESS
}
