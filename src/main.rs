use std::process::ExitCode;

use timeout_server::logger::ALERT_TAG;
use timeout_server::{ServerConfig, init_logger, run_server};

/// Usage: `timeout-server [config.json]`
fn main() -> ExitCode {
    // Config errors happen before logging exists, so they go to stderr
    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{} {}", ALERT_TAG, e);
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("timeout-server-worker")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{} Failed to build Tokio runtime: {}", ALERT_TAG, e);
            return ExitCode::FAILURE;
        }
    };

    let logger = init_logger("timeout_server", &config.logger);

    rt.block_on(async {
        match run_server(config, logger.clone()).await {
            Ok(Some(summary)) => {
                logger.info(&format!(
                    "Exiting after joining {} handler(s) ({} reaped earlier)",
                    summary.joined(),
                    summary.reaped
                ));
                ExitCode::SUCCESS
            }
            Ok(None) => ExitCode::SUCCESS,
            Err(e) => {
                logger.error(&format!("Rust server error: {}", e));
                ExitCode::FAILURE
            }
        }
    })
}
