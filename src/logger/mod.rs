// Color configuration for pretty terminal output using fern
use fern::colors::{Color, ColoredLevelConfig};

// Local time formatting for every line
use chrono::Local;

// Global level filter
use log::LevelFilter;

// Dispatch builder for combining outputs
use fern::Dispatch;

// stdout, file creation
use std::path::{Path, PathBuf};
use std::{fs, io};

// One-time global initialisation
use std::sync::OnceLock;

use crate::config::LoggerConfig;

/// Tag for informational lines
pub const INFO_TAG: &str = "[**]";

/// Tag for warnings and errors
pub const ALERT_TAG: &str = "[!!]";

/// Builds the text of one log line: tag, optional connection scope, message.
pub fn tagged(tag: &str, scope: Option<u64>, msg: &str) -> String {
    match scope {
        Some(seq) => format!("{} [{}] {}", tag, seq, msg),
        None => format!("{} {}", tag, msg),
    }
}

/// Clonable handle over the `log` facade.
/// A handle scoped to a connection prefixes every line with its sequence number.
#[derive(Clone, Debug, Default)]
pub struct Logger {
    scope: Option<u64>,
}

impl Logger {
    /// Same sink, lines annotated with `[seq]`
    pub fn for_connection(&self, seq: u64) -> Logger {
        Logger { scope: Some(seq) }
    }

    pub fn debug(&self, msg: &str) {
        log::debug!("{}", tagged(INFO_TAG, self.scope, msg));
    }

    pub fn info(&self, msg: &str) {
        log::info!("{}", tagged(INFO_TAG, self.scope, msg));
    }

    pub fn warn(&self, msg: &str) {
        log::warn!("{}", tagged(ALERT_TAG, self.scope, msg));
    }

    pub fn error(&self, msg: &str) {
        log::error!("{}", tagged(ALERT_TAG, self.scope, msg));
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// `<dir>/<name>.log`, or `<name>.log` when `dir` is empty
pub fn log_file_target(name: &str, dir: &str) -> PathBuf {
    let file = format!("{}.log", name.replace('.', "_"));
    if dir.is_empty() {
        PathBuf::from(file)
    } else {
        Path::new(dir).join(file)
    }
}

/// Installs the global fern dispatcher on first call.
/// Later calls return the same handle and ignore `cfg`.
pub fn init_logger(name: &str, cfg: &LoggerConfig) -> Logger {
    LOGGER
        .get_or_init(|| {
            let level = cfg
                .log_level
                .parse::<LevelFilter>()
                .unwrap_or(LevelFilter::Info);

            let mut base = Dispatch::new().level(level);

            // Same layout on both branches; only the console colors the level
            if cfg.enable_console_log {
                let nm = name.to_string();
                let datefmt = cfg.date_format.clone();
                let colors = ColoredLevelConfig::new()
                    .info(Color::Green)
                    .warn(Color::Yellow)
                    .error(Color::Red)
                    .debug(Color::Blue);

                base = base.chain(
                    Dispatch::new()
                        .format(move |out, message, record| {
                            out.finish(format_args!(
                                "{} - {} - {} - {}",
                                Local::now().format(&datefmt),
                                nm,
                                colors.color(record.level()),
                                message
                            ))
                        })
                        .chain(io::stdout()),
                );
            }

            if cfg.enable_file_log {
                if !cfg.log_file_path.is_empty() {
                    let _ = fs::create_dir_all(&cfg.log_file_path);
                }
                let target = log_file_target(name, &cfg.log_file_path);
                match fern::log_file(&target) {
                    Ok(fh) => {
                        let nm = name.to_string();
                        let datefmt = cfg.date_format.clone();
                        base = base.chain(
                            Dispatch::new()
                                .format(move |out, message, record| {
                                    out.finish(format_args!(
                                        "{} - {} - {} - {}",
                                        Local::now().format(&datefmt),
                                        nm,
                                        record.level(),
                                        message
                                    ))
                                })
                                .chain(fh),
                        );
                    }
                    Err(err) => eprintln!(
                        "{} could not open log file {}: {}",
                        ALERT_TAG,
                        target.display(),
                        err
                    ),
                }
            }

            // A test harness may have installed a logger already
            if let Err(err) = base.apply() {
                eprintln!("{} logger already initialised: {}", ALERT_TAG, err);
            }

            Logger::default()
        })
        .clone()
}
