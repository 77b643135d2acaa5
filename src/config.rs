// serde does the field-by-field parsing, `default` fills anything the file leaves out
use serde::Deserialize;

// Reading the optional config file from disk
use std::{fs, path::Path};

// Shared error alias
use crate::ServerResult;

//////////////////////
// LoggerConfig     //
//////////////////////

/// Where and how log lines are written
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Minimum level, parsed into a `log::LevelFilter` ("info", "debug", ...)
    pub log_level: String,

    /// Colored lines on stdout
    pub enable_console_log: bool,

    /// Also append to `<log_file_path>/<name>.log`
    pub enable_file_log: bool,

    /// Directory for the log file; empty means the working directory
    pub log_file_path: String,

    /// chrono format string for timestamps
    pub date_format: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            log_level: "info".to_string(),
            enable_console_log: true,
            enable_file_log: false,
            log_file_path: String::new(),
            date_format: "%Y-%m-%d %H:%M:%S".to_string(),
        }
    }
}

//////////////////////
// ServerConfig     //
//////////////////////

/// Everything the server needs at startup
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP or hostname to listen on (e.g. `"0.0.0.0"`)
    pub host: String,

    /// Port number (e.g. `7070`)
    pub port: u16,

    /// Accept backlog handed to `listen(2)`
    pub backlog: u32,

    /// Upper bound on bytes returned by a single read
    pub read_chunk_size: usize,

    /// Milliseconds to sleep after a failed accept
    pub accept_error_backoff_ms: u64,

    /// How many Tokio worker threads to spin up (defaults to cpu-1)
    pub worker_threads: usize,

    /// Logging settings
    pub logger: LoggerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 7070,
            backlog: 10,
            read_chunk_size: 2048,
            accept_error_backoff_ms: 100,
            worker_threads: num_cpus::get().saturating_sub(1).max(1),
            logger: LoggerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse a JSON document; missing keys keep their defaults.
    pub fn from_json_str(raw: &str) -> ServerResult<Self> {
        let config: ServerConfig = serde_json::from_str(raw)
            .map_err(|e| format!("invalid server config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("could not read config file {}: {}", path.display(), e))?;
        Self::from_json_str(&raw)
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> ServerResult<()> {
        if self.backlog == 0 {
            return Err("backlog must be greater than zero".into());
        }
        if self.read_chunk_size == 0 {
            return Err("read_chunk_size must be greater than zero".into());
        }
        if self.worker_threads == 0 {
            return Err("worker_threads must be greater than zero".into());
        }
        Ok(())
    }

    /// `host:port` as handed to the resolver
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
