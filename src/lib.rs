//! A TCP server that accepts connections, logs whatever arrives and never
//! answers. Used to watch how a client copes with a peer that stalls.
//!
//! Ctrl+C force-closes every open connection and waits for each handler
//! before the process exits.

// Settings for the listener and the logger, read from an optional JSON file.
pub mod config;

// fern-backed logging with `[**]` / `[!!]` tags.
pub mod logger;

// Acceptor, per-connection handler, shutdown coordinator.
pub mod server;

/// Error type used across the crate; messages carry their own context.
pub type ServerResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use config::{LoggerConfig, ServerConfig};
pub use logger::{Logger, init_logger};
pub use server::handler::{HandlerReport, Termination};
pub use server::shutdown::ShutdownSummary;
pub use server::state::{Phase, ServerContext};
pub use server::{Server, run_server};
