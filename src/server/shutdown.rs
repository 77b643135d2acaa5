use tokio::signal;

use crate::logger::Logger;
use crate::server::handler::HandlerReport;
use crate::server::state::ServerContext;

/// Result of one completed shutdown sequence
#[derive(Debug, Default)]
pub struct ShutdownSummary {
    /// Reports of every handler joined here, in sequence order
    pub reports: Vec<HandlerReport>,
    /// Handlers that had finished and were dropped from the registry earlier
    pub reaped: usize,
}

impl ShutdownSummary {
    pub fn joined(&self) -> usize {
        self.reports.len()
    }
}

/// Force-closes every tracked connection and waits for its handler.
///
/// Holds the registry lock for the whole sequence. Returns `None` when
/// another caller already started the shutdown.
pub async fn shutdown(ctx: &ServerContext, logger: &Logger) -> Option<ShutdownSummary> {
    let mut registry = ctx.lock_registry().await;

    if !ctx.begin_shutdown() {
        logger.warn("Shutdown already in progress, ignoring");
        return None;
    }

    let tracked = std::mem::take(&mut *registry);
    logger.info(&format!("Shutting down, {} connection(s) tracked", tracked.len()));

    let mut reports = Vec::with_capacity(tracked.len());
    for (seq, conn) in tracked {
        let conn_logger = logger.for_connection(seq);

        // ENOTCONN here just means the peer went away first
        if let Err(e) = conn.force_close() {
            conn_logger.debug(&format!("Socket to {} already closed: {}", conn.peer(), e));
        }

        match conn.into_task().await {
            Ok(report) => reports.push(report),
            Err(e) => conn_logger.error(&format!("Handler did not exit cleanly: {}", e)),
        }
    }

    ctx.mark_terminated();
    drop(registry);

    logger.info(&format!("All {} handler(s) joined", reports.len()));
    Some(ShutdownSummary {
        reports,
        reaped: ctx.reaped_count(),
    })
}

/// Resolves on the first Ctrl+C. Later interrupts are absorbed and logged
/// so a second keypress can't kill the process mid-shutdown.
pub async fn wait_for_interrupt(logger: Logger) {
    if let Err(e) = signal::ctrl_c().await {
        logger.error(&format!("Failed to listen for ctrl_c: {}", e));
        std::future::pending::<()>().await;
    }
    logger.warn("Ctrl+C received, shutting down");

    tokio::spawn(async move {
        while signal::ctrl_c().await.is_ok() {
            logger.warn("Ctrl+C received again, shutdown already in progress");
        }
    });
}
