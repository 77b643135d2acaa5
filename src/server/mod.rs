/// === IMPORTS ===

use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream};
use std::sync::Arc;

// Non-blocking listener/stream, plus TcpSocket for SO_REUSEADDR and the backlog
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};

use tokio::time::{self, Duration};

use crate::ServerResult;
use crate::config::ServerConfig;
use crate::logger::Logger;


/// === MODULES ===

pub mod handler;    // per-connection read loop
pub mod shutdown;   // signal wait and the shutdown coordinator
pub mod state;      // registry, shutdown flag, sequence numbers

use handler::handle_connection;
use shutdown::ShutdownSummary;
use state::{ServerContext, TrackedConnection};


/// === SERVER ===

/// A bound listener plus the state shared with the shutdown coordinator.
pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    config: ServerConfig,
    logger: Logger,
}

impl Server {
    /// Resolves `host:port`, enables address reuse and listens with the
    /// configured backlog. Any failure here is fatal to the caller.
    pub async fn bind(config: ServerConfig, logger: Logger) -> ServerResult<Server> {
        config.validate()?;

        let target = config.bind_address();
        let addr = lookup_host(&target)
            .await
            .map_err(|e| format!("could not resolve {}: {}", target, e))?
            .next()
            .ok_or_else(|| format!("no address found for {}", target))?;

        let listener = listen(addr, config.backlog)
            .map_err(|e| format!("failed to bind {}: {}", addr, e))?;

        logger.info(&format!("Listening on {}", listener.local_addr()?));

        Ok(Server {
            listener,
            ctx: Arc::new(ServerContext::new()),
            config,
            logger,
        })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// Accepts until `shutdown_signal` resolves, then stops accepting and
    /// runs the shutdown coordinator. Returns `None` only if the coordinator
    /// was already run through the shared context.
    pub async fn run<F>(self, shutdown_signal: F) -> Option<ShutdownSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown_signal);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_signal => {
                    self.logger.info("Server received shutdown signal");
                    break;
                }

                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => self.admit(stream, peer).await,
                        // e.g. EMFILE; never fatal
                        Err(e) => {
                            self.logger.warn(&format!("Failed to accept connection: {}", e));
                            time::sleep(Duration::from_millis(self.config.accept_error_backoff_ms)).await;
                        }
                    }
                }
            }
        }

        let Server { listener, ctx, logger, .. } = self;
        drop(listener);
        shutdown::shutdown(&ctx, &logger).await
    }

    /// Numbers the connection, registers it and spawns its handler.
    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let seq = self.ctx.next_sequence();
        let conn_logger = self.logger.for_connection(seq);
        conn_logger.info(&format!("Connection established from {}:{}", peer.ip(), peer.port()));

        let (stream, closer) = match with_closer(stream) {
            Ok(pair) => pair,
            Err(e) => {
                conn_logger.error(&format!("Could not track connection from {}: {}", peer, e));
                return;
            }
        };

        let mut registry = self.ctx.lock_registry().await;

        if self.ctx.is_shutting_down() {
            conn_logger.warn("Shutdown in progress, refusing connection");
            let _ = closer.shutdown(Shutdown::Both);
            return;
        }

        let reaped = self.ctx.reap_finished(&mut registry);
        if reaped > 0 {
            self.logger.debug(&format!("Reaped {} finished handler(s)", reaped));
        }

        let task = tokio::spawn(handle_connection(
            stream,
            seq,
            peer,
            self.ctx.clone(),
            self.config.read_chunk_size,
            conn_logger,
        ));
        registry.insert(seq, TrackedConnection::new(peer, closer, task));
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Splits off a duplicate descriptor the coordinator can shut down while
/// the handler owns the stream.
fn with_closer(stream: TcpStream) -> io::Result<(TcpStream, StdTcpStream)> {
    let std_stream = stream.into_std()?;
    let closer = std_stream.try_clone()?;
    Ok((TcpStream::from_std(std_stream)?, closer))
}


/// === RUN_SERVER ===

/// Binds from `config` and serves until Ctrl+C.
pub async fn run_server(
    config: ServerConfig,
    logger: Logger,
) -> ServerResult<Option<ShutdownSummary>> {
    let server = Server::bind(config, logger.clone()).await?;
    Ok(server.run(shutdown::wait_for_interrupt(logger)).await)
}
