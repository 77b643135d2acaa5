use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::logger::Logger;
use crate::server::state::ServerContext;

const BEGIN_DATA: &str = "-------------- BEGIN DATA --------------";
const END_DATA: &str = "-------------- END DATA ----------------";

/// Why a handler stopped reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Zero-length read while the server was running
    PeerClosed,
    /// Zero-length read after the shutdown flag was set
    Shutdown,
    /// The read itself failed
    ReadError(io::ErrorKind),
}

/// What a handler did over its lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerReport {
    pub seq: u64,
    pub peer: SocketAddr,
    pub chunks: usize,
    pub bytes: usize,
    pub termination: Termination,
}

/// One received chunk as a single log record, so concurrent
/// connections can't interleave inside a block.
pub fn data_block(peer: SocketAddr, payload: &Bytes) -> String {
    format!(
        "Received data from {}:{}:\n{}\n{:?}\n{}",
        peer.ip(),
        peer.port(),
        BEGIN_DATA,
        payload,
        END_DATA
    )
}

fn termination_message(termination: Termination, shutting_down: bool) -> String {
    let reason = match termination {
        Termination::PeerClosed => "Received nothing".to_string(),
        Termination::Shutdown => "Received nothing".to_string(),
        Termination::ReadError(kind) => format!("Read failed ({:?})", kind),
    };
    if shutting_down {
        format!("{}, terminating connection due to shutdown", reason)
    } else {
        format!("{}, terminating connection", reason)
    }
}

/// Reads until the peer closes or the socket is shut down under us.
/// Never writes a byte back.
pub async fn handle_connection<S>(
    mut stream: S,
    seq: u64,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    chunk_size: usize,
    logger: Logger,
) -> HandlerReport
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::zeroed(chunk_size);
    let mut chunks = 0;
    let mut bytes = 0;

    // The flag is sampled once, when the read loop ends, so the report and
    // the log line always agree.
    let (termination, forced) = loop {
        match stream.read(&mut buf[..]).await {
            Ok(0) => {
                let forced = ctx.is_shutting_down();
                let termination = if forced {
                    Termination::Shutdown
                } else {
                    Termination::PeerClosed
                };
                break (termination, forced);
            }
            Ok(n) => {
                chunks += 1;
                bytes += n;
                let payload = Bytes::copy_from_slice(&buf[..n]);
                logger.info(&data_block(peer, &payload));
            }
            Err(e) => {
                logger.debug(&format!("read from {} failed: {}", peer, e));
                break (Termination::ReadError(e.kind()), ctx.is_shutting_down());
            }
        }
    };

    logger.warn(&termination_message(termination, forced));

    // Already shut down on the forced path; errors here mean nothing.
    let _ = stream.shutdown().await;
    drop(stream);

    logger.debug(&format!(
        "Connection from {} closed after {} chunk(s), {} byte(s)",
        peer, chunks, bytes
    ));

    HandlerReport {
        seq,
        peer,
        chunks,
        bytes,
        termination,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{ReadBuf, duplex};

    /// Yields `data` once, then fails every read with `kind`.
    struct FailingStream {
        data: Option<&'static [u8]>,
        kind: io::ErrorKind,
    }

    impl AsyncRead for FailingStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::new(self.kind, "connection torn down"))),
            }
        }
    }

    impl AsyncWrite for FailingStream {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::NotConnected.into()))
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.7:40123".parse().unwrap()
    }

    #[test]
    fn test_data_block_is_raw_bytes_between_markers() {
        let block = data_block(peer(), &Bytes::from_static(b"GET /\r\n"));
        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines[0], "Received data from 10.0.0.7:40123:");
        assert_eq!(lines[1], BEGIN_DATA);
        assert_eq!(lines[2], r#"b"GET /\r\n""#);
        assert_eq!(lines[3], END_DATA);
    }

    #[test]
    fn test_termination_wording_depends_on_flag() {
        let voluntary = termination_message(Termination::PeerClosed, false);
        assert!(voluntary.ends_with("terminating connection"));

        let forced = termination_message(Termination::Shutdown, true);
        assert!(forced.ends_with("terminating connection due to shutdown"));
    }

    #[tokio::test]
    async fn test_counts_chunks_until_peer_closes() {
        let (mut client, server) = duplex(64);
        let ctx = Arc::new(ServerContext::new());
        let task = tokio::spawn(handle_connection(
            server,
            1,
            peer(),
            ctx,
            2048,
            Logger::default().for_connection(1),
        ));

        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();
        tokio::task::yield_now().await;
        drop(client);

        let report = task.await.unwrap();
        assert_eq!(report.seq, 1);
        assert_eq!(report.bytes, 5);
        assert!(report.chunks >= 1);
        assert_eq!(report.termination, Termination::PeerClosed);
    }

    #[tokio::test]
    async fn test_reads_are_bounded_by_chunk_size() {
        let (mut client, server) = duplex(64);
        client.write_all(&[7u8; 10]).await.unwrap();
        drop(client);

        let report = handle_connection(
            server,
            2,
            peer(),
            Arc::new(ServerContext::new()),
            4,
            Logger::default(),
        )
        .await;

        assert_eq!(report.bytes, 10);
        assert_eq!(report.chunks, 3);
    }

    #[tokio::test]
    async fn test_close_after_flag_reports_shutdown() {
        let (client, server) = duplex(64);
        let ctx = Arc::new(ServerContext::new());
        assert!(ctx.begin_shutdown());
        drop(client);

        let report = handle_connection(server, 3, peer(), ctx, 2048, Logger::default()).await;
        assert_eq!(report.termination, Termination::Shutdown);
        assert_eq!(report.chunks, 0);
    }

    #[tokio::test]
    async fn test_read_error_ends_only_this_handler() {
        let stream = FailingStream {
            data: Some(b"partial"),
            kind: io::ErrorKind::ConnectionReset,
        };
        let ctx = Arc::new(ServerContext::new());

        let report = handle_connection(stream, 5, peer(), ctx.clone(), 2048, Logger::default()).await;

        assert_eq!(report.termination, Termination::ReadError(io::ErrorKind::ConnectionReset));
        assert_eq!(report.chunks, 1);
        assert_eq!(report.bytes, 7);
        assert!(!ctx.is_shutting_down());
    }

    #[test]
    fn test_read_error_wording_follows_flag() {
        let kind = io::ErrorKind::ConnectionReset;
        assert_eq!(
            termination_message(Termination::ReadError(kind), false),
            "Read failed (ConnectionReset), terminating connection"
        );
        assert_eq!(
            termination_message(Termination::ReadError(kind), true),
            "Read failed (ConnectionReset), terminating connection due to shutdown"
        );
    }

    #[tokio::test]
    async fn test_never_writes_back() {
        let (mut client, server) = duplex(64);
        let task = tokio::spawn(handle_connection(
            server,
            4,
            peer(),
            Arc::new(ServerContext::new()),
            2048,
            Logger::default(),
        ));

        client.write_all(b"ping\n").await.unwrap();
        client.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert!(echoed.is_empty());

        let report = task.await.unwrap();
        assert_eq!(report.bytes, 5);
    }
}
