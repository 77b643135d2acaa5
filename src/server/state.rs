use std::collections::BTreeMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::server::handler::HandlerReport;

/// Process lifecycle: `Running -> ShuttingDown -> Terminated`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    ShuttingDown,
    Terminated,
}

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const TERMINATED: u8 = 2;

/// The registry's view of one connection: enough to force it closed and
/// wait for its handler, nothing more. The handler owns the stream itself.
#[derive(Debug)]
pub struct TrackedConnection {
    peer: SocketAddr,
    closer: StdTcpStream,
    task: JoinHandle<HandlerReport>,
}

impl TrackedConnection {
    /// `closer` must be a duplicate of the handler's socket.
    pub fn new(peer: SocketAddr, closer: StdTcpStream, task: JoinHandle<HandlerReport>) -> Self {
        TrackedConnection { peer, closer, task }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Shuts both directions down; the handler's pending read returns 0.
    pub fn force_close(&self) -> io::Result<()> {
        self.closer.shutdown(Shutdown::Both)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn into_task(self) -> JoinHandle<HandlerReport> {
        self.task
    }
}

/// Sequence number -> connection. Keys are assigned in accept order, so
/// iteration order is insertion order.
pub type Registry = BTreeMap<u64, TrackedConnection>;

/// State shared by the acceptor and the shutdown coordinator.
///
/// The registry sits behind one async mutex; the phase and counters are
/// atomics so handlers can read the shutdown flag without taking the lock.
#[derive(Debug)]
pub struct ServerContext {
    registry: Mutex<Registry>,
    phase: AtomicU8,
    next_seq: AtomicU64,
    reaped: AtomicUsize,
}

impl Default for ServerContext {
    fn default() -> Self {
        ServerContext {
            registry: Mutex::new(BTreeMap::new()),
            phase: AtomicU8::new(RUNNING),
            next_seq: AtomicU64::new(1),
            reaped: AtomicUsize::new(0),
        }
    }
}

impl ServerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next connection sequence number. Starts at 1, never reused.
    pub fn next_sequence(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest sequence number handed out so far (0 if none).
    pub fn last_sequence(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    pub fn phase(&self) -> Phase {
        match self.phase.load(Ordering::SeqCst) {
            RUNNING => Phase::Running,
            SHUTTING_DOWN => Phase::ShuttingDown,
            _ => Phase::Terminated,
        }
    }

    /// The shutdown flag.
    pub fn is_shutting_down(&self) -> bool {
        self.phase() != Phase::Running
    }

    /// Flips `Running -> ShuttingDown`. Only the first caller gets `true`.
    pub(crate) fn begin_shutdown(&self) -> bool {
        self.phase
            .compare_exchange(RUNNING, SHUTTING_DOWN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn mark_terminated(&self) {
        self.phase.store(TERMINATED, Ordering::SeqCst);
    }

    pub async fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().await
    }

    /// Entries currently in the registry, finished or not.
    pub async fn tracked_connections(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Entries whose handler is still running.
    pub async fn active_connections(&self) -> usize {
        self.registry
            .lock()
            .await
            .values()
            .filter(|conn| !conn.is_finished())
            .count()
    }

    /// Total entries dropped by `reap_finished` over the process lifetime.
    pub fn reaped_count(&self) -> usize {
        self.reaped.load(Ordering::SeqCst)
    }

    /// Drops entries whose handler already exited. Caller holds the lock.
    pub(crate) fn reap_finished(&self, registry: &mut Registry) -> usize {
        let before = registry.len();
        registry.retain(|_, conn| !conn.is_finished());
        let reaped = before - registry.len();
        self.reaped.fetch_add(reaped, Ordering::SeqCst);
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sequence_starts_at_one() {
        let ctx = ServerContext::new();
        assert_eq!(ctx.last_sequence(), 0);
        assert_eq!(ctx.next_sequence(), 1);
        assert_eq!(ctx.next_sequence(), 2);
        assert_eq!(ctx.last_sequence(), 2);
    }

    #[test]
    fn test_shutdown_transition_happens_once() {
        let ctx = ServerContext::new();
        assert_eq!(ctx.phase(), Phase::Running);
        assert!(!ctx.is_shutting_down());

        assert!(ctx.begin_shutdown());
        assert!(!ctx.begin_shutdown());
        assert_eq!(ctx.phase(), Phase::ShuttingDown);
        assert!(ctx.is_shutting_down());

        ctx.mark_terminated();
        assert_eq!(ctx.phase(), Phase::Terminated);
        assert!(ctx.is_shutting_down());
        assert!(!ctx.begin_shutdown());
    }

    #[test]
    fn test_concurrent_sequences_are_unique() {
        let ctx = Arc::new(ServerContext::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                std::thread::spawn(move || (0..500).map(|_| ctx.next_sequence()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert_eq!(all.first(), Some(&1));
        assert_eq!(all.last(), Some(&4000));
    }

    #[tokio::test]
    async fn test_reap_drops_only_finished() {
        use tokio::net::{TcpListener, TcpStream};
        use crate::server::handler::{HandlerReport, Termination};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = ServerContext::new();

        let mut closers = Vec::new();
        for _ in 0..2 {
            let _client = TcpStream::connect(addr).await.unwrap();
            let (stream, peer) = listener.accept().await.unwrap();
            closers.push((peer, stream.into_std().unwrap()));
        }

        let (peer_a, closer_a) = closers.remove(0);
        let (peer_b, closer_b) = closers.remove(0);

        let done = tokio::spawn(async move {
            HandlerReport {
                seq: 1,
                peer: peer_a,
                chunks: 0,
                bytes: 0,
                termination: Termination::PeerClosed,
            }
        });
        let pending = tokio::spawn(std::future::pending::<HandlerReport>());

        while !done.is_finished() {
            tokio::task::yield_now().await;
        }

        let mut registry = ctx.lock_registry().await;
        registry.insert(1, TrackedConnection::new(peer_a, closer_a, done));
        registry.insert(2, TrackedConnection::new(peer_b, closer_b, pending));

        assert_eq!(ctx.reap_finished(&mut registry), 1);
        assert_eq!(registry.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(ctx.reaped_count(), 1);

        if let Some(conn) = registry.remove(&2) {
            conn.into_task().abort();
        }
    }
}
