//! Listener pool: one WebSocket listener per candidate port
//!
//! Ports that cannot be bound are logged and left out; the pool is usable
//! as long as one port is open. Each port has its own cancellation token
//! and task tracker covering the accept loop and every session accepted
//! on it, so a port can be closed and awaited independently.

use crate::error::{Error, Result};
use crate::session::{run_session, SessionContext};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of one port's listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Open,
    Closing,
    Closed,
}

struct PortEntry {
    state: PortState,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl PortEntry {
    async fn close(&mut self) {
        if self.state == PortState::Closed {
            return;
        }
        self.state = PortState::Closing;
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.state = PortState::Closed;
    }
}

/// Set of listeners for one arbitration cycle
pub struct ListenerPool {
    ports: BTreeMap<u16, PortEntry>,
}

impl ListenerPool {
    /// Bind every candidate port and start accepting
    pub async fn start(host: &str, ports: &[u16], ctx: Arc<SessionContext>) -> Self {
        let mut entries = BTreeMap::new();

        for &port in ports {
            if entries.contains_key(&port) {
                continue;
            }
            let (listener, local_addr) = match bind(host, port).await {
                Ok(bound) => bound,
                Err(e) => {
                    warn!("Failed to start server: {}", e);
                    continue;
                }
            };

            let cancel = CancellationToken::new();
            let tasks = TaskTracker::new();
            tasks.spawn(accept_loop(
                listener,
                port,
                cancel.clone(),
                tasks.clone(),
                Arc::clone(&ctx),
            ));

            info!("Server listening on ws://{}", local_addr);
            entries.insert(
                port,
                PortEntry {
                    state: PortState::Open,
                    local_addr,
                    cancel,
                    tasks,
                },
            );
        }

        Self { ports: entries }
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Ports whose listener is still open
    pub fn open_ports(&self) -> Vec<u16> {
        self.ports
            .iter()
            .filter(|(_, entry)| entry.state == PortState::Open)
            .map(|(port, _)| *port)
            .collect()
    }

    pub fn port_state(&self, port: u16) -> Option<PortState> {
        self.ports.get(&port).map(|entry| entry.state)
    }

    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.ports.get(&port).map(|entry| entry.local_addr)
    }

    /// Close every listener except `keep`, along with its sessions
    ///
    /// Returns once the closed listeners have stopped accepting and their
    /// sessions have ended.
    pub async fn close_except(&mut self, keep: u16) {
        for (port, entry) in self.ports.iter_mut() {
            if *port == keep || entry.state == PortState::Closed {
                continue;
            }
            debug!("Closing non-primary listener on port {}", port);
            entry.close().await;
            info!("Server on port {} closed", port);
        }
    }

    /// Close every listener and wait for all sessions to end
    pub async fn shutdown(mut self) {
        for (port, entry) in self.ports.iter_mut() {
            if entry.state != PortState::Closed {
                entry.close().await;
                info!("Server on port {} closed", port);
            }
        }
    }
}

async fn bind(host: &str, port: u16) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|source| Error::Bind { port, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| Error::Bind { port, source })?;
    Ok((listener, local_addr))
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    cancel: CancellationToken,
    tasks: TaskTracker,
    ctx: Arc<SessionContext>,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                info!("Client connected to port {}: {}", port, peer);
                tasks.spawn(run_session(
                    stream,
                    port,
                    peer,
                    Arc::clone(&ctx),
                    cancel.child_token(),
                ));
            }
            Err(e) => {
                warn!("Accept failed on port {}: {}", port, e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    debug!("Accept loop on port {} stopped", port);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::Arbiter;
    use crate::dedup::DedupStore;
    use crate::lookup::{LookupError, MetadataSource, RetryPolicy};
    use crate::pipeline::Pipeline;
    use async_trait::async_trait;
    use tabsort_common::canonical::CanonicalUrl;
    use tabsort_common::classify::LookupPayload;
    use tabsort_common::events::EventBus;
    use tempfile::TempDir;

    struct NoSource;

    #[async_trait]
    impl MetadataSource for NoSource {
        fn name(&self) -> &'static str {
            "none"
        }

        async fn lookup(&self, _url: &CanonicalUrl) -> std::result::Result<LookupPayload, LookupError> {
            Err(LookupError::Unavailable("none".into()))
        }
    }

    async fn context(dir: &TempDir) -> Arc<SessionContext> {
        let dedup = DedupStore::load(dir.path().join("a.txt"), dir.path().join("b.txt"))
            .await
            .unwrap();
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(dedup),
            Arc::new(NoSource),
            RetryPolicy::new(1, Duration::ZERO),
            1,
            EventBus::new(8),
        ));
        let (arbiter, _rx) = Arbiter::new();
        Arc::new(SessionContext {
            arbiter,
            pipeline,
            token: "token".into(),
            handshake_timeout: Duration::from_secs(1),
            keepalive: Duration::ZERO,
        })
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_busy_port_left_out_of_pool() {
        let dir = TempDir::new().unwrap();
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        let free = free_port();

        let pool = ListenerPool::start("127.0.0.1", &[busy_port, free], context(&dir).await).await;
        assert_eq!(pool.open_ports(), vec![free]);
        assert_eq!(pool.port_state(busy_port), None);
        assert_eq!(pool.local_addr(free).map(|a| a.port()), Some(free));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_except_keeps_only_primary() {
        let dir = TempDir::new().unwrap();
        let (a, b) = (free_port(), free_port());
        if a == b {
            return;
        }

        let mut pool = ListenerPool::start("127.0.0.1", &[a, b], context(&dir).await).await;
        assert_eq!(pool.open_ports().len(), 2);

        pool.close_except(b).await;
        assert_eq!(pool.port_state(a), Some(PortState::Closed));
        assert_eq!(pool.port_state(b), Some(PortState::Open));
        assert_eq!(pool.open_ports(), vec![b]);
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", a)).await.is_err());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_pool_when_nothing_binds() {
        let dir = TempDir::new().unwrap();
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        let pool = ListenerPool::start("127.0.0.1", &[busy_port], context(&dir).await).await;
        assert!(pool.is_empty());
        pool.shutdown().await;
    }
}
