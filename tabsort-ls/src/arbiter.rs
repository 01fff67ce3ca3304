//! Arbitration: election state and the restart controller
//!
//! [`Arbiter`] owns the process-wide [`ElectionState`]. Sessions call
//! [`Arbiter::try_claim`] after a valid token; the read-check-write runs
//! under one lock acquisition with no await inside, so the first valid
//! token wins.
//!
//! [`Controller`] runs the listener pool through repeated cycles:
//!
//! ```text
//! start pool ──► wait for primary ──► close other ports ──► ack primary
//!     ▲                                                        │
//!     └──── settle delay ◄── stop pool ◄── primary disconnected ┘
//! ```
//!
//! Control events carry the cycle number they belong to; events from a
//! previous cycle are ignored.

use crate::pool::ListenerPool;
use crate::session::SessionContext;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tabsort_common::events::{EventBus, TabsortEvent};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which port holds the primary connection and whether a client is active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElectionState {
    pub primary_port: Option<u16>,
    pub client_active: bool,
}

/// Result of a session's claim on primary status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This session is the primary for `cycle`
    Won { cycle: u64 },
    /// A different port already holds the primary connection
    PrimaryElsewhere(u16),
    /// A client is already active (on this same port, or mid-election)
    ClientActive(Option<u16>),
}

/// Messages from sessions to the controller
#[derive(Debug)]
pub enum ControlEvent {
    PrimaryEstablished {
        cycle: u64,
        port: u16,
        ack: oneshot::Sender<()>,
    },
    PrimaryDisconnected {
        cycle: u64,
        port: u16,
    },
}

#[derive(Debug, Default)]
struct Inner {
    state: ElectionState,
    cycle: u64,
}

/// Owner of the election state
pub struct Arbiter {
    inner: Mutex<Inner>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
}

impl Arbiter {
    /// Create an arbiter and the receiving end of its control channel
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ControlEvent>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let arbiter = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            control_tx,
        });
        (arbiter, control_rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State is plain data; a panic elsewhere cannot leave it half-written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ElectionState {
        self.lock().state
    }

    pub fn primary_port(&self) -> Option<u16> {
        self.lock().state.primary_port
    }

    /// Attempt to become primary on `port`
    pub fn try_claim(&self, port: u16) -> Claim {
        let mut inner = self.lock();
        let current = inner.state;
        match current {
            ElectionState {
                primary_port: Some(primary),
                ..
            } if primary != port => Claim::PrimaryElsewhere(primary),
            ElectionState {
                primary_port: Some(primary),
                ..
            } => Claim::ClientActive(Some(primary)),
            ElectionState {
                client_active: true,
                ..
            } => Claim::ClientActive(None),
            ElectionState { .. } => {
                inner.state = ElectionState {
                    primary_port: Some(port),
                    client_active: true,
                };
                Claim::Won { cycle: inner.cycle }
            }
        }
    }

    /// Reset the election and start a new cycle; returns the new cycle number
    pub(crate) fn begin_cycle(&self) -> u64 {
        let mut inner = self.lock();
        inner.state = ElectionState::default();
        inner.cycle += 1;
        inner.cycle
    }

    /// Tell the controller this session won; resolves once non-primary
    /// listeners are closed. Returns false if the controller declined.
    pub async fn announce_primary(&self, cycle: u64, port: u16) -> bool {
        let (ack, ack_rx) = oneshot::channel();
        let event = ControlEvent::PrimaryEstablished { cycle, port, ack };
        if self.control_tx.send(event).is_err() {
            return false;
        }
        ack_rx.await.is_ok()
    }

    /// Tell the controller the primary session for `cycle` ended
    pub fn primary_lost(&self, cycle: u64, port: u16) {
        let _ = self
            .control_tx
            .send(ControlEvent::PrimaryDisconnected { cycle, port });
    }
}

/// Signals primary disconnection when the owning session ends, however it ends
pub struct PrimaryGuard {
    arbiter: Arc<Arbiter>,
    cycle: u64,
    port: u16,
}

impl PrimaryGuard {
    pub fn new(arbiter: Arc<Arbiter>, cycle: u64, port: u16) -> Self {
        Self {
            arbiter,
            cycle,
            port,
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

impl Drop for PrimaryGuard {
    fn drop(&mut self) {
        self.arbiter.primary_lost(self.cycle, self.port);
    }
}

/// Pool timing and addressing
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub bind_host: String,
    pub ports: Vec<u16>,
    pub restart_delay: Duration,
    pub empty_pool_retry: Duration,
}

/// Drives listener pool cycles
pub struct Controller {
    arbiter: Arc<Arbiter>,
    control_rx: mpsc::UnboundedReceiver<ControlEvent>,
    session_ctx: Arc<SessionContext>,
    config: ControllerConfig,
    event_bus: EventBus,
}

impl Controller {
    pub fn new(
        arbiter: Arc<Arbiter>,
        control_rx: mpsc::UnboundedReceiver<ControlEvent>,
        session_ctx: Arc<SessionContext>,
        config: ControllerConfig,
        event_bus: EventBus,
    ) -> Self {
        Self {
            arbiter,
            control_rx,
            session_ctx,
            config,
            event_bus,
        }
    }

    /// Run pool cycles until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let cycle = self.arbiter.begin_cycle();
            info!(
                "Starting listeners on ports {:?} (cycle {})",
                self.config.ports, cycle
            );

            let mut pool = ListenerPool::start(
                &self.config.bind_host,
                &self.config.ports,
                Arc::clone(&self.session_ctx),
            )
            .await;

            if pool.is_empty() {
                error!(
                    "No listener could be started on any of the ports {:?}; retrying in {:?}",
                    self.config.ports, self.config.empty_pool_retry
                );
                self.event_bus.emit_lossy(TabsortEvent::PoolStartFailed {
                    cycle,
                    timestamp: chrono::Utc::now(),
                });
                if sleep_or_shutdown(self.config.empty_pool_retry, &shutdown).await {
                    break;
                }
                continue;
            }

            self.event_bus.emit_lossy(TabsortEvent::PoolStarted {
                cycle,
                ports: pool.open_ports(),
                timestamp: chrono::Utc::now(),
            });
            info!("Waiting for a primary connection handshake on any port...");

            let shutting_down = self.supervise(cycle, &mut pool, &shutdown).await;
            pool.shutdown().await;

            if shutting_down {
                break;
            }

            info!(
                "Primary connection lost, restarting listeners in {:?}",
                self.config.restart_delay
            );
            if sleep_or_shutdown(self.config.restart_delay, &shutdown).await {
                break;
            }
        }

        self.arbiter.begin_cycle();
        info!("Arbitration controller stopped");
    }

    /// Handle control events for one cycle; returns true on shutdown
    async fn supervise(
        &mut self,
        cycle: u64,
        pool: &mut ListenerPool,
        shutdown: &CancellationToken,
    ) -> bool {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return true,
                event = self.control_rx.recv() => event,
            };

            match event {
                None => {
                    warn!("Control channel closed");
                    return true;
                }
                Some(ControlEvent::PrimaryEstablished { cycle: c, port, ack }) if c == cycle => {
                    info!("Primary connection established on port {}", port);
                    pool.close_except(port).await;
                    self.event_bus.emit_lossy(TabsortEvent::PrimaryEstablished {
                        port,
                        timestamp: chrono::Utc::now(),
                    });
                    info!("Primary server on port {} is running", port);
                    if ack.send(()).is_err() {
                        debug!("Primary session on port {} ended before acknowledgement", port);
                    }
                }
                Some(ControlEvent::PrimaryDisconnected { cycle: c, port }) if c == cycle => {
                    info!("Primary connection on port {} closed", port);
                    self.event_bus.emit_lossy(TabsortEvent::PrimaryDisconnected {
                        port,
                        timestamp: chrono::Utc::now(),
                    });
                    return false;
                }
                Some(stale) => {
                    debug!("Ignoring control event from an earlier cycle: {:?}", stale);
                }
            }
        }
    }
}

/// Sleep for `delay`; returns true if shutdown was requested first
async fn sleep_or_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
