//! One WebSocket connection, from upgrade to close
//!
//! ```text
//! AwaitingHandshake ──bad token / timeout / early close──► Rejected ──► Closed
//!        │
//!        ├──valid token, claim lost──► SecondaryRejected ──► Closed
//!        │
//!        └──valid token, claim won──► Primary ──ack──► Streaming ──► Closed
//! ```
//!
//! Only a `Streaming` session feeds the pipeline, and it re-checks before
//! every message that its port is still the recorded primary.

use crate::arbiter::{Arbiter, Claim, PrimaryGuard};
use crate::pipeline::Pipeline;
use crate::protocol::{Notice, KEEPALIVE_PING};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for delivering a notice to an unresponsive peer
const NOTICE_SEND_TIMEOUT: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Everything a session needs from the service
pub struct SessionContext {
    pub arbiter: Arc<Arbiter>,
    pub pipeline: Arc<Pipeline>,
    pub token: String,
    pub handshake_timeout: Duration,
    /// Keepalive interval while streaming; zero disables keepalives
    pub keepalive: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Rejected,
    Primary,
    SecondaryRejected,
    Streaming,
    Closed,
}

/// Serve one accepted TCP connection until it closes or `cancel` fires
pub async fn run_session(
    stream: TcpStream,
    port: u16,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
) {
    // One deadline covers both the upgrade and the token
    let handshake_deadline = Instant::now() + ctx.handshake_timeout;
    let upgrade = tokio::select! {
        _ = cancel.cancelled() => return,
        upgrade = tokio::time::timeout_at(handshake_deadline, accept_async(stream)) => upgrade,
    };
    let ws = match upgrade {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("WebSocket upgrade failed for {} on port {}: {}", peer, port, e);
            return;
        }
        Err(_) => {
            warn!("WebSocket upgrade timed out for {} on port {}", peer, port);
            return;
        }
    };

    let (sink, stream) = ws.split();
    let session = Session {
        port,
        peer,
        ctx,
        cancel,
        sink,
        stream,
        handshake_deadline,
        primary: None,
        notice: None,
    };
    session.run().await;
}

struct Session {
    port: u16,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
    sink: WsSink,
    stream: WsStream,
    handshake_deadline: Instant,
    /// Held while this session is primary; dropping it signals disconnection
    primary: Option<PrimaryGuard>,
    /// Sent before closing, if set
    notice: Option<Notice>,
}

impl Session {
    async fn run(mut self) {
        let mut state = SessionState::AwaitingHandshake;
        loop {
            debug!(port = self.port, peer = %self.peer, ?state, "Session state");
            state = match state {
                SessionState::AwaitingHandshake => self.await_handshake().await,
                SessionState::Primary => self.confirm_primary().await,
                SessionState::Streaming => self.stream_messages().await,
                SessionState::Rejected | SessionState::SecondaryRejected => {
                    self.send_notice().await;
                    SessionState::Closed
                }
                SessionState::Closed => break,
            };
        }

        if tokio::time::timeout(NOTICE_SEND_TIMEOUT, self.sink.close())
            .await
            .is_err()
        {
            debug!("Close handshake with {} timed out", self.peer);
        }
        info!("Connection from {} on port {} closed", self.peer, self.port);
        // PrimaryGuard (if any) drops here
    }

    async fn await_handshake(&mut self) -> SessionState {
        let deadline = self.handshake_deadline;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled(),
                next = tokio::time::timeout_at(deadline, self.stream.next()) => next,
            };

            match next {
                Err(_) => {
                    warn!("Handshake timeout for {} on port {}", self.peer, self.port);
                    self.notice = Some(Notice::HandshakeTimeout);
                    return SessionState::Rejected;
                }
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => {
                    info!(
                        "Connection from {} on port {} closed during handshake",
                        self.peer, self.port
                    );
                    return SessionState::Rejected;
                }
                Ok(Some(Ok(Message::Text(text)))) => return self.check_token(text.as_str()),
                Ok(Some(Ok(Message::Binary(_)))) => {
                    warn!("Invalid code from {} on port {}", self.peer, self.port);
                    self.notice = Some(Notice::InvalidCode);
                    return SessionState::Rejected;
                }
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    fn check_token(&mut self, received: &str) -> SessionState {
        if received != self.ctx.token {
            warn!("Invalid code from {} on port {}", self.peer, self.port);
            self.notice = Some(Notice::InvalidCode);
            return SessionState::Rejected;
        }

        match self.ctx.arbiter.try_claim(self.port) {
            Claim::Won { cycle } => {
                info!("Handshake successful on port {} (cycle {})", self.port, cycle);
                self.primary = Some(PrimaryGuard::new(
                    Arc::clone(&self.ctx.arbiter),
                    cycle,
                    self.port,
                ));
                SessionState::Primary
            }
            Claim::PrimaryElsewhere(primary) => {
                warn!(
                    "Server is already connected on primary port {}; rejecting {} on port {}",
                    primary, self.peer, self.port
                );
                self.notice = Some(Notice::PrimaryElsewhere { primary });
                SessionState::SecondaryRejected
            }
            Claim::ClientActive(primary) => {
                warn!(
                    "Another client is already active; rejecting {} on port {}",
                    self.peer, self.port
                );
                self.notice = Some(Notice::ClientActive { primary });
                SessionState::SecondaryRejected
            }
        }
    }

    /// Wait for the controller to close the other ports, then confirm
    async fn confirm_primary(&mut self) -> SessionState {
        let Some(cycle) = self.primary.as_ref().map(PrimaryGuard::cycle) else {
            return SessionState::Closed;
        };

        let acknowledged = tokio::select! {
            _ = self.cancel.cancelled() => return SessionState::Closed,
            acknowledged = self.ctx.arbiter.announce_primary(cycle, self.port) => acknowledged,
        };
        if !acknowledged {
            self.notice = Some(Notice::NotPrimary {
                primary: self.ctx.arbiter.primary_port(),
            });
            self.send_notice().await;
            return SessionState::Closed;
        }

        self.notice = Some(Notice::Established { port: self.port });
        if self.send_notice().await {
            SessionState::Streaming
        } else {
            SessionState::Closed
        }
    }

    async fn stream_messages(&mut self) -> SessionState {
        let mut keepalive = keepalive_interval(self.ctx.keepalive);

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return SessionState::Closed,
                _ = tick(&mut keepalive) => {
                    if let Err(e) = self.sink.send(Message::Text(KEEPALIVE_PING.into())).await {
                        info!("Keepalive to {} failed: {}", self.peer, e);
                        return SessionState::Closed;
                    }
                    continue;
                }
                next = self.stream.next() => next,
            };

            match next {
                None => {
                    info!("Client {} disconnected", self.peer);
                    return SessionState::Closed;
                }
                Some(Err(e)) => {
                    info!("Client {} disconnected with error: {}", self.peer, e);
                    return SessionState::Closed;
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Client {} closed the connection", self.peer);
                    return SessionState::Closed;
                }
                Some(Ok(Message::Text(text))) => {
                    let primary = self.ctx.arbiter.primary_port();
                    if primary != Some(self.port) {
                        warn!(
                            "Port {} is no longer primary (primary: {:?}); closing {}",
                            self.port, primary, self.peer
                        );
                        self.notice = Some(Notice::NotPrimary { primary });
                        self.send_notice().await;
                        return SessionState::Closed;
                    }
                    self.ctx.pipeline.spawn_process(text.to_string());
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("Ignoring binary frame from {}", self.peer);
                }
                Some(Ok(_)) => {}
            }
        }
    }

    /// Cancelled before becoming primary: tell the client where the primary is
    fn cancelled(&mut self) -> SessionState {
        match self.ctx.arbiter.primary_port() {
            Some(primary) if primary != self.port => {
                self.notice = Some(Notice::PrimaryElsewhere { primary });
                SessionState::SecondaryRejected
            }
            _ => SessionState::Closed,
        }
    }

    /// Send the pending notice; returns false if it could not be delivered
    async fn send_notice(&mut self) -> bool {
        let Some(notice) = self.notice.take() else {
            return true;
        };
        let frame = Message::Text(notice.to_json().into());
        match tokio::time::timeout(NOTICE_SEND_TIMEOUT, self.sink.send(frame)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Failed to send notice to {}: {}", self.peer, e);
                false
            }
            Err(_) => {
                debug!("Timed out sending notice to {}", self.peer);
                false
            }
        }
    }
}

fn keepalive_interval(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ControlEvent;
    use crate::dedup::DedupStore;
    use crate::lookup::{LookupError, MetadataSource, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tabsort_common::canonical::CanonicalUrl;
    use tabsort_common::classify::LookupPayload;
    use tabsort_common::events::EventBus;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_tungstenite::MaybeTlsStream;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MetadataSource for CountingSource {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn lookup(&self, _url: &CanonicalUrl) -> Result<LookupPayload, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LookupError::Unavailable("counting".into()))
        }
    }

    async fn next_text(client: &mut Client) -> Option<String> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for server frame");
            match frame {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_streaming_session_closes_after_losing_primary() {
        let dir = TempDir::new().unwrap();
        let dedup = DedupStore::load(dir.path().join("tab_log.txt"), dir.path().join("un_log.txt"))
            .await
            .unwrap();
        let source = Arc::new(CountingSource::default());
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(dedup),
            source.clone(),
            RetryPolicy::new(1, Duration::ZERO),
            1,
            EventBus::new(8),
        ));
        let (arbiter, mut control_rx) = Arbiter::new();
        arbiter.begin_cycle();
        let ctx = Arc::new(SessionContext {
            arbiter: Arc::clone(&arbiter),
            pipeline: Arc::clone(&pipeline),
            token: "token".into(),
            handshake_timeout: Duration::from_secs(5),
            keepalive: Duration::ZERO,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            run_session(stream, port, peer, ctx, CancellationToken::new()).await;
        });

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}", port))
            .await
            .unwrap();
        client.send(Message::Text("token".into())).await.unwrap();

        match control_rx.recv().await {
            Some(ControlEvent::PrimaryEstablished { port: p, ack, .. }) => {
                assert_eq!(p, port);
                ack.send(()).unwrap();
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            next_text(&mut client).await,
            Some(Notice::Established { port }.to_json())
        );

        // Election reset underneath a streaming session
        arbiter.begin_cycle();
        client
            .send(Message::Text(
                r#"{"url":"https://youtu.be/dQw4w9WgXcQ"}"#.into(),
            ))
            .await
            .unwrap();

        assert_eq!(
            next_text(&mut client).await,
            Some(Notice::NotPrimary { primary: None }.to_json())
        );
        assert_eq!(next_text(&mut client).await, None);
        server.await.unwrap();

        pipeline.drain().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            control_rx.recv().await,
            Some(ControlEvent::PrimaryDisconnected { port: p, .. }) if p == port
        ));
    }
}
