//! Shared helpers for tabsort-ls integration tests
//!
//! Starts the real listener service on free local ports with a scripted
//! metadata source, and drives it with a tokio-tungstenite client.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabsort_common::canonical::CanonicalUrl;
use tabsort_common::classify::{LookupPayload, Metadata};
use tabsort_common::config::{ServiceConfig, DEFAULT_TOKEN};
use tabsort_common::events::{EventBus, TabsortEvent};
use tabsort_ls::lookup::{LookupError, MetadataSource};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(5);

/// Metadata keyed by video id; unknown ids are reported unavailable
#[derive(Default)]
pub struct FakeSource {
    entries: HashMap<String, Metadata>,
    calls: AtomicU32,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, video_id: &str, title: &str) -> Self {
        self.entries.insert(
            video_id.to_string(),
            Metadata {
                title: title.to_string(),
                ..Default::default()
            },
        );
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSource for FakeSource {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn lookup(&self, url: &CanonicalUrl) -> Result<LookupPayload, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entries
            .get(url.video_id())
            .cloned()
            .map(LookupPayload::Single)
            .ok_or_else(|| LookupError::Unavailable("Video unavailable".to_string()))
    }
}

/// Reserve `n` distinct local ports that are free right now
pub fn free_ports(n: usize) -> Vec<u16> {
    let listeners: Vec<StdTcpListener> = (0..n)
        .map(|_| StdTcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect()
}

/// Fast timings suitable for tests
pub fn test_config(data_folder: &std::path::Path, ports: Vec<u16>) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.data_folder = data_folder.to_path_buf();
    config.ports = ports;
    config.handshake_timeout = Duration::from_secs(3);
    config.lookup_backoff = Duration::from_millis(10);
    config.restart_delay = Duration::from_millis(100);
    config.empty_pool_retry = Duration::from_millis(200);
    config.keepalive = Duration::ZERO;
    config
}

/// A running listener service with its data folder and event stream
pub struct TestService {
    pub dir: TempDir,
    pub ports: Vec<u16>,
    pub source: Arc<FakeSource>,
    pub events: broadcast::Receiver<TabsortEvent>,
    shutdown: CancellationToken,
    handle: JoinHandle<tabsort_ls::Result<()>>,
}

impl TestService {
    pub async fn start(port_count: usize, source: FakeSource) -> Self {
        Self::start_with(port_count, source, |_| {}, |_| {}).await
    }

    /// Start with a config tweak and a hook to seed the data folder
    pub async fn start_with(
        port_count: usize,
        source: FakeSource,
        configure: impl FnOnce(&mut ServiceConfig),
        seed: impl FnOnce(&std::path::Path),
    ) -> Self {
        let mut service = Self::launch(port_count, source, configure, seed);
        service
            .wait_for(|e| matches!(e, TabsortEvent::PoolStarted { cycle: 1, .. }))
            .await;
        service
    }

    /// Spawn the service without waiting for its first listener pool
    pub fn launch(
        port_count: usize,
        source: FakeSource,
        configure: impl FnOnce(&mut ServiceConfig),
        seed: impl FnOnce(&std::path::Path),
    ) -> Self {
        let dir = TempDir::new().unwrap();
        seed(dir.path());

        let ports = free_ports(port_count);
        let mut config = test_config(dir.path(), ports.clone());
        configure(&mut config);

        let source = Arc::new(source);
        let event_bus = EventBus::new(256);
        let events = event_bus.subscribe();
        let shutdown = CancellationToken::new();

        let handle = {
            let source: Arc<dyn MetadataSource> = source.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tabsort_ls::run_service(&config, source, event_bus, shutdown).await
            })
        };

        Self {
            dir,
            ports,
            source,
            events,
            shutdown,
            handle,
        }
    }

    /// Wait for the first event matching `pred`, skipping others
    pub async fn wait_for(&mut self, pred: impl Fn(&TabsortEvent) -> bool) -> TabsortEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for service event")
    }

    pub fn log_contents(&self, file: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(file)).unwrap_or_default()
    }

    pub async fn stop(self) -> TempDir {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("service did not stop")
            .unwrap()
            .unwrap();
        self.dir
    }
}

pub async fn connect(port: u16) -> Client {
    let (client, _) = connect_async(format!("ws://127.0.0.1:{}", port))
        .await
        .unwrap();
    client
}

pub async fn send_text(client: &mut Client, text: &str) {
    client.send(Message::Text(text.into())).await.unwrap();
}

pub async fn send_url(client: &mut Client, url: &str) {
    send_text(client, &serde_json::json!({ "url": url }).to_string()).await;
}

/// Next text frame, or `None` once the server closes the connection
pub async fn recv_text(client: &mut Client) -> Option<String> {
    tokio::time::timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for server message")
}

/// The `message` field of the next server notice
pub async fn recv_notice(client: &mut Client) -> Option<String> {
    let text = recv_text(client).await?;
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    value["message"].as_str().map(str::to_string)
}

/// Connect and send the default token; returns the client and the reply notice
pub async fn handshake(port: u16) -> (Client, String) {
    let mut client = connect(port).await;
    send_text(&mut client, DEFAULT_TOKEN).await;
    let notice = recv_notice(&mut client).await.unwrap();
    (client, notice)
}

pub fn established(port: u16) -> String {
    format!("Connection established with primary server on port {}.", port)
}
