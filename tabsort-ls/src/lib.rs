//! tabsort listener service
//!
//! Local companion for the tabsort browser extension. The extension
//! connects over WebSocket to one of several candidate ports, proves
//! itself with a shared token, and then streams the URLs of pages it
//! visits. Each new video URL is looked up, classified as music or
//! non-music, and appended to the matching log exactly once.

pub mod arbiter;
pub mod console;
pub mod dedup;
pub mod error;
pub mod lookup;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

use arbiter::{Arbiter, Controller, ControllerConfig};
use dedup::DedupStore;
use lookup::{MetadataSource, RetryPolicy};
use pipeline::Pipeline;
use session::SessionContext;
use std::sync::Arc;
use std::time::Duration;
use tabsort_common::config::{ensure_data_folder, ServiceConfig};
use tabsort_common::events::EventBus;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Upper bound for finishing in-flight lookups at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the listener service until `shutdown` is cancelled
///
/// Loads the classification logs before any port is bound; a data folder
/// that cannot be created or a log that cannot be read is returned as an
/// error. After that, only `shutdown` ends the service.
pub async fn run_service(
    config: &ServiceConfig,
    source: Arc<dyn MetadataSource>,
    event_bus: EventBus,
    shutdown: CancellationToken,
) -> Result<()> {
    config.validate()?;
    ensure_data_folder(&config.data_folder)?;

    let dedup = Arc::new(
        DedupStore::load(config.music_log_path(), config.non_music_log_path()).await?,
    );
    let (music, non_music) = dedup.counts().await;
    info!(
        "Dedup index ready: {} music, {} non-music links",
        music, non_music
    );

    let pipeline = Arc::new(Pipeline::new(
        dedup,
        source,
        RetryPolicy::new(config.lookup_attempts, config.lookup_backoff),
        config.max_concurrent_lookups,
        event_bus.clone(),
    ));

    let (arbiter, control_rx) = Arbiter::new();
    let session_ctx = Arc::new(SessionContext {
        arbiter: Arc::clone(&arbiter),
        pipeline: Arc::clone(&pipeline),
        token: config.token.clone(),
        handshake_timeout: config.handshake_timeout,
        keepalive: config.keepalive,
    });

    let controller = Controller::new(
        arbiter,
        control_rx,
        session_ctx,
        ControllerConfig {
            bind_host: config.bind_host.clone(),
            ports: config.ports.clone(),
            restart_delay: config.restart_delay,
            empty_pool_retry: config.empty_pool_retry,
        },
        event_bus,
    );
    controller.run(shutdown).await;

    if tokio::time::timeout(DRAIN_TIMEOUT, pipeline.drain())
        .await
        .is_err()
    {
        warn!(
            "Abandoning lookups still running after {:?}",
            DRAIN_TIMEOUT
        );
    }
    info!("Listener service stopped");
    Ok(())
}
