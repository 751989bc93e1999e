//! 📡 scandex: scan results go in from a Pub/Sub subscription, normalized records come out in
//! an Elasticsearch index. That's the whole job. 🦆
//!
//! The library exposes config loading, the decoder, and `run`. The wiring stays inside.

pub mod app_config;
mod backends;
mod handoff;
pub mod indexer;
pub mod scanning;
mod supervisors;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use app_config::AppConfig;
pub use backends::{ElasticsearchConfig, PubSubConfig, StoreError, StoreResponse};
pub use handoff::HandOffClosed;

use backends::elasticsearch::ElasticsearchClient;
use backends::pubsub::PubSubSubscription;
use supervisors::{Supervisor, shutdown_signal};

/// 🚀 Connect to both ends, then run until a shutdown signal or a fatal transport error.
pub async fn run(app_config: AppConfig) -> Result<()> {
    let store = ElasticsearchClient::new(app_config.elasticsearch)
        .context("💀 Could not build the Elasticsearch client")?;
    let subscription = PubSubSubscription::subscribe(&app_config.pubsub)
        .context("💀 Could not set up the Pub/Sub subscription")?;

    let ct = CancellationToken::new();
    tokio::spawn({
        let ct = ct.clone();
        async move {
            tokio::select! {
                signal = shutdown_signal() => match signal {
                    Ok(name) => info!(signal = name, "🛑 shutdown signal received, cancelling"),
                    Err(err) => error!(error = ?err, "💀 signal handling broke, cancelling to be safe"),
                },
                // 🏁 the pipeline already stopped on its own
                _ = ct.cancelled() => return,
            }
            ct.cancel();
        }
    });

    let result = Supervisor::new(Arc::new(subscription), Arc::new(store), app_config.index_name)
        .run(ct.clone())
        .await;
    ct.cancel();
    result
}
