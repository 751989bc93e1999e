//! 🔌 Backends: where the real I/O happens.
//!
//! 🚰 The subscription pours scan messages in, the search store swallows records out.
//! Everything in between is ours. Everything out here belongs to somebody's SDK.
//!
//! 🎭 Two collaborators, two traits:
//! - [`Subscription`]: a long-lived receive loop that calls a [`MessageHandler`] per delivery,
//!   concurrently, until cancelled or broken.
//! - [`SearchStore`]: three independent remote calls (exists, create, insert), each answering
//!   with an HTTP-ish status.
//!
//! Concrete adapters live next door: `pubsub` and `elasticsearch` for the real world,
//! `in_mem` for tests, where the real world is too expensive to invite. 🦆

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub(crate) mod elasticsearch;
pub(crate) mod pubsub;
#[cfg(test)]
pub(crate) mod in_mem;

pub use elasticsearch::ElasticsearchConfig;
pub use pubsub::PubSubConfig;

// ===== Transport side =====

/// ✅ Settles one delivery with the transport. Ack = done, nack = please send it again soon.
#[async_trait]
pub(crate) trait Acknowledger: Send + Sync + std::fmt::Debug {
    async fn ack(&self, ack_id: &str) -> Result<()>;
    async fn nack(&self, ack_id: &str) -> Result<()>;
}

/// 📨 One delivery: the payload bytes plus the handle that settles it.
///
/// Consumed by [`RawMessage::ack`] or [`RawMessage::nack`], so it can't be settled twice
/// and can't be squirreled away after the callback is done with it.
#[derive(Debug)]
pub(crate) struct RawMessage {
    id: String,
    ack_id: String,
    data: Vec<u8>,
    acknowledger: Arc<dyn Acknowledger>,
}

impl RawMessage {
    pub(crate) fn new(
        id: impl Into<String>,
        ack_id: impl Into<String>,
        data: Vec<u8>,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            id: id.into(),
            ack_id: ack_id.into(),
            data,
            acknowledger,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) async fn ack(self) -> Result<()> {
        self.acknowledger.ack(&self.ack_id).await
    }

    pub(crate) async fn nack(self) -> Result<()> {
        self.acknowledger.nack(&self.ack_id).await
    }
}

/// 🎯 The per-message callback. Called concurrently; implementations must not assume otherwise.
#[async_trait]
pub(crate) trait MessageHandler: Send + Sync {
    async fn handle(&self, message: RawMessage);
}

/// 🚰 A subscription that can be received from.
///
/// # Contract
/// - `receive` blocks until `ct` is cancelled (then returns `Ok(())` once in-flight callbacks
///   finish) or the transport hits a non-retryable failure (then returns `Err`).
/// - Retryable hiccups are the adapter's business, not the caller's.
#[async_trait]
pub(crate) trait Subscription: Send + Sync + std::fmt::Debug {
    async fn receive(&self, ct: CancellationToken, handler: Arc<dyn MessageHandler>) -> Result<()>;
}

// ===== Store side =====

/// 📬 What the store said back. Status code first, body for the postmortem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResponse {
    pub status: u16,
    pub body: String,
}

impl StoreResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 💀 A store call that didn't work out.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("📡 request to the search store never got an answer")]
    Transport(#[from] reqwest::Error),
    #[error("📡 search store answered with status {status}: {body}")]
    Status { status: u16, body: String },
    /// 🧪 A transport-style failure the in-memory store can script, since a real
    /// `reqwest::Error` can't be built by hand.
    #[cfg(test)]
    #[error("📡 search store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreResponse> for StoreError {
    fn from(response: StoreResponse) -> Self {
        StoreError::Status {
            status: response.status,
            body: response.body,
        }
    }
}

/// 🗄️ The three remote calls the pipeline needs from a search store. Nothing more.
#[async_trait]
pub(crate) trait SearchStore: Send + Sync + std::fmt::Debug {
    async fn indices_exist(&self, names: &[String]) -> Result<StoreResponse, StoreError>;
    async fn indices_create(&self, name: &str) -> Result<StoreResponse, StoreError>;
    async fn insert(&self, index: &str, body: &[u8]) -> Result<StoreResponse, StoreError>;
}
