//! 🎬 *[a thousand scanners shout into a topic. one worker listens.]*
//!
//! 📨 The ConsumerWorker: drives the subscription's receive loop until cancelled.
//!
//! Per message, inside the transport's (concurrent) callback:
//! 1. decode. Garbage → nack, so the transport can redeliver it quickly and we move on.
//! 2. hand the normalized bytes off, waiting until the indexer takes them.
//! 3. ack, only after the hand-off completed. If the hand-off is closed (shutdown), nack instead.
//!
//! ⚠️ Ack means "the indexer has it", not "it's in the index". An insert that later exhausts
//! its retries is logged and gone. That's the accounting, on purpose, written down here so
//! nobody has to discover it at 3am. 🦆

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Worker;
use crate::backends::{MessageHandler, RawMessage, Subscription};
use crate::handoff::HandOffSender;
use crate::scanning;

/// 🎯 The per-message callback: decode, forward, settle.
#[derive(Debug)]
pub(crate) struct ScanForwarder {
    tx: HandOffSender<Vec<u8>>,
}

impl ScanForwarder {
    pub(crate) fn new(tx: HandOffSender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl MessageHandler for ScanForwarder {
    async fn handle(&self, message: RawMessage) {
        let record = match scanning::decode(message.data()) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    message_id = message.id(),
                    error = ?err,
                    payload = %String::from_utf8_lossy(message.data()),
                    "💀 failed to parse message, nacking for redelivery"
                );
                if let Err(err) = message.nack().await {
                    warn!(error = ?err, "⚠️ nack failed");
                }
                return;
            }
        };

        match self.tx.send(record).await {
            Ok(()) => {
                if let Err(err) = message.ack().await {
                    warn!(error = ?err, "⚠️ ack failed; the transport will redeliver a record we already handed off");
                }
            }
            Err(closed) => {
                debug!(message_id = message.id(), reason = %closed, "🔄 indexer is gone, nacking so the message comes back later");
                if let Err(err) = message.nack().await {
                    warn!(error = ?err, "⚠️ nack failed");
                }
            }
        }
    }
}

/// 📨 Owns the subscription and the forwarding side of the hand-off.
#[derive(Debug)]
pub(crate) struct ConsumerWorker {
    subscription: Arc<dyn Subscription>,
    tx: HandOffSender<Vec<u8>>,
    ct: CancellationToken,
}

impl ConsumerWorker {
    pub(crate) fn new(subscription: Arc<dyn Subscription>, tx: HandOffSender<Vec<u8>>, ct: CancellationToken) -> Self {
        Self { subscription, tx, ct }
    }
}

impl Worker for ConsumerWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📨 ConsumerWorker started receiving");
            let handler: Arc<dyn MessageHandler> = Arc::new(ScanForwarder::new(self.tx));
            self.subscription
                .receive(self.ct, handler)
                .await
                .context("💀 The subscription's receive loop died with a non-retryable error. No more scans are coming in.")?;
            info!("🏁 ConsumerWorker: receive loop returned after cancellation");
            Ok(())
        })
    }
}
