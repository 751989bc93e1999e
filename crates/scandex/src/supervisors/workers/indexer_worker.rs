//! 🎬 *[the hand-off rattles. a record slides through. somewhere, a shard sighs.]*
//!
//! 🗄️ The IndexerWorker: the processing loop. Running → (cancel) → Stopped.
//!
//! One worker, one record at a time. While an insert (retries included) is in flight, nobody
//! else gets through the hand-off. That is the throttle, and it is on purpose.
//! On cancellation it stops at the next select and drops the receiver. Anything still
//! waiting at the hand-off gets bounced back to its sender, which nacks it. 🦆

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::Worker;
use crate::handoff::HandOffReceiver;
use crate::indexer::Indexer;

#[derive(Debug)]
pub(crate) struct IndexerWorker {
    rx: HandOffReceiver<Vec<u8>>,
    indexer: Indexer,
    index_name: String,
    ct: CancellationToken,
}

impl IndexerWorker {
    pub(crate) fn new(
        rx: HandOffReceiver<Vec<u8>>,
        indexer: Indexer,
        index_name: String,
        ct: CancellationToken,
    ) -> Self {
        Self {
            rx,
            indexer,
            index_name,
            ct,
        }
    }

    async fn run(self) {
        debug!(index = %self.index_name, "📥 IndexerWorker started draining the hand-off");
        loop {
            tokio::select! {
                biased;
                _ = self.ct.cancelled() => {
                    info!("🛑 IndexerWorker: cancellation received, stopping without draining");
                    break;
                }
                next = self.rx.recv() => match next {
                    Some(record) => {
                        if let Err(err) = self.indexer.insert(&record, &self.index_name).await {
                            // 🗑️ dropped for good: no dead letters here
                            error!(
                                error = ?err,
                                record = %String::from_utf8_lossy(&record),
                                "💀 giving up on a record"
                            );
                        }
                    }
                    None => {
                        debug!("🏁 IndexerWorker: every sender is gone, nothing left to drain");
                        break;
                    }
                },
            }
        }
    }
}

impl Worker for IndexerWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            self.run().await;
            Ok(())
        })
    }
}
