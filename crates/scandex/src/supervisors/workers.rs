//! 🧵 Workers: the two loops that actually do the work while the Supervisor takes the credit.
//!
//! - `ConsumerWorker`: drives the subscription, decodes, hands off, settles each message.
//! - `IndexerWorker`: drains the hand-off, one record at a time, into the store.
//!
//! They never talk directly. The hand-off is the only thing they share, plus the
//! cancellation token that tells them both to go home. 🦆

use anyhow::Result;
use tokio::task::JoinHandle;

mod consumer_worker;
mod indexer_worker;

pub(crate) use consumer_worker::ConsumerWorker;
pub(crate) use indexer_worker::IndexerWorker;

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    /// 🚀 Start the worker on the runtime. The handle resolves when the loop has stopped.
    fn start(self) -> JoinHandle<Result<()>>;
}
