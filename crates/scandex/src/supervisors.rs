//! 🎬 *[camera pans across a topic full of scans. an index waits. a token hangs by a thread.]*
//!
//! 📦 The Supervisor: part middle manager, part stage manager.
//!
//! It decides the order things happen in, which is the only interesting thing it does:
//! 1. make sure the index exists (fatal if not: we don't ingest into the unknown),
//! 2. open the hand-off,
//! 3. start the indexer worker, then the consumer worker,
//! 4. wait for the consumer to return (cancelled or broken),
//! 5. wait for the indexer to notice and stop too.
//!
//! ⚠️ The workers stay private. The supervisor is the only one who talks to them.

mod workers;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backends::{SearchStore, Subscription};
use crate::handoff::rendezvous;
use crate::indexer::Indexer;
use workers::{ConsumerWorker, IndexerWorker, Worker};

/// 📦 Owns the two collaborators and the name of the index they meet at.
#[derive(Debug)]
pub(crate) struct Supervisor {
    subscription: Arc<dyn Subscription>,
    store: Arc<dyn SearchStore>,
    index_name: String,
}

impl Supervisor {
    pub(crate) fn new(
        subscription: Arc<dyn Subscription>,
        store: Arc<dyn SearchStore>,
        index_name: String,
    ) -> Self {
        Self {
            subscription,
            store,
            index_name,
        }
    }

    /// 🧵 Run the pipeline until `ct` is cancelled or the transport gives up for good.
    pub(crate) async fn run(self, ct: CancellationToken) -> Result<()> {
        let indexer = Indexer::new(self.store);
        indexer
            .ensure_index(&self.index_name)
            .await
            .context("💀 Could not make sure the target index exists. Refusing to ingest into a void.")?;

        let (tx, rx) = rendezvous::<Vec<u8>>();

        info!(index = %self.index_name, "🚀 Starting indexer");
        let indexer_handle = IndexerWorker::new(rx, indexer, self.index_name.clone(), ct.clone()).start();

        info!("🚀 Starting consumer");
        let consumer_result = ConsumerWorker::new(self.subscription, tx, ct.clone())
            .start()
            .await
            .context("💀 ConsumerWorker task panicked or was aborted")
            .and_then(|result| result);

        if let Err(ref err) = consumer_result {
            error!(error = ?err, "💀 consumer stopped with an error, shutting the indexer down too");
            ct.cancel();
        }

        indexer_handle
            .await
            .context("💀 IndexerWorker task panicked or was aborted")??;
        consumer_result?;

        info!("✅ Shutdown complete.");
        Ok(())
    }
}

/// 🛑 Resolve on Ctrl-C or SIGTERM, whichever the orchestrator sends first.
#[cfg(unix)]
pub(crate) async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("💀 could not install the SIGTERM handler")?;
    tokio::select! {
        ctrl_c = tokio::signal::ctrl_c() => {
            ctrl_c.context("💀 could not listen for Ctrl-C")?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

/// 🛑 Resolve on Ctrl-C. No SIGTERM out here.
#[cfg(not(unix))]
pub(crate) async fn shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("💀 could not listen for Ctrl-C")?;
    Ok("Ctrl-C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::{InMemoryStore, InMemorySubscription};
    use crate::backends::{StoreError, StoreResponse};
    use std::time::Duration;

    const V1_HELLO: &[u8] = br#"{"ip":"1.1.1.1","port":1,"service":"HTTP","timestamp":1234,"data_version":1,"data":{"response_bytes_utf8":"aGVsbG8="}}"#;
    const V2_HELLO: &[u8] = br#"{"ip":"1.1.1.1","port":1,"service":"HTTP","timestamp":1234,"data_version":2,"data":{"response_str":"hello"}}"#;
    const NORMALIZED_HELLO: &[u8] = br#"{"ip":"1.1.1.1","port":1,"service":"HTTP","timestamp":1234,"response":"hello"}"#;

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("💀 condition never became true. The pipeline is stuck, or the test is wrong.");
    }

    #[tokio::test]
    async fn the_one_where_scans_go_in_one_end_and_records_come_out_the_other() -> anyhow::Result<()> {
        let subscription = Arc::new(InMemorySubscription::new(vec![
            V1_HELLO.to_vec(),
            b"invalid json".to_vec(),
            V2_HELLO.to_vec(),
        ]));
        let store = InMemoryStore::new();
        let ct = CancellationToken::new();

        let running = tokio::spawn(
            Supervisor::new(subscription.clone(), Arc::new(store.clone()), "scans".to_string()).run(ct.clone()),
        );

        wait_for(|| store.documents().len() == 2 && subscription.acknowledger.acked().len() == 2).await;
        ct.cancel();
        tokio::time::timeout(Duration::from_secs(5), running).await???;

        assert!(store.has_index("scans"));
        assert_eq!(store.create_calls(), 1);
        assert_eq!(
            store.documents(),
            vec![
                ("scans".to_string(), NORMALIZED_HELLO.to_vec()),
                ("scans".to_string(), NORMALIZED_HELLO.to_vec()),
            ]
        );
        let mut acked = subscription.acknowledger.acked();
        acked.sort();
        assert_eq!(acked, vec!["ack-0".to_string(), "ack-2".to_string()]);
        assert_eq!(subscription.acknowledger.nacked(), vec!["ack-1".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_index_cannot_be_verified_and_nothing_is_consumed() {
        let subscription = Arc::new(InMemorySubscription::new(vec![V2_HELLO.to_vec()]));
        let store = InMemoryStore::new();
        store.script_exists(Err(StoreError::Unavailable("connection refused".to_string())));

        let result = Supervisor::new(subscription.clone(), Arc::new(store.clone()), "scans".to_string())
            .run(CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert_eq!(store.create_calls(), 0);
        assert_eq!(store.insert_calls(), 0);
        assert!(subscription.acknowledger.acked().is_empty());
        assert!(subscription.acknowledger.nacked().is_empty());
    }

    #[tokio::test]
    async fn the_one_where_a_dead_transport_takes_the_whole_show_down() {
        let subscription = Arc::new(InMemorySubscription::new(vec![V2_HELLO.to_vec()]).failing_with("subscription deleted"));
        let store = InMemoryStore::new().with_index("scans");
        let ct = CancellationToken::new();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Supervisor::new(subscription, Arc::new(store.clone()), "scans".to_string()).run(ct.clone()),
        )
        .await
        .expect("💀 supervisor hung after the transport died");

        let err = result.expect_err("💀 a fatal transport error must reach the caller");
        assert!(format!("{:#}", err).contains("subscription deleted"));
        assert!(ct.is_cancelled());
        assert_eq!(store.documents().len(), 1);
    }

    #[tokio::test]
    async fn the_one_where_an_exhausted_insert_is_dropped_but_the_message_was_acked() -> anyhow::Result<()> {
        let subscription = Arc::new(InMemorySubscription::new(vec![V2_HELLO.to_vec()]));
        let store = InMemoryStore::new().with_index("scans");
        for _ in 0..crate::indexer::MAX_INSERT_ATTEMPTS {
            store.script_insert(Ok(StoreResponse::new(503, "unavailable")));
        }
        let ct = CancellationToken::new();

        let running = tokio::spawn(
            Supervisor::new(subscription.clone(), Arc::new(store.clone()), "scans".to_string()).run(ct.clone()),
        );

        wait_for(|| store.insert_calls() == 5 && subscription.acknowledger.acked().len() == 1).await;
        ct.cancel();
        tokio::time::timeout(Duration::from_secs(5), running).await???;

        assert!(store.documents().is_empty());
        assert!(subscription.acknowledger.nacked().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_shutdown_bounces_the_record_still_waiting_at_the_hand_off() -> anyhow::Result<()> {
        let subscription = Arc::new(InMemorySubscription::new(vec![V2_HELLO.to_vec(), V1_HELLO.to_vec()]));
        let store = InMemoryStore::new().with_index("scans");
        let gate = store.hold_inserts();
        let ct = CancellationToken::new();

        let running = tokio::spawn(
            Supervisor::new(subscription.clone(), Arc::new(store.clone()), "scans".to_string()).run(ct.clone()),
        );

        // 🧪 one record taken and stuck mid-insert, the other one queued behind it
        wait_for(|| subscription.acknowledger.acked().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        ct.cancel();
        gate.add_permits(1);
        tokio::time::timeout(Duration::from_secs(5), running).await???;

        let acked = subscription.acknowledger.acked();
        let nacked = subscription.acknowledger.nacked();
        assert_eq!(acked.len(), 1);
        assert_eq!(nacked.len(), 1);
        assert_ne!(acked, nacked);
        // 🎯 the taken record still lands; the bounced one waits for redelivery instead of vanishing
        assert_eq!(store.documents(), vec![("scans".to_string(), NORMALIZED_HELLO.to_vec())]);
        Ok(())
    }
}
