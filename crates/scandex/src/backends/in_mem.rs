//! 🧪 In-memory backends: a store and a subscription that live entirely in RAM.
//!
//! They exist for tests. They never lose anything, they never time out, and they keep
//! receipts for every call so assertions can count. Like a very organized goldfish. 🐟

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::backends::{
    Acknowledger, MessageHandler, RawMessage, SearchStore, StoreError, StoreResponse, Subscription,
};

#[derive(Debug, Default)]
struct StoreState {
    indices: HashSet<String>,
    documents: Vec<(String, Vec<u8>)>,
    exists_script: VecDeque<Result<StoreResponse, StoreError>>,
    create_script: VecDeque<Result<StoreResponse, StoreError>>,
    insert_script: VecDeque<Result<StoreResponse, StoreError>>,
    exists_calls: usize,
    create_calls: usize,
    insert_calls: usize,
    insert_gate: Option<Arc<Semaphore>>,
}

/// 🗄️ A search store made of a HashSet and a Vec.
///
/// Without a script it behaves like a polite cluster: 404 for unknown indices, 200 on create,
/// 201 on insert. Scripted outcomes are consumed first, one per call, for the dramatic scenes.
#[derive(Debug, Default, Clone)]
pub(crate) struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut state = self.state.lock().expect("💀 in-memory store mutex poisoned");
        f(&mut state)
    }

    pub(crate) fn with_index(self, name: &str) -> Self {
        self.with_state(|s| s.indices.insert(name.to_string()));
        self
    }

    pub(crate) fn script_exists(&self, outcome: Result<StoreResponse, StoreError>) {
        self.with_state(|s| s.exists_script.push_back(outcome));
    }

    pub(crate) fn script_create(&self, outcome: Result<StoreResponse, StoreError>) {
        self.with_state(|s| s.create_script.push_back(outcome));
    }

    pub(crate) fn script_insert(&self, outcome: Result<StoreResponse, StoreError>) {
        self.with_state(|s| s.insert_script.push_back(outcome));
    }

    /// 🚦 From now on every insert waits for a permit on the returned gate before it does anything.
    pub(crate) fn hold_inserts(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.with_state(|s| s.insert_gate = Some(gate.clone()));
        gate
    }

    pub(crate) fn exists_calls(&self) -> usize {
        self.with_state(|s| s.exists_calls)
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.with_state(|s| s.create_calls)
    }

    pub(crate) fn insert_calls(&self) -> usize {
        self.with_state(|s| s.insert_calls)
    }

    pub(crate) fn has_index(&self, name: &str) -> bool {
        self.with_state(|s| s.indices.contains(name))
    }

    pub(crate) fn documents(&self) -> Vec<(String, Vec<u8>)> {
        self.with_state(|s| s.documents.clone())
    }
}

#[async_trait]
impl SearchStore for InMemoryStore {
    async fn indices_exist(&self, names: &[String]) -> Result<StoreResponse, StoreError> {
        self.with_state(|s| {
            s.exists_calls += 1;
            if let Some(outcome) = s.exists_script.pop_front() {
                return outcome;
            }
            if names.iter().all(|name| s.indices.contains(name)) {
                Ok(StoreResponse::new(200, ""))
            } else {
                Ok(StoreResponse::new(404, ""))
            }
        })
    }

    async fn indices_create(&self, name: &str) -> Result<StoreResponse, StoreError> {
        self.with_state(|s| {
            s.create_calls += 1;
            if let Some(outcome) = s.create_script.pop_front() {
                return outcome;
            }
            if s.indices.insert(name.to_string()) {
                Ok(StoreResponse::new(200, r#"{"acknowledged":true}"#))
            } else {
                Ok(StoreResponse::new(
                    400,
                    r#"{"error":{"type":"resource_already_exists_exception"},"status":400}"#,
                ))
            }
        })
    }

    async fn insert(&self, index: &str, body: &[u8]) -> Result<StoreResponse, StoreError> {
        if let Some(gate) = self.with_state(|s| s.insert_gate.clone()) {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| StoreError::Unavailable("insert gate closed".to_string()))?;
        }
        self.with_state(|s| {
            s.insert_calls += 1;
            let outcome = s
                .insert_script
                .pop_front()
                .unwrap_or_else(|| Ok(StoreResponse::new(201, r#"{"result":"created"}"#)));
            if matches!(outcome, Ok(ref response) if response.is_success()) {
                s.documents.push((index.to_string(), body.to_vec()));
            }
            outcome
        })
    }
}

/// ✅ Remembers which deliveries were acked and which were nacked.
#[derive(Debug, Default)]
pub(crate) struct InMemoryAcknowledger {
    acked: Mutex<Vec<String>>,
    nacked: Mutex<Vec<String>>,
}

impl InMemoryAcknowledger {
    pub(crate) fn acked(&self) -> Vec<String> {
        self.acked.lock().expect("💀 ack ledger poisoned").clone()
    }

    pub(crate) fn nacked(&self) -> Vec<String> {
        self.nacked.lock().expect("💀 nack ledger poisoned").clone()
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcknowledger {
    async fn ack(&self, ack_id: &str) -> Result<()> {
        self.acked.lock().expect("💀 ack ledger poisoned").push(ack_id.to_string());
        Ok(())
    }

    async fn nack(&self, ack_id: &str) -> Result<()> {
        self.nacked.lock().expect("💀 nack ledger poisoned").push(ack_id.to_string());
        Ok(())
    }
}

/// 📨 A subscription that delivers a fixed list of payloads, all at once, concurrently.
///
/// Ack ids are `ack-{position}`. After delivering, it either waits for cancellation like a
/// well-behaved transport, or fails with `fatal_error` like a badly-behaved one.
#[derive(Debug, Clone)]
pub(crate) struct InMemorySubscription {
    payloads: Arc<Mutex<Vec<Vec<u8>>>>,
    fatal_error: Option<String>,
    pub(crate) acknowledger: Arc<InMemoryAcknowledger>,
}

impl InMemorySubscription {
    pub(crate) fn new(payloads: Vec<Vec<u8>>) -> Self {
        Self {
            payloads: Arc::new(Mutex::new(payloads)),
            fatal_error: None,
            acknowledger: Arc::new(InMemoryAcknowledger::default()),
        }
    }

    pub(crate) fn failing_with(mut self, message: &str) -> Self {
        self.fatal_error = Some(message.to_string());
        self
    }

    /// 🧪 Deliver one payload outside of `receive`, for poking a handler directly.
    pub(crate) fn message(&self, ack_id: &str, payload: &[u8]) -> RawMessage {
        RawMessage::new(
            format!("msg-{ack_id}"),
            ack_id,
            payload.to_vec(),
            self.acknowledger.clone(),
        )
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn receive(&self, ct: CancellationToken, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let payloads = std::mem::take(&mut *self.payloads.lock().expect("💀 payload list poisoned"));
        let deliveries = payloads.into_iter().enumerate().map(|(position, payload)| {
            let handler = handler.clone();
            let message = self.message(&format!("ack-{position}"), &payload);
            async move { handler.handle(message).await }
        });
        futures::future::join_all(deliveries).await;

        if let Some(ref message) = self.fatal_error {
            anyhow::bail!("💀 in-memory transport exploded on purpose: {}", message);
        }
        ct.cancelled().await;
        Ok(())
    }
}
