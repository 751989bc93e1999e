//! 🗄️ The Indexer: makes sure the index exists, then shoves records into it.
//!
//! 🎬 *[the index did not exist. and then, one PUT later, it did.]*
//!
//! Two jobs, both small, both with opinions:
//! - [`Indexer::ensure_index`] runs once at startup. Absent index → create it. Present → do nothing.
//! - [`Indexer::insert`] writes one record with a budget of [`MAX_INSERT_ATTEMPTS`] back-to-back
//!   attempts. No sleeping between them: the processing loop is single-threaded and every
//!   millisecond spent here is a millisecond the consumers are stuck at the hand-off.
//!
//! ⚠️ After the budget runs out the record is gone. No dead letters, no requeue. The caller
//! logs it and moves on. Sustained store outages therefore drop data, loudly, in the logs. 🦆

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::backends::{SearchStore, StoreError, StoreResponse};

/// 🔄 Total attempts per record, first try included.
pub const MAX_INSERT_ATTEMPTS: usize = 5;

/// 💀 What can go wrong between us and the index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("💀 could not verify that index '{index}' exists")]
    ExistenceCheck {
        index: String,
        #[source]
        source: StoreError,
    },
    #[error("💀 request to create index '{index}' failed")]
    Create {
        index: String,
        #[source]
        source: StoreError,
    },
    #[error("💀 Elasticsearch refused to create index '{index}' (status {status}): {body}")]
    CreateRejected {
        index: String,
        status: u16,
        body: String,
    },
    #[error("💀 failed to insert into '{index}' after {attempts} attempts")]
    InsertExhausted {
        index: String,
        attempts: usize,
        #[source]
        source: StoreError,
    },
}

/// 🗄️ Index lifecycle + insertion, on top of any [`SearchStore`].
#[derive(Debug, Clone)]
pub(crate) struct Indexer {
    store: Arc<dyn SearchStore>,
}

impl Indexer {
    pub(crate) fn new(store: Arc<dyn SearchStore>) -> Self {
        Self { store }
    }

    /// 🏗️ Query existence; create if absent. Idempotent.
    ///
    /// - 2xx on the existence check: it's there, we're done, zero create calls.
    /// - 404: create it, exactly once.
    /// - anything else, or no answer at all: surfaced, and no creation is attempted.
    /// - create answering `resource_already_exists_exception`: someone beat us to it. Fine.
    pub(crate) async fn ensure_index(&self, index: &str) -> Result<(), IndexError> {
        let exists = self
            .store
            .indices_exist(&[index.to_string()])
            .await
            .map_err(|source| IndexError::ExistenceCheck {
                index: index.to_string(),
                source,
            })?;

        if exists.is_success() {
            debug!(index, "✅ index already exists, nothing to build");
            return Ok(());
        }
        if exists.status != 404 {
            return Err(IndexError::ExistenceCheck {
                index: index.to_string(),
                source: StoreError::from(exists),
            });
        }

        info!(index, "🏗️ index not found, creating it");
        let created = self
            .store
            .indices_create(index)
            .await
            .map_err(|source| IndexError::Create {
                index: index.to_string(),
                source,
            })?;

        if created.is_success() || already_exists(&created) {
            info!(index, status = created.status, "✅ index is ready");
            Ok(())
        } else {
            Err(IndexError::CreateRejected {
                index: index.to_string(),
                status: created.status,
                body: created.body,
            })
        }
    }

    /// 📡 Write one record, up to [`MAX_INSERT_ATTEMPTS`] times, no delay. First success wins.
    ///
    /// A transport error and a non-2xx answer both count as a failed attempt. When the budget
    /// is spent, the error carries the index name and the last failure.
    pub(crate) async fn insert(&self, record: &[u8], index: &str) -> Result<(), IndexError> {
        let mut attempt = 1;
        loop {
            let failure = match self.store.insert(index, record).await {
                Ok(response) if response.is_success() => {
                    trace!(index, attempt, "🚀 record indexed");
                    return Ok(());
                }
                Ok(response) => StoreError::from(response),
                Err(err) => err,
            };

            if attempt >= MAX_INSERT_ATTEMPTS {
                return Err(IndexError::InsertExhausted {
                    index: index.to_string(),
                    attempts: attempt,
                    source: failure,
                });
            }
            warn!(index, attempt, error = %failure, "🔄 insert attempt failed, going again");
            attempt += 1;
        }
    }
}

// -- ES answers a racing create with 400 + this exception type; the index is there, which is all we wanted
fn already_exists(response: &StoreResponse) -> bool {
    response.status == 400 && response.body.contains("resource_already_exists_exception")
}
