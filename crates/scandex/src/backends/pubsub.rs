//! 📨 Google Pub/Sub, spoken over plain REST.
//!
//! 🎬 *[a subscription. a pull request. not that kind of pull request.]*
//!
//! The receive loop pulls batches with `:pull`, fans each message out to the handler in
//! its own task (so callbacks really do run concurrently), and settles them with
//! `:acknowledge` or `:modifyAckDeadline` (deadline 0 = nack = redeliver soon).
//!
//! 🧠 Knowledge graph:
//! - `PUBSUB_EMULATOR_HOST` set → plain HTTP, no auth, like the official clients.
//! - Otherwise → `https://pubsub.googleapis.com` with an optional bearer token.
//! - Network errors, 429 and 5xx are retried after a short, cancellable pause.
//! - Anything else that isn't 2xx (403, 404 subscription gone...) ends the loop with an error.
//! - At most `pubsub_max_outstanding_messages` callbacks run at once. Pull asks for no more
//!   than the free room.
//! - Every pulled message is leased until it is settled: a background task pushes its ack
//!   deadline out with `:modifyAckDeadline` every few seconds, so a callback stuck behind a slow
//!   insert doesn't get its message redelivered to someone else mid-flight.
//! - `PUBSUB_ACCESS_TOKEN` is used as given and never refreshed. A 401 is fatal, so an expired
//!   token ends the process and whatever restarts it has to hand over a fresh one. 🦆

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backends::{Acknowledger, MessageHandler, RawMessage, Subscription};

const PUBSUB_API_URL: &str = "https://pubsub.googleapis.com";
// ⏱️ how long to sit out after an empty pull or a retryable failure
const EMPTY_PULL_PAUSE: Duration = Duration::from_millis(250);
const RETRY_PULL_PAUSE: Duration = Duration::from_millis(500);
// 🕰️ the subscription default deadline is 10s, so refresh well inside it
const LEASE_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const LEASE_DEADLINE_SECONDS: u32 = 60;
// -- modifyAckDeadline refuses more ids than this in one request
const MAX_ACK_IDS_PER_REQUEST: usize = 2500;

/// 📨 Where the scans come from. Keys mirror the environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct PubSubConfig {
    pub pubsub_project_id: String,
    /// 🔧 Older deployments spell the env var `PUBSUB_SUBCRIPTION_ID`. The config loader maps
    /// it onto this key, and the correct spelling wins when both are set. Nobody is judged.
    pub pubsub_subscription_id: String,
    #[serde(default)]
    pub pubsub_emulator_host: Option<String>,
    #[serde(default)]
    pub pubsub_access_token: Option<String>,
    #[serde(default = "default_max_outstanding_messages")]
    pub pubsub_max_outstanding_messages: usize,
}

// 🔧 ten callbacks at a time: enough to keep the decoder busy, not enough to anger anyone
fn default_max_outstanding_messages() -> usize {
    10
}

// ===== wire types =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: [&'a str; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: &'a [&'a str],
    ack_deadline_seconds: u32,
}

/// 🚦 Why a pull didn't produce messages, and whether it's worth asking again.
#[derive(Debug)]
enum PullFailure {
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

// ===== the REST surface =====

/// 📡 The handful of REST calls we make against one subscription.
#[derive(Debug)]
struct PubSubApi {
    client: reqwest::Client,
    base_url: String,
    subscription_path: String,
    access_token: Option<String>,
    /// 🔒 ack ids pulled but not yet settled. The lease keeper extends exactly these.
    leases: Mutex<HashSet<String>>,
}

impl PubSubApi {
    fn method_url(&self, method: &str) -> String {
        format!("{}/v1/{}:{}", self.base_url, self.subscription_path, method)
    }

    async fn call<B: Serialize>(&self, method: &str, body: &B) -> reqwest::Result<reqwest::Response> {
        let mut request = self
            .client
            .post(self.method_url(method))
            .header("Content-Type", "application/json")
            // -- serializing our own tiny request structs cannot fail; an empty object would be rejected upstream anyway
            .body(serde_json::to_vec(body).unwrap_or_default());
        if let Some(ref token) = self.access_token {
            request = request.bearer_auth(token);
        }
        request.send().await
    }

    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, PullFailure> {
        let response = self
            .call("pull", &PullRequest { max_messages })
            .await
            .map_err(|err| {
                PullFailure::Retryable(anyhow::Error::new(err).context("📡 pull request never made it to Pub/Sub"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = anyhow!(
                "💀 Pub/Sub answered the pull on '{}' with {}: {}",
                self.subscription_path,
                status,
                body
            );
            return Err(
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    PullFailure::Retryable(err)
                } else {
                    PullFailure::Fatal(err)
                },
            );
        }

        let bytes = response.bytes().await.map_err(|err| {
            PullFailure::Retryable(anyhow::Error::new(err).context("📡 pull response body got lost on the way"))
        })?;
        let parsed: PullResponse = serde_json::from_slice(&bytes).map_err(|err| {
            PullFailure::Retryable(anyhow::Error::new(err).context("💀 pull response is not the JSON we were promised"))
        })?;
        Ok(parsed.received_messages)
    }

    async fn lease(&self, ack_ids: impl IntoIterator<Item = String>) {
        self.leases.lock().await.extend(ack_ids);
    }

    async fn release(&self, ack_id: &str) {
        self.leases.lock().await.remove(ack_id);
    }

    /// 🕰️ Push the deadline of every unsettled message out to `deadline_seconds` from now.
    async fn extend_leases(&self, deadline_seconds: u32) -> Result<()> {
        let outstanding: Vec<String> = self.leases.lock().await.iter().cloned().collect();
        for chunk in outstanding.chunks(MAX_ACK_IDS_PER_REQUEST) {
            let ack_ids: Vec<&str> = chunk.iter().map(String::as_str).collect();
            self.settle(
                "modifyAckDeadline",
                &ModifyAckDeadlineRequest {
                    ack_ids: &ack_ids,
                    ack_deadline_seconds: deadline_seconds,
                },
            )
            .await?;
            trace!(count = ack_ids.len(), deadline_seconds, "🕰️ leases extended");
        }
        Ok(())
    }

    async fn settle<B: Serialize>(&self, method: &str, body: &B) -> Result<()> {
        let response = self
            .call(method, body)
            .await
            .with_context(|| format!("📡 {} request never made it to Pub/Sub", method))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("💀 Pub/Sub rejected {} with {}: {}", method, status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for PubSubApi {
    async fn ack(&self, ack_id: &str) -> Result<()> {
        self.release(ack_id).await;
        self.settle("acknowledge", &AcknowledgeRequest { ack_ids: [ack_id] })
            .await
    }

    async fn nack(&self, ack_id: &str) -> Result<()> {
        self.release(ack_id).await;
        // 🔄 deadline zero: "not now, send it to someone else, quickly"
        self.settle(
            "modifyAckDeadline",
            &ModifyAckDeadlineRequest {
                ack_ids: &[ack_id],
                ack_deadline_seconds: 0,
            },
        )
        .await
    }
}

// ===== the subscription =====

/// 🚰 A Pub/Sub subscription we can `receive` from.
#[derive(Debug)]
pub(crate) struct PubSubSubscription {
    api: Arc<PubSubApi>,
    max_outstanding: usize,
    lease_refresh: Duration,
    lease_deadline_seconds: u32,
}

impl PubSubSubscription {
    /// 🚀 Point at `projects/{project}/subscriptions/{subscription}`. No network calls yet.
    pub(crate) fn subscribe(config: &PubSubConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            // -- pulls can long-poll, so give them room to breathe
            .timeout(Duration::from_secs(90))
            .build()
            .context("💀 The HTTP client for Pub/Sub refused to be born. Check the TLS setup of this box.")?;

        let (base_url, access_token) = match config.pubsub_emulator_host {
            Some(ref host) if host.starts_with("http://") || host.starts_with("https://") => {
                (host.trim_end_matches('/').to_string(), None)
            }
            Some(ref host) => (format!("http://{}", host.trim_end_matches('/')), None),
            None => (PUBSUB_API_URL.to_string(), config.pubsub_access_token.clone()),
        };
        let subscription_path = format!(
            "projects/{}/subscriptions/{}",
            config.pubsub_project_id, config.pubsub_subscription_id
        );
        info!(%base_url, %subscription_path, "📨 subscribed");

        Ok(Self {
            api: Arc::new(PubSubApi {
                client,
                base_url,
                subscription_path,
                access_token,
                leases: Mutex::new(HashSet::new()),
            }),
            max_outstanding: config.pubsub_max_outstanding_messages.max(1),
            lease_refresh: LEASE_REFRESH_INTERVAL,
            lease_deadline_seconds: LEASE_DEADLINE_SECONDS,
        })
    }

    #[cfg(test)]
    fn with_lease_timing(mut self, refresh: Duration, deadline_seconds: u32) -> Self {
        self.lease_refresh = refresh;
        self.lease_deadline_seconds = deadline_seconds;
        self
    }

    /// 📦 Turn one pulled message into a `RawMessage`, or hand back its ack id if the data is mangled.
    fn unwrap_received(&self, received: ReceivedMessage) -> Result<RawMessage, (String, base64::DecodeError)> {
        match STANDARD.decode(received.message.data.as_bytes()) {
            Ok(data) => Ok(RawMessage::new(
                received.message.message_id,
                received.ack_id,
                data,
                self.api.clone(),
            )),
            Err(err) => Err((received.ack_id, err)),
        }
    }
}

/// ⏱️ Sleep unless cancelled first. `true` means the token fired.
async fn pause_or_cancelled(ct: &CancellationToken, how_long: Duration) -> bool {
    tokio::select! {
        _ = ct.cancelled() => true,
        _ = tokio::time::sleep(how_long) => false,
    }
}

/// 🕰️ Keep extending leases until `stop` fires. Failures are logged; the worst case is an early redelivery.
async fn keep_leases(api: Arc<PubSubApi>, stop: CancellationToken, every: Duration, deadline_seconds: u32) {
    while !pause_or_cancelled(&stop, every).await {
        if let Err(err) = api.extend_leases(deadline_seconds).await {
            warn!(error = ?err, "⚠️ lease extension failed; some messages may be redelivered early");
        }
    }
}

fn reap(joined: Option<Result<(), tokio::task::JoinError>>) {
    if let Some(Err(err)) = joined {
        warn!(error = %err, "💀 a message callback panicked or was aborted");
    }
}

#[async_trait]
impl Subscription for PubSubSubscription {
    async fn receive(&self, ct: CancellationToken, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        // -- its own token: leases must outlive `ct` until the in-flight callbacks have settled
        let stop_leases = CancellationToken::new();
        let lease_keeper = tokio::spawn(keep_leases(
            self.api.clone(),
            stop_leases.clone(),
            self.lease_refresh,
            self.lease_deadline_seconds,
        ));
        let stop_leases = stop_leases.drop_guard();

        let outcome = loop {
            while let Some(joined) = in_flight.try_join_next() {
                reap(Some(joined));
            }

            if in_flight.len() >= self.max_outstanding {
                // 🚦 full house: wait for a callback to finish before pulling more
                tokio::select! {
                    biased;
                    _ = ct.cancelled() => break Ok(()),
                    joined = in_flight.join_next() => {
                        reap(joined);
                        continue;
                    }
                }
            }

            let room = self.max_outstanding - in_flight.len();
            let pulled = tokio::select! {
                biased;
                _ = ct.cancelled() => break Ok(()),
                pulled = self.api.pull(room) => pulled,
            };

            match pulled {
                Ok(messages) if messages.is_empty() => {
                    if pause_or_cancelled(&ct, EMPTY_PULL_PAUSE).await {
                        break Ok(());
                    }
                }
                Ok(messages) => {
                    debug!(count = messages.len(), "📥 pulled a batch");
                    self.api
                        .lease(messages.iter().map(|received| received.ack_id.clone()))
                        .await;
                    for received in messages {
                        match self.unwrap_received(received) {
                            Ok(message) => {
                                let handler = handler.clone();
                                in_flight.spawn(async move { handler.handle(message).await });
                            }
                            Err((ack_id, err)) => {
                                warn!(error = %err, "💀 Pub/Sub delivered data that isn't base64; nacking");
                                if let Err(err) = self.api.nack(&ack_id).await {
                                    warn!(error = ?err, "⚠️ nack failed; the ack deadline will do it for us");
                                }
                            }
                        }
                    }
                }
                Err(PullFailure::Retryable(err)) => {
                    warn!(error = ?err, "🔄 pull failed, will try again");
                    if pause_or_cancelled(&ct, RETRY_PULL_PAUSE).await {
                        break Ok(());
                    }
                }
                Err(PullFailure::Fatal(err)) => break Err(err),
            }
        };

        // 🏁 no new pulls; let the callbacks we already started finish their business
        debug!(in_flight = in_flight.len(), "⏳ waiting for in-flight callbacks");
        while let Some(joined) = in_flight.join_next().await {
            reap(Some(joined));
        }
        drop(stop_leases);
        if let Err(err) = lease_keeper.await {
            warn!(error = %err, "💀 the lease keeper panicked or was aborted");
        }
        outcome
    }
}
