//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 COLD OPEN: INT. SERVER ROOM, 3:47 AM
//!
//! A scanner somewhere has just knocked on port 443 of half the internet.
//! Every answer it got is now a JSON document, and every document wants a home.
//! This module is the landlord. It checks whether the building exists, builds it
//! if it doesn't, and lets tenants in one at a time.
//!
//! 🚀 Three calls, no more:
//! - `HEAD /{index}`: is it there?
//! - `PUT /{index}`: now it is.
//! - `POST /{index}/_doc`: one record, one request.
//!
//! No retries in here. Retries are the indexer's problem. This module just reports what
//! the cluster said, faithfully, like a court stenographer with a TLS stack. 🦆

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::backends::{SearchStore, StoreError, StoreResponse};

/// 📡 How to reach the cluster. Keys mirror the environment variables, flattened into the app config.
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchConfig {
    /// 📡 Scheme + host + port. `localhost:9200` without a scheme is a cry for help.
    #[serde(default = "default_elasticsearch_url")]
    pub elasticsearch_url: String,
    /// 🔒 Username for basic auth.
    #[serde(default)]
    pub elasticsearch_username: Option<String>,
    /// 🔒 Password. If it's "changeme", please change it.
    #[serde(default)]
    pub elasticsearch_password: Option<String>,
    /// 🔒 API key. Wins over basic auth when both show up.
    #[serde(default)]
    pub elasticsearch_api_key: Option<String>,
}

// 📡 the same default every Elasticsearch client on earth reaches for
fn default_elasticsearch_url() -> String {
    "http://localhost:9200".to_string()
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            elasticsearch_url: default_elasticsearch_url(),
            elasticsearch_username: None,
            elasticsearch_password: None,
            elasticsearch_api_key: None,
        }
    }
}

/// 📡 A thin REST client for the three calls the pipeline needs.
///
/// Holds one `reqwest::Client` for the life of the process, because building a new
/// connection pool per document is how you get paged.
#[derive(Debug)]
pub(crate) struct ElasticsearchClient {
    client: reqwest::Client,
    config: ElasticsearchConfig,
}

impl ElasticsearchClient {
    /// 🚀 Build the client. 10s to connect, 30s per request. Patient, but not a doormat.
    pub(crate) fn new(config: ElasticsearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("💀 The HTTP client refused to be born. Probably a TLS backend having a bad day. We can't talk to Elasticsearch without it.")?;
        Ok(Self { client, config })
    }

    // -- 🔧 trim_end_matches('/'): one slash of difference, infinite suffering of difference
    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.config.elasticsearch_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        // 🔒 api_key beats basic auth in this club
        if let Some(ref api_key) = self.config.elasticsearch_api_key {
            request.header("Authorization", format!("ApiKey {}", api_key))
        } else if let Some(ref username) = self.config.elasticsearch_username {
            request.basic_auth(username, self.config.elasticsearch_password.as_ref())
        } else {
            request
        }
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<StoreResponse, StoreError> {
        let response = self.authorize(request).send().await?;
        let status = response.status().as_u16();
        // -- HEAD has no body; an unreadable body is not worth failing a status over
        let body = response.text().await.unwrap_or_default();
        trace!(status, "📬 Elasticsearch answered");
        Ok(StoreResponse { status, body })
    }
}

#[async_trait]
impl SearchStore for ElasticsearchClient {
    async fn indices_exist(&self, names: &[String]) -> Result<StoreResponse, StoreError> {
        let url = self.url_for(&names.join(","));
        debug!(%url, "🔍 checking whether the index exists");
        self.execute(self.client.head(&url)).await
    }

    async fn indices_create(&self, name: &str) -> Result<StoreResponse, StoreError> {
        let url = self.url_for(name);
        debug!(%url, "🏗️ creating index");
        self.execute(self.client.put(&url)).await
    }

    async fn insert(&self, index: &str, body: &[u8]) -> Result<StoreResponse, StoreError> {
        let url = self.url_for(&format!("{}/_doc", index));
        let request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body.to_vec());
        self.execute(request).await
    }
}
