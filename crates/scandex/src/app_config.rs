//! 🔧 App Configuration: environment variables in, one struct out.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment. The recognized keys are plain, unprefixed environment variables
//! (`INDEX_NAME`, `PUBSUB_PROJECT_ID`, ...) because that's what the deployment already sets.
//! An optional TOML file can layer on top, with the same keys in lowercase.

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use tracing::info;

use crate::backends::{ElasticsearchConfig, PubSubConfig};

/// 🔒 The only environment variables we listen to. Everything else in the env is none of our business.
const RECOGNIZED_ENV_KEYS: &[&str] = &[
    "INDEX_NAME",
    "LOG_ENABLED",
    "PUBSUB_PROJECT_ID",
    "PUBSUB_SUBSCRIPTION_ID",
    "PUBSUB_EMULATOR_HOST",
    "PUBSUB_ACCESS_TOKEN",
    "PUBSUB_MAX_OUTSTANDING_MESSAGES",
    "ELASTICSEARCH_URL",
    "ELASTICSEARCH_USERNAME",
    "ELASTICSEARCH_PASSWORD",
    "ELASTICSEARCH_API_KEY",
];

/// 🔧 The spelling older deployments still export. Read on its own, below the real one,
/// so the correctly spelled variable wins whenever both are set.
const LEGACY_SUBSCRIPTION_ENV_KEY: &str = "PUBSUB_SUBCRIPTION_ID";

/// 📦 Everything the indexer needs to know about its surroundings.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 🗄️ The index every record lands in. Required.
    pub index_name: String,
    /// 🔊 Diagnostic logging on/off. Boolean-ish, defaults to off.
    #[serde(default, deserialize_with = "deserialize_boolish")]
    pub log_enabled: bool,
    #[serde(flatten)]
    pub pubsub: PubSubConfig,
    #[serde(flatten)]
    pub elasticsearch: ElasticsearchConfig,
}

/// 🤷 Whatever shape `LOG_ENABLED` arrived in.
#[derive(Deserialize)]
#[serde(untagged)]
enum Boolish {
    Flag(bool),
    Number(i64),
    Text(String),
}

// 🔊 "true", "1", "yes" turn logging on. Everything else, including "nah", turns it off.
fn deserialize_boolish<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Boolish::deserialize(deserializer)? {
        Boolish::Flag(flag) => flag,
        Boolish::Number(n) => n == 1,
        Boolish::Text(text) => {
            let text = text.trim();
            text.eq_ignore_ascii_case("true") || text == "1" || text.eq_ignore_ascii_case("yes")
        }
    })
}

/// 🚀 Load the config from the environment, plus an optional TOML file.
///
/// - `config_file_name` is None → env vars only.
/// - `config_file_name` is Some → env vars + TOML file, merged. TOML wins on conflicts.
///
/// 💀 Missing `INDEX_NAME`, `PUBSUB_PROJECT_ID` or `PUBSUB_SUBSCRIPTION_ID` is an error, and the
/// message says which one, because figment is nice like that.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new()
        .merge(Env::raw().only(&[LEGACY_SUBSCRIPTION_ENV_KEY]).map(|_| "pubsub_subscription_id".into()))
        .merge(Env::raw().only(RECOGNIZED_ENV_KEYS));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to load configuration from file '{}' and the environment. \
             INDEX_NAME, PUBSUB_PROJECT_ID and PUBSUB_SUBSCRIPTION_ID must be set somewhere.",
            path.display()
        ),
        None => "💀 Failed to load configuration from the environment. \
                 INDEX_NAME, PUBSUB_PROJECT_ID and PUBSUB_SUBSCRIPTION_ID need to be set."
            .to_string(),
    };

    config.extract().context(context_msg)
}
