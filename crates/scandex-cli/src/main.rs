//! 🚀 scandex-cli: the front door. Loads config, sets up logging, then gets out of the way.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! Like a manager, it delegates everything and takes credit for the uptime. 🦆

use anyhow::{Context, Result};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 🚀 main(): where it all begins.
///
/// 🔧 Steps:
/// 1. Parse args (one optional TOML path, we're not picky)
/// 2. Load config (env vars, maybe a file on top)
/// 3. Init tracing, loud if LOG_ENABLED says so, quiet otherwise
/// 4. Run the thing until someone says stop
/// 5. Handle errors (cry, then exit 1)
#[tokio::main]
async fn main() -> Result<()> {
    // 🎯 the config file is optional. The environment is not.
    let args: Vec<String> = std::env::args().collect();
    let config_file = match args.get(1) {
        Some(path_arg) => {
            let config_file = std::path::Path::new(path_arg);
            let exists = config_file.try_exists().context(format!(
                "💀 Couldn't check whether the configuration file exists. Relative paths resolve against the cwd, so an absolute path removes all doubt. Was checking here: '{}'",
                config_file.display()
            ))?;
            if !exists {
                anyhow::bail!(
                    "💀 Configuration file '{}' does not exist. Either pass a real one or pass nothing and rely on the environment.",
                    config_file.display()
                );
            }
            Some(config_file)
        }
        None => None,
    };

    let app_config = scandex::app_config::load_config(config_file)
        .context("💀 In scandex-cli, main, we couldn't load the configuration. INDEX_NAME, PUBSUB_PROJECT_ID and PUBSUB_SUBSCRIPTION_ID are the usual suspects.")?;

    // 📡 diagnostics only when asked for. Errors always make it out.
    let filter = if app_config.log_enabled {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new("error")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = scandex::run(app_config).await {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion of sadness, one layer at a time
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("connection refused")
                || cause_str.contains("Connection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }

        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: looks like Elasticsearch or Pub/Sub isn't reachable. \
                Check ELASTICSEARCH_URL and PUBSUB_EMULATOR_HOST, and that the services are actually up. \
                `docker compose up -d` resurrects most local setups. ☕"
            );
        }

        // 🗑️ Exit with prejudice.
        std::process::exit(1);
    }

    Ok(())
}
