use anyhow::{anyhow, Result as Fallible};
use clap::Parser;
use log::info;
use lupa::config::{Config, Secrets};
use lupa::investigations::Principal;
use lupa::orchestrator::Pipeline;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "lupa", version, about = "Investigation platform for Brazilian government transparency data")]
pub enum Lupa {
    /// Run the HTTP API, the orchestrator pool and the scheduler
    Server,
    /// Run a single investigation from the command line and print the result
    Investigate {
        /// Natural-language query, e.g. "analisar contratos de 2024 em MG"
        query: String,
        /// Give up waiting after this many seconds
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },
    /// Validate the configuration file and environment, then exit
    CheckConfig {
        #[arg(long)]
        file: Option<String>,
    },
    /// Drop expired entries from every cache tier
    CleanCache,
}

impl Lupa {
    pub fn run(self) -> Fallible<()> {
        match self {
            Lupa::Server => {
                let config = Config::load()?;
                let secrets = Secrets::from_env(&config);
                lupa::server::run(config, secrets)
            }
            Lupa::Investigate {
                query,
                timeout_secs,
            } => {
                // One-shot runs share the server pipeline end to end.
                ctrlc::set_handler(|| std::process::exit(1))?;

                let config = Config::load()?;
                let secrets = Secrets::from_env(&config);
                let pipeline = Arc::new(Pipeline::new(config, secrets)?);

                let principal = Principal::User("cli".into());
                let submitted = pipeline
                    .submit_query(&principal, &query, None, None, None)
                    .map_err(|kind| anyhow!("{kind}"))?;
                info!("[{}] investigating...", submitted.id);

                let done = pipeline
                    .wait_for(&submitted.id, Duration::from_secs(timeout_secs))
                    .map_err(|kind| anyhow!("{kind}"))?;
                let findings = pipeline.store.findings(&done.id)?;

                let output = serde_json::json!({
                    "investigation": done,
                    "findings": findings,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
                Ok(())
            }
            Lupa::CheckConfig { file } => Config::check(&file),
            Lupa::CleanCache => {
                ctrlc::set_handler(|| std::process::exit(1))?;

                let config = Config::load()?;
                let db = lupa::db::Database::open(config.db.pool_size)?;
                let metrics = lupa::server::metrics::Metrics::new()?;
                let cache = lupa::cache::CacheHierarchy::new(db, config, metrics)?;

                let removed = cache.clean_expired()?;
                println!("removed {removed} expired cache entries");
                Ok(())
            }
        }
    }
}
