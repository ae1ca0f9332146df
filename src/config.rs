use crate::prelude::*;
use std::collections::HashMap;
use std::env;
use std::ffi::OsStr;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

fn default_config_file() -> PathBuf {
    env::var_os("LUPA_CONFIG")
        .unwrap_or_else(|| OsStr::new("config.toml").to_os_string())
        .into()
}

#[derive(Debug, thiserror::Error)]
#[error("the configuration file has errors")]
pub struct BadConfig;

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    pub rate_limit: RateLimitConfig,
    /// Static auth tokens. Users see only their own investigations; services
    /// (scheduler, ops tooling) see everything.
    #[serde(default)]
    pub user_tokens: HashMap<String, String>,
    #[serde(default)]
    pub service_tokens: HashMap<String, String>,
}

fn default_bind() -> String {
    "127.0.0.1:8000".into()
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OrchestratorConfig {
    /// Bounded investigation queue; a full queue sheds load with a
    /// slow-down response instead of building an unbounded backlog.
    pub queue_size: usize,
    pub executor_threads: usize,
    pub investigation_timeout_secs: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkersConfig {
    pub quality_threshold_default: f64,
    pub max_reflection_iterations: u32,
    /// Idle worker instances older than this are torn down by the pool.
    pub idle_ttl_secs: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    pub ttl_short_secs: u64,
    pub ttl_medium_secs: u64,
    pub ttl_long_secs: u64,
    pub l1_capacity: usize,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FederationConfig {
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_window_secs: u64,
    pub breaker_cooldown_secs: u64,
    pub breaker_cooldown_cap_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub leader_lease_ttl_secs: u64,
    pub tick_secs: u64,
    /// Completed investigations older than this are eligible for the
    /// reanalyze-stale job.
    pub reanalyze_after_days: i64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DbConfig {
    pub pool_size: u32,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LlmProviderConfig {
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key; keys never live in the file.
    pub api_key_env: String,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LlmConfig {
    pub primary: Option<LlmProviderConfig>,
    pub backup: Option<LlmProviderConfig>,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerConfig,
    pub orchestrator: OrchestratorConfig,
    pub workers: WorkersConfig,
    pub cache: CacheConfig,
    pub federation: FederationConfig,
    pub scheduler: SchedulerConfig,
    pub db: DbConfig,
    pub llm: LlmConfig,
}

impl Config {
    pub fn load() -> Fallible<Self> {
        let buffer = Self::load_as_string(default_config_file())?;
        Ok(::toml::from_str(&buffer)?)
    }

    fn load_as_string(filename: PathBuf) -> Fallible<String> {
        let mut buffer = String::new();
        File::open(&filename)
            .with_context(|| format!("failed to open {}", filename.display()))?
            .read_to_string(&mut buffer)?;

        Ok(buffer)
    }

    pub fn ttl(&self, class: crate::cache::TtlClass) -> Duration {
        use crate::cache::TtlClass;
        Duration::from_secs(match class {
            TtlClass::Short => self.cache.ttl_short_secs,
            TtlClass::Medium => self.cache.ttl_medium_secs,
            TtlClass::Long => self.cache.ttl_long_secs,
        })
    }

    pub fn check(file: &Option<String>) -> Fallible<()> {
        let filename = file
            .as_ref()
            .map(|f| f.into())
            .unwrap_or_else(default_config_file);
        let buffer = Self::load_as_string(filename)?;
        let cfg: Self = ::toml::from_str(&buffer)?;

        let mut has_errors = false;
        if cfg.orchestrator.executor_threads == 0 {
            error!("check-config failed: orchestrator.executor-threads must be > 0");
            has_errors = true;
        }
        if cfg.workers.quality_threshold_default <= 0.0
            || cfg.workers.quality_threshold_default > 1.0
        {
            error!("check-config failed: workers.quality-threshold-default must be in (0, 1]");
            has_errors = true;
        }
        if cfg.cache.ttl_short_secs > cfg.cache.ttl_medium_secs
            || cfg.cache.ttl_medium_secs > cfg.cache.ttl_long_secs
        {
            error!("check-config failed: cache TTL classes must be ordered short <= medium <= long");
            has_errors = true;
        }
        if cfg.llm.primary.is_none() && cfg.llm.backup.is_some() {
            error!("check-config failed: llm.backup configured without llm.primary");
            has_errors = true;
        }
        for provider in [&cfg.llm.primary, &cfg.llm.backup].into_iter().flatten() {
            if env::var(&provider.api_key_env).is_err() {
                warn!(
                    "llm provider {} configured but {} is not set",
                    provider.name, provider.api_key_env
                );
            }
        }

        if has_errors {
            Err(BadConfig.into())
        } else {
            Ok(())
        }
    }
}

/// Secrets come exclusively from the process environment (plus `.env` in
/// development); the config file only ever names the variables.
#[derive(Clone, Default)]
pub struct Secrets {
    values: HashMap<String, String>,
}

impl Secrets {
    pub fn from_env(config: &Config) -> Self {
        let mut values = HashMap::new();

        let mut names: Vec<String> = crate::registry::key_env_vars();
        for provider in [&config.llm.primary, &config.llm.backup]
            .into_iter()
            .flatten()
        {
            names.push(provider.api_key_env.clone());
        }

        for name in names {
            if let Ok(value) = env::var(&name) {
                values.insert(name, value);
            }
        }

        Secrets { values }
    }

    pub fn get(&self, env_var: &str) -> Option<&str> {
        self.values.get(env_var).map(|s| s.as_str())
    }

    #[cfg(test)]
    pub fn with(mut self, env_var: &str, value: &str) -> Self {
        self.values.insert(env_var.into(), value.into());
        self
    }
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                bind: default_bind(),
                rate_limit: RateLimitConfig {
                    per_minute: 60,
                    per_hour: 1000,
                    per_day: 10000,
                },
                user_tokens: HashMap::new(),
                service_tokens: HashMap::new(),
            },
            orchestrator: OrchestratorConfig {
                queue_size: 16,
                executor_threads: 2,
                investigation_timeout_secs: 60,
            },
            workers: WorkersConfig {
                quality_threshold_default: 0.8,
                max_reflection_iterations: 3,
                idle_ttl_secs: 300,
            },
            cache: CacheConfig {
                ttl_short_secs: 300,
                ttl_medium_secs: 3600,
                ttl_long_secs: 86400,
                l1_capacity: 128,
            },
            federation: FederationConfig {
                max_retries: 3,
                retry_base_ms: 10,
                breaker_failure_threshold: 5,
                breaker_window_secs: 60,
                breaker_cooldown_secs: 30,
                breaker_cooldown_cap_secs: 600,
                request_timeout_secs: 5,
            },
            scheduler: SchedulerConfig {
                enabled: false,
                leader_lease_ttl_secs: 5,
                tick_secs: 1,
                reanalyze_after_days: 30,
            },
            db: DbConfig { pool_size: 4 },
            llm: LlmConfig {
                primary: None,
                backup: None,
                request_timeout_secs: 5,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn test_sample_config_parses() {
        let config = concat!(
            "[server]\n",
            "bind = \"127.0.0.1:8000\"\n",
            "[server.rate-limit]\n",
            "per-minute = 90\n",
            "per-hour = 700\n",
            "per-day = 2000\n",
            "[server.user-tokens]\n",
            "sometoken = \"maria\"\n",
            "[orchestrator]\n",
            "queue-size = 64\n",
            "executor-threads = 4\n",
            "investigation-timeout-secs = 300\n",
            "[workers]\n",
            "quality-threshold-default = 0.8\n",
            "max-reflection-iterations = 3\n",
            "idle-ttl-secs = 600\n",
            "[cache]\n",
            "ttl-short-secs = 300\n",
            "ttl-medium-secs = 3600\n",
            "ttl-long-secs = 86400\n",
            "l1-capacity = 1024\n",
            "[federation]\n",
            "max-retries = 3\n",
            "retry-base-ms = 250\n",
            "breaker-failure-threshold = 5\n",
            "breaker-window-secs = 60\n",
            "breaker-cooldown-secs = 30\n",
            "breaker-cooldown-cap-secs = 600\n",
            "request-timeout-secs = 10\n",
            "[scheduler]\n",
            "enabled = true\n",
            "leader-lease-ttl-secs = 30\n",
            "tick-secs = 1\n",
            "reanalyze-after-days = 30\n",
            "[db]\n",
            "pool-size = 8\n",
            "[llm]\n",
            "request-timeout-secs = 20\n",
        );

        let parsed: Config = ::toml::from_str(config).unwrap();
        assert_eq!(parsed.server.rate_limit.per_minute, 90);
        assert_eq!(parsed.orchestrator.executor_threads, 4);
        assert_eq!(parsed.server.user_tokens["sometoken"], "maria");
        assert!(parsed.llm.primary.is_none());
    }

    #[test]
    fn test_ttl_lookup() {
        use crate::cache::TtlClass;

        let config = Config::default();
        assert_eq!(config.ttl(TtlClass::Short).as_secs(), 300);
        assert_eq!(config.ttl(TtlClass::Medium).as_secs(), 3600);
        assert_eq!(config.ttl(TtlClass::Long).as_secs(), 86400);
    }
}
