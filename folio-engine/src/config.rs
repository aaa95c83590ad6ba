//! Configuration resolution for folio-engine
//!
//! Settings resolve environment-first with an optional TOML file behind it
//! (path from `FOLIO_CONFIG`). Queue misconfiguration is a startup error:
//! requesting the redis provider without a reachable broker must abort the
//! process, never silently degrade to the in-process queue.

use crate::types::{CompileOptions, ValidationOptions};
use folio_common::config::{
    load_config_file, resolve_flag, resolve_optional, resolve_parse, resolve_string,
};
use folio_common::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Which queue backend to construct at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueProvider {
    /// Single-worker FIFO inside this process; no durability
    InProcess,
    /// Durable broker-backed queue with multi-worker fan-out
    Redis,
}

impl std::fmt::Display for QueueProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueProvider::InProcess => write!(f, "in-process"),
            QueueProvider::Redis => write!(f, "redis"),
        }
    }
}

/// Queue behaviour knobs
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub enabled: bool,
    pub provider: QueueProvider,
    pub redis_url: String,
    /// Key namespace so several deployments can share one broker
    pub prefix: String,
    pub concurrency: usize,
    /// Attempts per job before it parks in failed
    pub attempts: u32,
    /// Base delay for exponential retry backoff
    pub backoff_ms: u64,
}

/// Outbound generation client knobs
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// Generation calls per second allowed against the provider
    pub requests_per_second: u32,
}

/// Full service configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub queue: QueueSettings,
    /// Remote worker base URL for queue-disabled dispatch
    pub worker_url: Option<String>,
    /// Shared secret for the internal worker transport
    pub internal_token: Option<String>,
    pub generator: GeneratorSettings,
    /// Generation attempts per node before an execution fails; callers can
    /// raise or lower it per execution
    pub generation_attempts: u32,
    pub validation: ValidationOptions,
    pub compile: CompileOptions,
}

impl Settings {
    /// Resolve all settings; parse failures and contradictory flags error out
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FOLIO_CONFIG").unwrap_or_else(|_| "folio.toml".to_string());
        let file = load_config_file(Path::new(&config_path))?;
        let file = file.as_ref();

        let bind_addr = resolve_string("FOLIO_BIND_ADDR", file, "bind_addr", "0.0.0.0:5740");
        let data_dir = PathBuf::from(resolve_string(
            "FOLIO_DATA_DIR",
            file,
            "data_dir",
            "./folio_data",
        ));

        let enabled = resolve_flag("QUEUE_ENABLED", file, "queue_enabled", true)?;
        let provider = match resolve_optional("QUEUE_PROVIDER", file, "queue_provider") {
            None => QueueProvider::InProcess,
            Some(name) => match name.as_str() {
                "redis" => QueueProvider::Redis,
                other => {
                    return Err(Error::Config(format!(
                        "QUEUE_PROVIDER must be 'redis' or unset, got: {}",
                        other
                    )))
                }
            },
        };

        let queue = QueueSettings {
            enabled,
            provider,
            redis_url: resolve_string("REDIS_URL", file, "redis_url", "redis://127.0.0.1:6379"),
            prefix: resolve_string("QUEUE_PREFIX", file, "queue_prefix", "folio"),
            concurrency: resolve_parse("QUEUE_CONCURRENCY", file, "queue_concurrency", 2usize)?,
            attempts: resolve_parse("QUEUE_ATTEMPTS", file, "queue_attempts", 3u32)?,
            backoff_ms: resolve_parse("QUEUE_BACKOFF_MS", file, "queue_backoff_ms", 5000u64)?,
        };

        let worker_url = resolve_optional("WORKER_URL", file, "worker_url");
        let internal_token = resolve_optional("INTERNAL_TOKEN", file, "internal_token");
        if worker_url.is_some() && internal_token.is_none() {
            return Err(Error::Config(
                "WORKER_URL is set but INTERNAL_TOKEN is not; the worker transport requires a shared secret".to_string(),
            ));
        }

        let generator = GeneratorSettings {
            url: resolve_optional("GENERATOR_URL", file, "generator_url"),
            api_key: resolve_optional("GENERATOR_API_KEY", file, "generator_api_key"),
            requests_per_second: resolve_parse("GENERATOR_RPS", file, "generator_rps", 1u32)?,
        };

        let generation_attempts = resolve_parse(
            "FOLIO_GENERATION_ATTEMPTS",
            file,
            "generation_attempts",
            3u32,
        )?;

        let validation = ValidationOptions {
            repetition_threshold: resolve_parse(
                "FOLIO_REPETITION_THRESHOLD",
                file,
                "repetition_threshold",
                ValidationOptions::default().repetition_threshold,
            )?,
            ..ValidationOptions::default()
        };

        let compile = CompileOptions {
            similarity_threshold: resolve_parse(
                "FOLIO_SIMILARITY_THRESHOLD",
                file,
                "similarity_threshold",
                CompileOptions::default().similarity_threshold,
            )?,
            ..CompileOptions::default()
        };

        info!(
            bind_addr = %bind_addr,
            queue_enabled = queue.enabled,
            queue_provider = %queue.provider,
            "Configuration resolved"
        );

        Ok(Self {
            bind_addr,
            data_dir,
            queue,
            worker_url,
            internal_token,
            generator,
            generation_attempts,
            validation,
            compile,
        })
    }

    /// SQLite database location under the data directory
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("folio.db")
    }
}
