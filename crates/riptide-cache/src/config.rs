use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

// Shape cache configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    // Postgres connection string for the snapshot source.
    pub database_url: Option<String>,
    // Root directory for the file-backed KV store.
    pub kv_path: Option<PathBuf>,
    // Depth of the coordinator's serialized request queue.
    pub request_queue_depth: usize,
    // Mailbox depth of each per-shape consumer.
    pub consumer_queue_depth: usize,
    // Caller-side timeout when waiting for a snapshot to start.
    pub await_snapshot_timeout_ms: u64,
    // Attempts for a failed log append before the transaction is dropped.
    pub log_append_retries: u32,
}

const DEFAULT_CACHE_CONFIG_PATH: &str = "/usr/local/riptide/config.yml";
const DEFAULT_REQUEST_QUEUE_DEPTH: usize = 256;
const DEFAULT_CONSUMER_QUEUE_DEPTH: usize = 1024;
const DEFAULT_AWAIT_SNAPSHOT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LOG_APPEND_RETRIES: u32 = 3;

#[derive(Debug, Deserialize)]
struct CacheConfigOverride {
    database_url: Option<String>,
    kv_path: Option<PathBuf>,
    request_queue_depth: Option<usize>,
    consumer_queue_depth: Option<usize>,
    await_snapshot_timeout_ms: Option<u64>,
    log_append_retries: Option<u32>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            kv_path: None,
            request_queue_depth: DEFAULT_REQUEST_QUEUE_DEPTH,
            consumer_queue_depth: DEFAULT_CONSUMER_QUEUE_DEPTH,
            await_snapshot_timeout_ms: DEFAULT_AWAIT_SNAPSHOT_TIMEOUT_MS,
            log_append_retries: DEFAULT_LOG_APPEND_RETRIES,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("RIPTIDE_DATABASE_URL") {
            config.database_url = Some(value);
        }
        if let Ok(value) = std::env::var("RIPTIDE_KV_PATH") {
            config.kv_path = Some(PathBuf::from(value));
        }
        if let Ok(value) = std::env::var("RIPTIDE_REQUEST_QUEUE_DEPTH") {
            config.request_queue_depth =
                value.parse().with_context(|| "parse RIPTIDE_REQUEST_QUEUE_DEPTH")?;
        }
        if let Ok(value) = std::env::var("RIPTIDE_CONSUMER_QUEUE_DEPTH") {
            config.consumer_queue_depth = value
                .parse()
                .with_context(|| "parse RIPTIDE_CONSUMER_QUEUE_DEPTH")?;
        }
        if let Ok(value) = std::env::var("RIPTIDE_AWAIT_SNAPSHOT_TIMEOUT_MS") {
            config.await_snapshot_timeout_ms = value
                .parse()
                .with_context(|| "parse RIPTIDE_AWAIT_SNAPSHOT_TIMEOUT_MS")?;
        }
        if let Ok(value) = std::env::var("RIPTIDE_LOG_APPEND_RETRIES") {
            config.log_append_retries =
                value.parse().with_context(|| "parse RIPTIDE_LOG_APPEND_RETRIES")?;
        }
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let path = std::env::var("RIPTIDE_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CACHE_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(config),
            Err(err) => {
                return Err(err).with_context(|| format!("read RIPTIDE_CONFIG: {path}"));
            }
        };
        let override_cfg: CacheConfigOverride =
            serde_yaml::from_str(&contents).with_context(|| "parse cache config yaml")?;
        if let Some(value) = override_cfg.database_url {
            config.database_url = Some(value);
        }
        if let Some(value) = override_cfg.kv_path {
            config.kv_path = Some(value);
        }
        if let Some(value) = override_cfg.request_queue_depth {
            config.request_queue_depth = value;
        }
        if let Some(value) = override_cfg.consumer_queue_depth {
            config.consumer_queue_depth = value;
        }
        if let Some(value) = override_cfg.await_snapshot_timeout_ms {
            config.await_snapshot_timeout_ms = value;
        }
        if let Some(value) = override_cfg.log_append_retries {
            config.log_append_retries = value;
        }
        Ok(config)
    }

    pub fn await_snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.await_snapshot_timeout_ms)
    }
}
