use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::alerts::ThresholdTable;
use crate::cli::Cli;
use crate::engine::EngineConfig;
use crate::error::EngineError;
use crate::scheduler::{default_workers, SchedulerConfig, TaskRoutes};
use crate::sync::{BackoffPolicy, SyncSettings};

const DEFAULT_DATABASE_URL: &str = "sqlite://clinical-edge.db";
const BACKOFF_JITTER: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Unset means the engine runs offline-only.
    pub remote_sync_url: Option<String>,
    pub remote_timeout: Duration,
    pub model_dir: PathBuf,
    pub workers: usize,
    pub queue_limit: usize,
    pub model_load_timeout: Duration,
    pub task_timeout: Duration,
    pub sync_interval: Duration,
    pub sync_batch_size: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Zero keeps synced records forever.
    pub retention_days: u32,
    pub thresholds_path: Option<PathBuf>,
    pub routes: TaskRoutes,
    pub listen_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let config = Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            remote_sync_url: var("REMOTE_SYNC_URL"),
            remote_timeout: Duration::from_secs(parse(&var, "REMOTE_TIMEOUT_SECS", 15)?),
            model_dir: var("MODEL_DIR").map_or_else(|| PathBuf::from("./models"), PathBuf::from),
            workers: parse(&var, "WORKER_COUNT", default_workers())?,
            queue_limit: parse(&var, "QUEUE_LIMIT", 64)?,
            model_load_timeout: Duration::from_secs(parse(&var, "MODEL_LOAD_TIMEOUT_SECS", 30)?),
            task_timeout: Duration::from_secs(parse(&var, "TASK_TIMEOUT_SECS", 120)?),
            sync_interval: Duration::from_secs(parse(&var, "SYNC_INTERVAL_SECS", 30)?),
            sync_batch_size: parse(&var, "SYNC_BATCH_SIZE", 100)?,
            backoff_base: Duration::from_millis(parse(&var, "SYNC_BACKOFF_BASE_MS", 1000)?),
            backoff_max: Duration::from_secs(parse(&var, "SYNC_BACKOFF_MAX_SECS", 300)?),
            retention_days: parse(&var, "RETENTION_DAYS", 30)?,
            thresholds_path: var("ALERT_THRESHOLDS_PATH").map(PathBuf::from),
            routes: match var("TASK_MODEL_ROUTES") {
                Some(raw) => raw
                    .parse()
                    .map_err(|err| EngineError::config(format!("TASK_MODEL_ROUTES: {err}")))?,
                None => TaskRoutes::clinical_defaults(),
            },
            listen_addr: parse(&var, "LISTEN_ADDR", SocketAddr::from(([127, 0, 0, 1], 8085)))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Command-line flags win over the environment.
    pub fn apply_cli(&mut self, cli: &Cli) -> Result<(), EngineError> {
        if let Some(url) = &cli.database_url {
            self.database_url = url.clone();
        }
        if let Some(url) = &cli.remote_url {
            self.remote_sync_url = Some(url.clone());
        }
        if cli.offline {
            self.remote_sync_url = None;
        }
        if let Some(workers) = cli.workers {
            self.workers = workers;
        }
        if let Some(limit) = cli.queue_limit {
            self.queue_limit = limit;
        }
        if let Some(addr) = cli.listen {
            self.listen_addr = addr;
        }
        if let Some(dir) = &cli.model_dir {
            self.model_dir = dir.clone();
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::config("WORKER_COUNT must be at least 1"));
        }
        if self.queue_limit == 0 {
            return Err(EngineError::config("QUEUE_LIMIT must be at least 1"));
        }
        if self.sync_batch_size == 0 {
            return Err(EngineError::config("SYNC_BATCH_SIZE must be at least 1"));
        }
        if self.backoff_base.is_zero() {
            return Err(EngineError::config("SYNC_BACKOFF_BASE_MS must be positive"));
        }
        Ok(())
    }

    /// Build the library configuration, loading the threshold override
    /// file if one is configured.
    pub async fn engine_config(&self) -> Result<EngineConfig, EngineError> {
        let thresholds = match &self.thresholds_path {
            Some(path) => ThresholdTable::load(path).await?,
            None => ThresholdTable::default(),
        };
        let retention = (self.retention_days > 0)
            .then(|| chrono::Duration::days(i64::from(self.retention_days)));

        Ok(EngineConfig {
            scheduler: SchedulerConfig {
                workers: self.workers,
                queue_limit: self.queue_limit,
                task_timeout: self.task_timeout,
            },
            model_load_timeout: self.model_load_timeout,
            sync: SyncSettings {
                interval: self.sync_interval,
                batch_size: self.sync_batch_size,
                backoff: BackoffPolicy::new(self.backoff_base, self.backoff_max)
                    .with_jitter(BACKOFF_JITTER),
                retention,
            },
            routes: self.routes.clone(),
            thresholds,
            ..EngineConfig::default()
        })
    }
}

fn parse<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, EngineError> {
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::config(format!("{name} must be a valid value, got {raw:?}"))),
        None => Ok(default),
    }
}
