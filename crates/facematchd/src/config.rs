use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration.
///
/// Layered as defaults, then the TOML file named by `FACEMATCH_CONFIG`,
/// then `FACEMATCH_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SQLite database holding the registry and the job queue.
    pub db_path: PathBuf,
    pub bus: BusKind,
    /// Minimum SCRFD score for a detection to count as a face.
    pub min_confidence: f32,
    /// Distance below which two faces are the same person.
    pub match_threshold: f32,
    pub default_top_k: usize,
    /// Local directory or `http(s)://` gateway endpoint.
    pub object_store: String,
    /// Scheme accepted for remote image references.
    pub object_scheme: String,
    /// Bucket for annotated images; the source bucket when unset.
    pub annotation_bucket: Option<String>,
    /// Completion callback URL; notifications are off when unset.
    pub notify_url: Option<String>,
    pub notify_timeout: Duration,
    /// Upper bound on every extractor, registry, object store and queue call.
    pub dependency_timeout: Duration,
    /// How long a job may wait in its queue before the sweep fails it.
    pub job_ttl: Duration,
    /// How long a claimed job may run before the sweep fails it as abandoned.
    pub job_lease: Duration,
    /// How long terminal jobs stay readable.
    pub result_ttl: Duration,
    pub register_workers: usize,
    pub search_workers: usize,
    /// Idle wait between claim attempts on an empty queue.
    pub worker_poll: Duration,
    pub sweep_interval: Duration,
}

/// On-disk form; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    bus: Option<BusKind>,
    min_confidence: Option<f32>,
    match_threshold: Option<f32>,
    default_top_k: Option<usize>,
    object_store: Option<String>,
    object_scheme: Option<String>,
    annotation_bucket: Option<String>,
    notify_url: Option<String>,
    notify_timeout_secs: Option<u64>,
    dependency_timeout_secs: Option<u64>,
    job_ttl_secs: Option<u64>,
    job_lease_secs: Option<u64>,
    result_ttl_secs: Option<u64>,
    register_workers: Option<usize>,
    search_workers: Option<usize>,
    worker_poll_ms: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = facematch_core::data_home().join("facematch");
        Self {
            model_dir: facematch_core::default_model_dir(),
            db_path: data_dir.join("facematch.db"),
            bus: BusKind::Session,
            min_confidence: 0.5,
            match_threshold: facematch_core::DEFAULT_SAME_IDENTITY_THRESHOLD,
            default_top_k: 5,
            object_store: data_dir.join("objects").to_string_lossy().into_owned(),
            object_scheme: "s3".to_string(),
            annotation_bucket: None,
            notify_url: None,
            notify_timeout: Duration::from_secs(10),
            dependency_timeout: Duration::from_secs(30),
            job_ttl: Duration::from_secs(3600),
            job_lease: Duration::from_secs(600),
            result_ttl: Duration::from_secs(86400),
            register_workers: 1,
            search_workers: 1,
            worker_poll: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_sources(|key| std::env::var(key).ok())
    }

    /// Load using `env` as the variable lookup.
    pub fn from_sources(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = env("FACEMATCH_CONFIG") {
            let path = PathBuf::from(path);
            config.apply_file(&read_file(&path)?);
        }

        config.apply_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: &FileConfig) {
        let secs = Duration::from_secs;
        set(&mut self.model_dir, file.model_dir.clone());
        set(&mut self.db_path, file.db_path.clone());
        set(&mut self.bus, file.bus);
        set(&mut self.min_confidence, file.min_confidence);
        set(&mut self.match_threshold, file.match_threshold);
        set(&mut self.default_top_k, file.default_top_k);
        set(&mut self.object_store, file.object_store.clone());
        set(&mut self.object_scheme, file.object_scheme.clone());
        if file.annotation_bucket.is_some() {
            self.annotation_bucket = file.annotation_bucket.clone();
        }
        if file.notify_url.is_some() {
            self.notify_url = file.notify_url.clone();
        }
        set(&mut self.notify_timeout, file.notify_timeout_secs.map(secs));
        set(&mut self.dependency_timeout, file.dependency_timeout_secs.map(secs));
        set(&mut self.job_ttl, file.job_ttl_secs.map(secs));
        set(&mut self.job_lease, file.job_lease_secs.map(secs));
        set(&mut self.result_ttl, file.result_ttl_secs.map(secs));
        set(&mut self.register_workers, file.register_workers);
        set(&mut self.search_workers, file.search_workers);
        set(&mut self.worker_poll, file.worker_poll_ms.map(Duration::from_millis));
        set(&mut self.sweep_interval, file.sweep_interval_secs.map(secs));
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = env("FACEMATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FACEMATCH_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("FACEMATCH_BUS") {
            self.bus = match v.as_str() {
                "session" => BusKind::Session,
                "system" => BusKind::System,
                _ => return Err(ConfigError::Invalid { key: "FACEMATCH_BUS", value: v }),
            };
        }
        parse_env(env, "FACEMATCH_MIN_CONFIDENCE", &mut self.min_confidence)?;
        parse_env(env, "FACEMATCH_MATCH_THRESHOLD", &mut self.match_threshold)?;
        parse_env(env, "FACEMATCH_DEFAULT_TOP_K", &mut self.default_top_k)?;
        if let Some(v) = env("FACEMATCH_OBJECT_STORE") {
            self.object_store = v;
        }
        if let Some(v) = env("FACEMATCH_OBJECT_SCHEME") {
            self.object_scheme = v;
        }
        if let Some(v) = env("FACEMATCH_ANNOTATION_BUCKET") {
            self.annotation_bucket = Some(v).filter(|b| !b.is_empty());
        }
        if let Some(v) = env("FACEMATCH_NOTIFY_URL") {
            self.notify_url = Some(v).filter(|u| !u.is_empty());
        }
        parse_env_secs(env, "FACEMATCH_NOTIFY_TIMEOUT_SECS", &mut self.notify_timeout)?;
        parse_env_secs(env, "FACEMATCH_DEPENDENCY_TIMEOUT_SECS", &mut self.dependency_timeout)?;
        parse_env_secs(env, "FACEMATCH_JOB_TTL_SECS", &mut self.job_ttl)?;
        parse_env_secs(env, "FACEMATCH_JOB_LEASE_SECS", &mut self.job_lease)?;
        parse_env_secs(env, "FACEMATCH_RESULT_TTL_SECS", &mut self.result_ttl)?;
        parse_env(env, "FACEMATCH_REGISTER_WORKERS", &mut self.register_workers)?;
        parse_env(env, "FACEMATCH_SEARCH_WORKERS", &mut self.search_workers)?;
        let mut poll_ms = self.worker_poll.as_millis() as u64;
        parse_env(env, "FACEMATCH_WORKER_POLL_MS", &mut poll_ms)?;
        self.worker_poll = Duration::from_millis(poll_ms);
        parse_env_secs(env, "FACEMATCH_SWEEP_INTERVAL_SECS", &mut self.sweep_interval)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                value: self.match_threshold.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::Invalid {
                key: "min_confidence",
                value: self.min_confidence.to_string(),
            });
        }
        if self.default_top_k == 0 {
            return Err(ConfigError::Invalid { key: "default_top_k", value: "0".into() });
        }
        if self.object_scheme.is_empty() {
            return Err(ConfigError::Invalid { key: "object_scheme", value: String::new() });
        }
        // A job makes several bounded calls; a shorter lease reaps live work.
        if self.job_lease <= self.dependency_timeout {
            return Err(ConfigError::Invalid {
                key: "job_lease_secs",
                value: self.job_lease.as_secs().to_string(),
            });
        }
        if self.sweep_interval.is_zero() || self.worker_poll.is_zero() {
            return Err(ConfigError::Invalid {
                key: "sweep_interval_secs/worker_poll_ms",
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(v) = env(key) {
        *slot = v.parse().map_err(|_| ConfigError::Invalid { key, value: v.clone() })?;
    }
    Ok(())
}

fn parse_env_secs(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut Duration,
) -> Result<(), ConfigError> {
    let mut secs = slot.as_secs();
    parse_env(env, key, &mut secs)?;
    *slot = Duration::from_secs(secs);
    Ok(())
}
