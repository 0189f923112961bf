//! Process configuration (A3): CLI flags with environment fallback, following
//! this repository's `cmd_util`-style conventions. Read once at startup into
//! an immutable [`Config`].

use std::{
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use scanner::ExtractionLimits;

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
pub enum StorageBackendKind {
    Gcs,
    S3,
    #[default]
    Memory,
}

#[derive(Parser, Debug)]
#[command(name = "zipserver")]
pub struct Config {
    /// Address the HTTP server binds to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: SocketAddr,

    /// Which storage backend to construct. `memory` is for local development
    /// and integration tests only.
    #[arg(long, env = "STORAGE_BACKEND", value_enum, default_value_t = StorageBackendKind::Memory)]
    pub storage_backend: StorageBackendKind,

    /// Scratch directory for downloaded archives. Falls back to
    /// `RUNTIME_DIRECTORY`, then a relative default, when unset (§6).
    #[arg(long, env = "ZIPSERVER_TMP_DIR")]
    pub scratch_dir: Option<PathBuf>,

    #[arg(long, env = "DEFAULT_MAX_INPUT_SIZE", default_value_t = 0)]
    pub default_max_input_size: u64,
    #[arg(long, env = "DEFAULT_MAX_ENTRY_SIZE", default_value_t = 0)]
    pub default_max_entry_size: u64,
    #[arg(long, env = "DEFAULT_MAX_TOTAL_SIZE", default_value_t = 0)]
    pub default_max_total_size: u64,
    #[arg(long, env = "DEFAULT_MAX_ENTRIES", default_value_t = 0)]
    pub default_max_entries: u64,
    #[arg(long, env = "DEFAULT_MAX_PATH_LENGTH", default_value_t = 0)]
    pub default_max_path_length: u64,
    #[arg(long, env = "DEFAULT_WORKER_POOL_SIZE", default_value_t = 0)]
    pub default_worker_pool_size: usize,

    #[arg(long, env = "JOB_TIMEOUT_SECONDS", default_value_t = 300)]
    pub job_timeout_seconds: u64,
    #[arg(long, env = "FETCH_TIMEOUT_SECONDS", default_value_t = 60)]
    pub fetch_timeout_seconds: u64,
    #[arg(long, env = "UPLOAD_TIMEOUT_SECONDS", default_value_t = 60)]
    pub upload_timeout_seconds: u64,
    #[arg(long, env = "CALLBACK_TIMEOUT_SECONDS", default_value_t = 5)]
    pub callback_timeout_seconds: u64,

    /// Comma-separated list of extensions eligible for pre-compression (e.g.
    /// `.js,.css,.html`). Unset disables pre-compression entirely.
    #[arg(long, env = "PRE_COMPRESS_EXTENSIONS")]
    pub pre_compress_extensions: Option<String>,
    #[arg(long, env = "PRE_COMPRESS_MIN_SIZE", default_value_t = 1024)]
    pub pre_compress_min_size: u64,
    #[arg(long, env = "PRE_COMPRESS_CONCURRENCY", default_value_t = 1)]
    pub pre_compress_concurrency: usize,
}

impl Config {
    /// First `ZIPSERVER_TMP_DIR`, else `RUNTIME_DIRECTORY`, else a relative
    /// default (§6's environment note).
    pub fn resolve_scratch_dir(&self) -> PathBuf {
        if let Some(dir) = &self.scratch_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var("RUNTIME_DIRECTORY") {
            return PathBuf::from(dir);
        }
        PathBuf::from("tmp/zipserver")
    }

    pub fn default_limits(&self) -> ExtractionLimits {
        ExtractionLimits {
            max_input_size: self.default_max_input_size,
            max_entry_size: self.default_max_entry_size,
            max_total_size: self.default_max_total_size,
            max_entries: self.default_max_entries,
            max_path_length: self.default_max_path_length,
            worker_pool_size: self.default_worker_pool_size,
            include_glob: None,
            allow_list: None,
            html_tail: None,
        }
    }

    pub fn job_timeouts(&self) -> job_coordinator::JobTimeouts {
        job_coordinator::JobTimeouts {
            job: Duration::from_secs(self.job_timeout_seconds),
            fetch: Duration::from_secs(self.fetch_timeout_seconds),
            upload: Duration::from_secs(self.upload_timeout_seconds),
            callback: Duration::from_secs(self.callback_timeout_seconds),
        }
    }

    pub fn pre_compress_config(&self) -> Option<entry_processor::PreCompressConfig> {
        let extensions = self.pre_compress_extensions.as_ref()?;
        let allow_extensions = extensions
            .split(',')
            .map(|s| s.trim().trim_start_matches('.').to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if allow_extensions.is_empty() {
            return None;
        }
        Some(entry_processor::PreCompressConfig::new(
            allow_extensions,
            self.pre_compress_min_size,
            self.pre_compress_concurrency,
        ))
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_seconds)
    }
}
