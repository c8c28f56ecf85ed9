use crate::error::{ExportError, Result};
use serde::{Deserialize, Serialize};
use spillway_cluster::HostId;
use std::path::PathBuf;

/// Configuration for the export subsystem of one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Local host id
    pub host_id: HostId,

    /// Single-threaded executors shared by all export sources
    pub executor_threads: usize,

    /// Push submissions allowed to wait for an executor at once
    pub max_inflight_pushes: usize,

    /// Skip sequence gaps nobody can fill instead of blocking
    pub auto_release_gaps: bool,

    /// Keep export buffers on disk under this directory
    pub data_dir: Option<PathBuf>,

    /// fsync every buffered block
    pub sync_writes: bool,

    /// Delay before re-offering a block the sink rejected
    pub sink_retry_backoff_ms: u64,

    /// Log level
    pub log_level: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            host_id: 0,
            executor_threads: 1,
            max_inflight_pushes: 64,
            auto_release_gaps: false,
            data_dir: None,
            sync_writes: true,
            sink_retry_backoff_ms: 100,
            log_level: "info".to_string(),
        }
    }
}

impl ExportConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local host id
    pub fn with_host_id(mut self, host_id: HostId) -> Self {
        self.host_id = host_id;
        self
    }

    /// Set the number of executor threads
    pub fn with_executor_threads(mut self, threads: usize) -> Self {
        self.executor_threads = threads;
        self
    }

    /// Set the push submission bound
    pub fn with_max_inflight_pushes(mut self, pushes: usize) -> Self {
        self.max_inflight_pushes = pushes;
        self
    }

    /// Enable or disable gap auto-release
    pub fn with_auto_release_gaps(mut self, enabled: bool) -> Self {
        self.auto_release_gaps = enabled;
        self
    }

    /// Persist buffers under `dir`
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    pub fn with_sink_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.sink_retry_backoff_ms = ms;
        self
    }

    /// Set the log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Reject settings the export subsystem cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.executor_threads == 0 {
            return Err(ExportError::config("executor_threads must be at least 1"));
        }
        if self.max_inflight_pushes == 0 {
            return Err(ExportError::config("max_inflight_pushes must be at least 1"));
        }
        Ok(())
    }
}
