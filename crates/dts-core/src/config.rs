//! Configuration system for dts.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DTS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/dts/config.toml
//!   3. ~/.config/dts/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DtsConfig {
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen port. 0 = OS-assigned.
    pub port: u16,
    /// Completion queues (one driver thread each). 0 = available parallelism.
    pub queue_count: usize,
    /// Pre-armed call contexts spread across queues. 0 = 2 × parallelism.
    pub initial_contexts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Work-pool workers. 0 = available parallelism.
    pub worker_threads: usize,
    /// Bounded work-queue capacity.
    pub queue_capacity: usize,
    /// Node resource snapshot used for admission.
    pub resources: ResourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub cpu_core: f64,
    pub mem_mb: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DtsConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            queue_count: 0,
            initial_contexts: 0,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            queue_capacity: 1024,
            resources: ResourceConfig::default(),
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_core: 4.0,
            mem_mb: 8192,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("dts")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("invalid value for {0}: {1}")]
    InvalidEnv(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DtsConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            DtsConfig::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DTS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply DTS_* env var overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("DTS_PORT") {
            self.server.port = v
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("DTS_PORT", v))?;
        }
        if let Ok(v) = std::env::var("DTS_INITIAL_CONTEXT") {
            self.server.initial_contexts = v
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("DTS_INITIAL_CONTEXT", v))?;
        }
        if let Ok(v) = std::env::var("DTS_QUEUE_COUNT") {
            self.server.queue_count = v
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("DTS_QUEUE_COUNT", v))?;
        }
        if let Ok(v) = std::env::var("DTS_WORKER_THREADS") {
            self.executor.worker_threads = v
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("DTS_WORKER_THREADS", v))?;
        }
        Ok(())
    }

    /// Resolved completion-queue count.
    pub fn queue_count(&self) -> usize {
        resolve_auto(self.server.queue_count, parallelism())
    }

    /// Resolved pre-armed context count.
    pub fn initial_contexts(&self) -> usize {
        resolve_auto(self.server.initial_contexts, 2 * parallelism())
    }

    /// Resolved work-pool size.
    pub fn worker_threads(&self) -> usize {
        resolve_auto(self.executor.worker_threads, parallelism())
    }
}

fn resolve_auto(configured: usize, auto: usize) -> usize {
    if configured == 0 {
        auto.max(1)
    } else {
        configured
    }
}

fn parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
