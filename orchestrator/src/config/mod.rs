//! Runtime configuration.
//!
//! `AppConfig` enumerates every tunable named for the crate's external
//! interface: memory/agent storage locations, the default runtime process,
//! the auction/dispatch timings, decomposition limits, and the HTTP/log
//! surface the `orchestrator-server` binary exposes. Loading follows the
//! layered shape `tooling::config` uses elsewhere in this workspace: typed
//! defaults, overridden by a YAML file if one is given, overridden again by
//! `ORCHESTRATOR_`-prefixed environment variables.

pub mod loader;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::OrchestratorError;

fn default_memory_base_dir() -> PathBuf {
    PathBuf::from("./data/memory")
}

fn default_agent_data_dir() -> PathBuf {
    PathBuf::from("./data/agents")
}

fn default_runtime_id() -> String {
    "demo".to_string()
}

fn default_concurrency_limit() -> usize {
    3
}

fn default_min_bid_threshold() -> f64 {
    0.5
}

fn default_bid_window_ms() -> u64 {
    500
}

fn default_knowledge_timeout_ms() -> u64 {
    5_000
}

fn default_max_decomposition_depth() -> u32 {
    3
}

fn default_max_subtasks() -> usize {
    10
}

fn default_max_total_nodes() -> usize {
    100
}

fn default_memory_commit_debounce_ms() -> u64 {
    5_000
}

fn default_restart_max() -> u32 {
    3
}

fn default_restart_window_secs() -> u64 {
    60
}

fn default_http_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Every tunable the runtime needs to stand up its actor tree and HTTP
/// boundary. Field defaults match the per-component defaults already hard
/// coded into `WorkerConfig`, `GraphLimits`, and `RestartPolicy` — this
/// struct is how an operator overrides them without touching code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_memory_base_dir")]
    pub memory_base_dir: PathBuf,
    #[serde(default = "default_agent_data_dir")]
    pub agent_data_dir: PathBuf,
    #[serde(default = "default_runtime_id")]
    pub default_runtime_id: String,
    #[serde(default)]
    pub runtime_env: HashMap<String, String>,
    #[serde(default)]
    pub runtime_working_dir: Option<PathBuf>,

    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_min_bid_threshold")]
    pub min_bid_threshold: f64,
    #[serde(default = "default_bid_window_ms", rename = "bid_window_ms")]
    pub bid_window_ms: u64,
    #[serde(default = "default_knowledge_timeout_ms", rename = "knowledge_timeout_ms")]
    pub knowledge_timeout_ms: u64,

    #[serde(default = "default_max_decomposition_depth")]
    pub max_decomposition_depth: u32,
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,
    #[serde(default = "default_max_total_nodes")]
    pub max_total_nodes: usize,

    #[serde(default = "default_memory_commit_debounce_ms", rename = "memory_commit_debounce_ms")]
    pub memory_commit_debounce_ms: u64,

    #[serde(default = "default_restart_max")]
    pub restart_max: u32,
    #[serde(default = "default_restart_window_secs", rename = "restart_window_secs")]
    pub restart_window_secs: u64,

    #[serde(default = "default_http_bind_addr")]
    pub http_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            memory_base_dir: default_memory_base_dir(),
            agent_data_dir: default_agent_data_dir(),
            default_runtime_id: default_runtime_id(),
            runtime_env: HashMap::new(),
            runtime_working_dir: None,
            concurrency_limit: default_concurrency_limit(),
            min_bid_threshold: default_min_bid_threshold(),
            bid_window_ms: default_bid_window_ms(),
            knowledge_timeout_ms: default_knowledge_timeout_ms(),
            max_decomposition_depth: default_max_decomposition_depth(),
            max_subtasks: default_max_subtasks(),
            max_total_nodes: default_max_total_nodes(),
            memory_commit_debounce_ms: default_memory_commit_debounce_ms(),
            restart_max: default_restart_max(),
            restart_window_secs: default_restart_window_secs(),
            http_bind_addr: default_http_bind_addr(),
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Load defaults, then a YAML file if `path` is given, then
    /// `ORCHESTRATOR_*` environment variable overrides.
    pub fn from_env_with_defaults(path: Option<&std::path::Path>) -> Result<Self, OrchestratorError> {
        let mut config = match path {
            Some(path) if path.exists() => loader::load_yaml_config::<AppConfig, _>(path)?,
            _ => AppConfig::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        use tooling::config::{get_env, get_env_parse};

        if let Ok(Some(v)) = get_env("ORCHESTRATOR_HTTP_BIND_ADDR") {
            self.http_bind_addr = v;
        }
        if let Ok(Some(v)) = get_env("ORCHESTRATOR_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(Some(v)) = get_env("ORCHESTRATOR_MEMORY_BASE_DIR") {
            self.memory_base_dir = PathBuf::from(v);
        }
        if let Ok(Some(v)) = get_env("ORCHESTRATOR_AGENT_DATA_DIR") {
            self.agent_data_dir = PathBuf::from(v);
        }
        if let Ok(Some(v)) = get_env("ORCHESTRATOR_DEFAULT_RUNTIME_ID") {
            self.default_runtime_id = v;
        }
        if let Ok(Some(parsed)) = get_env_parse::<usize>("ORCHESTRATOR_CONCURRENCY_LIMIT") {
            self.concurrency_limit = parsed;
        }
    }

    pub fn bid_window(&self) -> Duration {
        Duration::from_millis(self.bid_window_ms)
    }

    pub fn knowledge_timeout(&self) -> Duration {
        Duration::from_millis(self.knowledge_timeout_ms)
    }

    pub fn memory_commit_debounce(&self) -> Duration {
        Duration::from_millis(self.memory_commit_debounce_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    pub fn restart_policy(&self) -> crate::supervision::RestartPolicy {
        crate::supervision::RestartPolicy {
            max_restarts: self.restart_max,
            window: self.restart_window(),
        }
    }

    pub fn graph_limits(&self) -> crate::graph::GraphLimits {
        crate::graph::GraphLimits {
            max_subtasks: self.max_subtasks,
            max_depth: self.max_decomposition_depth,
            max_total_nodes: self.max_total_nodes,
        }
    }

    pub fn worker_config(&self, runtime_kind: crate::worker::RuntimeKind) -> crate::worker::WorkerConfig {
        crate::worker::WorkerConfig {
            concurrency_limit: self.concurrency_limit,
            min_bid_threshold: self.min_bid_threshold,
            knowledge_timeout: self.knowledge_timeout(),
            memory_commit_debounce: self.memory_commit_debounce(),
            runtime_kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_component_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.concurrency_limit, 3);
        assert_eq!(config.min_bid_threshold, 0.5);
        assert_eq!(config.bid_window(), Duration::from_millis(500));
        assert_eq!(config.knowledge_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_decomposition_depth, 3);
        assert_eq!(config.max_subtasks, 10);
        assert_eq!(config.max_total_nodes, 100);
        assert_eq!(config.memory_commit_debounce(), Duration::from_secs(5));
        assert_eq!(config.restart_max, 3);
        assert_eq!(config.restart_window(), Duration::from_secs(60));
    }

    #[test]
    fn test_env_override_takes_precedence() {
        std::env::set_var("ORCHESTRATOR_HTTP_BIND_ADDR", "127.0.0.1:9999");
        let config = AppConfig::from_env_with_defaults(None).unwrap();
        assert_eq!(config.http_bind_addr, "127.0.0.1:9999");
        std::env::remove_var("ORCHESTRATOR_HTTP_BIND_ADDR");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::from_env_with_defaults(Some(std::path::Path::new("/nonexistent/config.yaml"))).unwrap();
        assert_eq!(config.concurrency_limit, default_concurrency_limit());
    }
}
