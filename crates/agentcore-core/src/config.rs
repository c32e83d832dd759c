//! Core configuration.
//!
//! Loaded from `<config_dir>/agentcore/config.toml`, then overridden by
//! `AGENTCORE_*` environment variables. Missing integration credentials
//! leave the matching feature disabled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agentcore_ai::mcp::{
    HttpProfileResolver, McpResolver, McpTimeouts, PipedreamAuth, PipedreamCredentials,
    ProfileResolver,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::BusConfig;

pub const DEFAULT_MODEL: &str = "gpt-4o";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Database file; defaults to `<data_dir>/agentcore/agentcore.db`.
    pub database_path: Option<PathBuf>,
    /// Identity of this worker on the bus; generated when absent.
    pub instance_id: Option<String>,
    pub scheduler: SchedulerSettings,
    pub bus: BusSettings,
    pub llm: LlmSettings,
    pub mcp: McpSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { tick_secs: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub ttl_secs: u64,
    pub batch_size: usize,
    pub cleanup_delay_secs: u64,
    pub sweep_interval_secs: u64,
    pub liveness_refresh_secs: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            batch_size: 100,
            cleanup_delay_secs: 5 * 60,
            sweep_interval_secs: 60,
            liveness_refresh_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// OpenAI-compatible endpoint; the client's default when absent.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub default_model: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    pub pipedream: Option<PipedreamCredentials>,
    pub composio: Option<ProfileServiceSettings>,
}

/// Service that resolves stored MCP profiles to server URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileServiceSettings {
    pub url: String,
    pub api_key: String,
}

impl CoreConfig {
    /// Default file merged with the environment.
    pub fn load() -> Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) => Self::load_from_path(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("agentcore").join("config.toml"))
    }

    /// Apply `AGENTCORE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(path) = get("AGENTCORE_DB_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(instance_id) = get("AGENTCORE_INSTANCE_ID") {
            self.instance_id = Some(instance_id);
        }
        if let Some(url) = get("AGENTCORE_LLM_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        if let Some(key) = get("AGENTCORE_LLM_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.llm.api_key = Some(key);
        }
        if let Some(model) = get("AGENTCORE_DEFAULT_MODEL") {
            self.llm.default_model = model;
        }
        if let Some(secs) = get("AGENTCORE_SCHEDULER_TICK_SECS").and_then(|v| v.parse().ok()) {
            self.scheduler.tick_secs = secs;
        }
        if let (Some(client_id), Some(client_secret), Some(project_id)) = (
            get("AGENTCORE_PIPEDREAM_CLIENT_ID"),
            get("AGENTCORE_PIPEDREAM_CLIENT_SECRET"),
            get("AGENTCORE_PIPEDREAM_PROJECT_ID"),
        ) {
            self.mcp.pipedream = Some(PipedreamCredentials {
                client_id,
                client_secret,
                project_id,
                environment: get("AGENTCORE_PIPEDREAM_ENVIRONMENT")
                    .unwrap_or_else(|| "production".to_string()),
            });
        }
        if let (Some(url), Some(api_key)) = (
            get("AGENTCORE_COMPOSIO_URL"),
            get("AGENTCORE_COMPOSIO_API_KEY"),
        ) {
            self.mcp.composio = Some(ProfileServiceSettings { url, api_key });
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("agentcore"))
                .unwrap_or_else(|| PathBuf::from("."))
                .join("agentcore.db")
        })
    }

    pub fn instance_id(&self) -> String {
        self.instance_id.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("worker-{}", &id[..8])
        })
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            ttl: Duration::from_secs(self.bus.ttl_secs),
            batch_size: self.bus.batch_size.max(1),
            cleanup_delay: Duration::from_secs(self.bus.cleanup_delay_secs),
            sweep_interval: Duration::from_secs(self.bus.sweep_interval_secs.max(1)),
            ..BusConfig::default()
        }
    }

    pub fn liveness_refresh(&self) -> Duration {
        Duration::from_secs(self.bus.liveness_refresh_secs.max(1))
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_secs.max(1))
    }

    /// MCP integrations for which credentials are configured.
    pub fn mcp_resolver(&self) -> McpResolver {
        McpResolver {
            pipedream: self
                .mcp
                .pipedream
                .clone()
                .map(|creds| Arc::new(PipedreamAuth::new(creds))),
            profiles: self.mcp.composio.as_ref().map(|service| {
                Arc::new(HttpProfileResolver::new(&service.url, &service.api_key))
                    as Arc<dyn ProfileResolver>
            }),
        }
    }

    pub fn mcp_timeouts(&self) -> McpTimeouts {
        McpTimeouts::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = CoreConfig::load_from_path(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.scheduler_tick(), Duration::from_secs(60));
        assert_eq!(config.liveness_refresh(), Duration::from_secs(30));
        assert_eq!(config.bus_config().ttl, Duration::from_secs(86_400));
        assert!(config.mcp_resolver().pipedream.is_none());
        assert!(config.instance_id().starts_with("worker-"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
database_path = "/tmp/agentcore-test.db"

[bus]
batch_size = 25

[llm]
default_model = "sonnet"

[mcp.pipedream]
client_id = "id"
client_secret = "secret"
project_id = "proj"
"#,
        )
        .unwrap();

        let config = CoreConfig::load_from_path(&path).unwrap();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/agentcore-test.db"));
        assert_eq!(config.bus.batch_size, 25);
        assert_eq!(config.bus.ttl_secs, 86_400);
        assert_eq!(config.llm.default_model, "sonnet");
        let pipedream = config.mcp.pipedream.clone().unwrap();
        assert_eq!(pipedream.environment, "production");
        assert!(config.mcp_resolver().pipedream.is_some());
        assert!(config.mcp_resolver().profiles.is_none());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bus = 3").unwrap();
        assert!(CoreConfig::load_from_path(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AGENTCORE_INSTANCE_ID", "worker-a"),
            ("OPENAI_API_KEY", "sk-fallback"),
            ("AGENTCORE_DEFAULT_MODEL", "haiku"),
            ("AGENTCORE_SCHEDULER_TICK_SECS", "5"),
            ("AGENTCORE_COMPOSIO_URL", "https://profiles.example.com"),
            ("AGENTCORE_COMPOSIO_API_KEY", "ck"),
            ("AGENTCORE_PIPEDREAM_CLIENT_ID", "only-one-of-three"),
            ("AGENTCORE_DB_PATH", "  "),
        ]);
        let mut config = CoreConfig::default();
        config.apply_env(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.instance_id(), "worker-a");
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-fallback"));
        assert_eq!(config.llm.default_model, "haiku");
        assert_eq!(config.scheduler_tick(), Duration::from_secs(5));
        assert!(config.mcp.composio.is_some());
        assert!(config.mcp.pipedream.is_none());
        assert!(config.database_path.is_none());
    }
}
