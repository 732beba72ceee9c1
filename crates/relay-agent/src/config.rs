use crate::BridgeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const LANE_MAIN: &str = "main";
pub const LANE_SUBAGENT: &str = "subagent";
pub const LANE_CRON: &str = "cron";

pub const DEFAULT_SUBAGENT_CEILING: usize = 4;
pub const DEFAULT_SUBAGENT_RETENTION_MS: u64 = 7 * 60 * 60 * 1_000;

/// Runtime configuration for the bridge orchestration context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub default_engine: String,
    pub working_dir: PathBuf,
    pub termination_grace_ms: u64,
    pub lanes: BTreeMap<String, usize>,
    pub subagents: SubagentConfig,
    pub tool_preview_chars: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubagentConfig {
    pub max_concurrent: usize,
    pub retention_ms: u64,
    pub state_path: Option<PathBuf>,
    pub reply_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_engine: "claude".to_string(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            termination_grace_ms: 5_000,
            lanes: default_lane_limits(),
            subagents: SubagentConfig::default(),
            tool_preview_chars: 500,
        }
    }
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_SUBAGENT_CEILING,
            retention_ms: DEFAULT_SUBAGENT_RETENTION_MS,
            state_path: None,
            reply_timeout_ms: 300_000,
        }
    }
}

pub fn default_lane_limits() -> BTreeMap<String, usize> {
    BTreeMap::from([
        (LANE_MAIN.to_string(), 1),
        (LANE_SUBAGENT.to_string(), DEFAULT_SUBAGENT_CEILING),
        (LANE_CRON.to_string(), 1),
    ])
}

impl BridgeConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, BridgeError> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            BridgeError::InvalidConfiguration(format!(
                "failed reading config '{}': {error}",
                path.display()
            ))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|error| {
            BridgeError::InvalidConfiguration(format!(
                "failed parsing config '{}': {error}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.default_engine.trim().is_empty() {
            return Err(BridgeError::InvalidConfiguration(
                "default_engine must be non-empty".to_string(),
            ));
        }
        if let Some((lane, _)) = self.lanes.iter().find(|(_, limit)| **limit == 0) {
            return Err(BridgeError::InvalidConfiguration(format!(
                "lane '{lane}' must allow at least one concurrent task"
            )));
        }
        if self.subagents.max_concurrent == 0 {
            return Err(BridgeError::InvalidConfiguration(
                "subagents.max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn termination_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.termination_grace_ms)
    }
}
