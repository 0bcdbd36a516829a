//! Runner configuration: environment first, then an optional JSON file.

use std::path::Path;

use portci_log::LogConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{CiError, Result};
use crate::portlist::DEFAULT_BASE_REF;
use crate::tool::ToolConfig;

/// Everything a run needs besides the port list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub log: LogConfig,
    pub tool: ToolConfig,
    /// Ref the changed ports are computed against
    pub base_ref: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            log: LogConfig::default(),
            tool: ToolConfig::default(),
            base_ref: DEFAULT_BASE_REF.to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        RunnerConfig {
            log: LogConfig::from_env(),
            ..Self::default()
        }
    }

    /// Environment defaults, overridden by whatever keys `path` sets.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = Self::from_env();
        let Some(path) = path else {
            return Ok(config);
        };

        let text = std::fs::read_to_string(path).map_err(|e| {
            CiError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let overrides: Value = serde_json::from_str(&text)?;
        if !overrides.is_object() {
            return Err(CiError::Config(format!(
                "{} must contain a JSON object",
                path.display()
            )));
        }

        let mut merged = serde_json::to_value(&config)?;
        merge(&mut merged, overrides);
        debug!(path = %path.display(), "Loaded runner config");
        Ok(serde_json::from_value(merged)?)
    }
}

fn merge(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                merge(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, value) => *base = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_base_ref_is_upstream_master() {
        let config = RunnerConfig::default();
        assert_eq!(config.base_ref, "macports/master");
        assert_eq!(config.tool.mpbb, "mpbb");
    }

    #[test]
    fn file_overrides_only_named_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portci.json");
        std::fs::write(
            &path,
            r#"{"log": {"keep_alive_secs": 60}, "tool": {"stage_timeout_secs": 7200}}"#,
        )
        .unwrap();

        let config = RunnerConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.log.keep_alive_secs, 60);
        assert_eq!(config.log.upload_attempts, 3);
        assert_eq!(config.tool.stage_timeout_secs, 7200);
        assert_eq!(config.tool.port, "port");
        assert_eq!(config.base_ref, "macports/master");
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunnerConfig::load(Some(dir.path().join("nope.json").as_path())).unwrap_err();
        assert!(matches!(err, CiError::Config(_)));
    }

    #[test]
    fn non_object_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portci.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(
            RunnerConfig::load(Some(path.as_path())),
            Err(CiError::Config(_))
        ));
    }

    #[test]
    fn merge_replaces_leaves_and_keeps_siblings() {
        let mut base = serde_json::json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge(&mut base, serde_json::json!({"a": {"b": 10}, "e": 4}));
        assert_eq!(base, serde_json::json!({"a": {"b": 10, "c": 2}, "d": 3, "e": 4}));
    }
}
