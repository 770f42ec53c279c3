//! Per-invocation identity passed to the worker as its single argument.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSettings {
    pub container_id: String,
    pub callback_key: String,
    pub callback_url: String,
    pub container_type: String,
    /// Interface name to MTU, applied before the first report.
    #[serde(default)]
    pub mtu: BTreeMap<String, u32>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub inspection_url: Option<String>,
}

impl LaunchSettings {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::JsonParsingFailed {
            message: format!("invalid launch settings: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_settings() {
        let settings = LaunchSettings::from_json(
            r#"{"container_id":"c1","callback_key":"k","callback_url":"http://ctl/cb","container_type":"application"}"#,
        )
        .unwrap();
        assert_eq!(settings.container_id, "c1");
        assert!(settings.mtu.is_empty());
        assert!(!settings.debug);
        assert!(settings.inspection_url.is_none());
    }

    #[test]
    fn parses_mtu_map_and_debug() {
        let settings = LaunchSettings::from_json(
            r#"{"container_id":"c1","callback_key":"k","callback_url":"u","container_type":"data",
                "mtu":{"eth0":1450},"debug":true}"#,
        )
        .unwrap();
        assert_eq!(settings.mtu.get("eth0"), Some(&1450));
        assert!(settings.debug);
    }

    #[test]
    fn rejects_missing_identity() {
        let err = LaunchSettings::from_json(r#"{"container_id":"c1"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::JsonParsingFailed { .. }));
    }
}
