use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::model::{ScenarioDef, ScenarioId, ScenarioResult};

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base: String,
    pub refresh_interval_ms: u64,
    pub connection_timeout_secs: f64,
    pub http_timeout_secs: u64,
    pub suppress_overlap: bool,
    pub bootstrap_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:5001/api".to_string(),
            refresh_interval_ms: 2000,
            connection_timeout_secs: 10.0,
            http_timeout_secs: 10,
            suppress_overlap: true,
            bootstrap_path: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            api_base: std::env::var("BRIDGE_API_BASE").unwrap_or(d.api_base),
            refresh_interval_ms: std::env::var("REFRESH_INTERVAL_MS").ok().and_then(|v| v.parse().ok()).filter(|ms| *ms > 0).unwrap_or(d.refresh_interval_ms),
            connection_timeout_secs: std::env::var("CONNECTION_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.connection_timeout_secs),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.http_timeout_secs),
            suppress_overlap: std::env::var("SUPPRESS_OVERLAP").ok().and_then(|v| parse_flag(&v)).unwrap_or(d.suppress_overlap),
            bootstrap_path: std::env::var("BOOTSTRAP_PATH").ok(),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Raw key sets the tag catalog is derived from.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagSources {
    #[serde(default, deserialize_with = "crate::model::null_default")]
    pub coils: Map<String, Value>,
    #[serde(default, deserialize_with = "crate::model::null_default")]
    pub input_registers: Map<String, Value>,
    #[serde(default, deserialize_with = "crate::model::null_default")]
    pub simulation: Map<String, Value>,
}

/// Inputs the hosting page renders in once at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Bootstrap {
    #[serde(default, deserialize_with = "crate::model::null_default")]
    pub scenarios: BTreeMap<ScenarioId, ScenarioDef>,
    #[serde(default, deserialize_with = "crate::model::null_default")]
    pub results: BTreeMap<ScenarioId, ScenarioResult>,
    #[serde(default)]
    pub tag_sources: Option<TagSources>,
}

impl Bootstrap {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading bootstrap {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing bootstrap {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut boot: Bootstrap = serde_json::from_str(raw)?;
        for id in boot.scenarios.keys() {
            boot.results.entry(*id).or_insert_with(ScenarioResult::not_started);
        }
        Ok(boot)
    }
}
