use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub type ScenarioId = u32;

/// Treats an explicit `null` like a missing key.
pub(crate) fn null_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

/// Health of one bridge component as last reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ConnectionStatus {
    #[serde(default, deserialize_with = "null_default")]
    pub connected: bool,
    #[serde(default)]
    pub last_ok: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PlcValues {
    #[serde(default, deserialize_with = "null_default")]
    pub coils: Map<String, Value>,
    #[serde(default, deserialize_with = "null_default")]
    pub input_registers: Map<String, Value>,
}

/// `GET /system-state`. Replaced wholesale on every poll.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SystemState {
    #[serde(default, deserialize_with = "null_default")]
    pub connections: BTreeMap<String, ConnectionStatus>,
    #[serde(default, deserialize_with = "null_default")]
    pub system_errors: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub plc_data: Option<PlcValues>,
    #[serde(default)]
    pub simulation_data: Option<Map<String, Value>>,
    #[serde(default)]
    pub test_results: Option<BTreeMap<ScenarioId, ScenarioResult>>,
}

/// `GET /latest-values`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LatestValues {
    #[serde(default, deserialize_with = "null_default")]
    pub plc: PlcValues,
    #[serde(default, deserialize_with = "null_default")]
    pub simulation: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum ScenarioStatus {
    #[default]
    NotStarted,
    Running,
    CoilCheckPassed,
    CoilCheckFailed,
    Passed,
    Failed,
    VisualFailed,
    Error,
    Unrecognized(String),
}

impl ScenarioStatus {
    pub const ALL: [ScenarioStatus; 7] = [
        ScenarioStatus::NotStarted,
        ScenarioStatus::Running,
        ScenarioStatus::CoilCheckPassed,
        ScenarioStatus::Passed,
        ScenarioStatus::Failed,
        ScenarioStatus::VisualFailed,
        ScenarioStatus::Error,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            ScenarioStatus::NotStarted => "Not Started",
            ScenarioStatus::Running => "Running",
            ScenarioStatus::CoilCheckPassed => "Coil Check Passed",
            ScenarioStatus::CoilCheckFailed => "Coil Check Failed",
            ScenarioStatus::Passed => "Passed",
            ScenarioStatus::Failed => "Failed",
            ScenarioStatus::VisualFailed => "Visual Failed",
            ScenarioStatus::Error => "Error",
            ScenarioStatus::Unrecognized(raw) => raw,
        }
    }
}

impl From<String> for ScenarioStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "Not Started" => ScenarioStatus::NotStarted,
            "Running" => ScenarioStatus::Running,
            "Coil Check Passed" => ScenarioStatus::CoilCheckPassed,
            "Coil Check Failed" => ScenarioStatus::CoilCheckFailed,
            "Passed" => ScenarioStatus::Passed,
            "Failed" => ScenarioStatus::Failed,
            "Visual Failed" | "Visual Check Failed" => ScenarioStatus::VisualFailed,
            "Error" => ScenarioStatus::Error,
            _ => ScenarioStatus::Unrecognized(raw),
        }
    }
}

impl From<ScenarioStatus> for String {
    fn from(status: ScenarioStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification record for one scenario.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ScenarioResult {
    #[serde(default, deserialize_with = "null_default")]
    pub status: ScenarioStatus,
    #[serde(default)]
    pub coil_pass: Option<bool>,
    #[serde(default)]
    pub visual_pass: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ScenarioResult {
    pub fn not_started() -> Self {
        Self::default()
    }

    /// Local stand-in used when the remote call itself failed.
    pub fn synthetic_error(message: impl Into<String>) -> Self {
        Self {
            status: ScenarioStatus::Error,
            coil_pass: Some(false),
            visual_pass: None,
            error: Some(message.into()),
            details: Map::new(),
            name: None,
        }
    }

    /// `visual_pass` only after a passed coil check, and the waiting state
    /// has no visual verdict yet.
    pub fn is_consistent(&self) -> bool {
        if self.visual_pass.is_some() && self.coil_pass != Some(true) {
            return false;
        }
        if self.status == ScenarioStatus::CoilCheckPassed {
            return self.coil_pass == Some(true) && self.visual_pass.is_none();
        }
        true
    }

    pub fn awaits_visual(&self) -> bool {
        self.status == ScenarioStatus::CoilCheckPassed && self.visual_pass.is_none()
    }
}

/// Catalog entry supplied by the hosting page.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScenarioDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub sim_inputs: Map<String, Value>,
}

/// One `(unix_seconds, value)` sample. Coil histories carry booleans.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(from = "(f64, SampleValue)")]
pub struct HistoryPoint {
    pub ts: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Num(f64),
    Flag(bool),
}

impl From<(f64, SampleValue)> for HistoryPoint {
    fn from((ts, value): (f64, SampleValue)) -> Self {
        let value = match value {
            SampleValue::Num(v) => v,
            SampleValue::Flag(true) => 1.0,
            SampleValue::Flag(false) => 0.0,
        };
        Self { ts, value }
    }
}

/// A tag mapped to `null` reads as an empty series.
pub type HistoryResponse = HashMap<String, Option<Vec<HistoryPoint>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_roundtrips_known_and_unknown() {
        let s: ScenarioStatus = serde_json::from_value(json!("Coil Check Passed")).unwrap();
        assert_eq!(s, ScenarioStatus::CoilCheckPassed);
        let s: ScenarioStatus = serde_json::from_value(json!("Visual Check Failed")).unwrap();
        assert_eq!(s, ScenarioStatus::VisualFailed);
        let s: ScenarioStatus = serde_json::from_value(json!("Paused")).unwrap();
        assert_eq!(s, ScenarioStatus::Unrecognized("Paused".to_string()));
        assert_eq!(serde_json::to_value(&s).unwrap(), json!("Paused"));
    }

    #[test]
    fn test_result_tolerates_missing_fields() {
        let r: ScenarioResult = serde_json::from_value(json!({"status": "Running"})).unwrap();
        assert_eq!(r.status, ScenarioStatus::Running);
        assert_eq!(r.coil_pass, None);
        assert!(r.details.is_empty());
    }

    #[test]
    fn test_synthetic_error_is_consistent() {
        let r = ScenarioResult::synthetic_error("db down");
        assert_eq!(r.status, ScenarioStatus::Error);
        assert_eq!(r.coil_pass, Some(false));
        assert_eq!(r.visual_pass, None);
        assert!(r.is_consistent());
    }

    #[test]
    fn test_consistency_rejects_visual_without_coil() {
        let r = ScenarioResult {
            status: ScenarioStatus::Passed,
            coil_pass: None,
            visual_pass: Some(true),
            ..Default::default()
        };
        assert!(!r.is_consistent());

        let waiting_with_verdict = ScenarioResult {
            status: ScenarioStatus::CoilCheckPassed,
            coil_pass: Some(true),
            visual_pass: Some(false),
            ..Default::default()
        };
        assert!(!waiting_with_verdict.is_consistent());
    }

    #[test]
    fn test_history_point_accepts_bool_samples() {
        let pts: Vec<HistoryPoint> =
            serde_json::from_value(json!([[1000, 5.5], [1001.5, true]])).unwrap();
        assert_eq!(pts[0], HistoryPoint { ts: 1000.0, value: 5.5 });
        assert_eq!(pts[1], HistoryPoint { ts: 1001.5, value: 1.0 });
    }

    #[test]
    fn test_null_collections_read_as_empty() {
        let v: LatestValues = serde_json::from_value(json!({"plc": null, "simulation": null})).unwrap();
        assert_eq!(v, LatestValues::default());

        let v: LatestValues = serde_json::from_value(json!({
            "plc": {"coils": null, "input_registers": {"0": 12}},
            "simulation": {}
        }))
        .unwrap();
        assert!(v.plc.coils.is_empty());
        assert_eq!(v.plc.input_registers.len(), 1);

        let s: SystemState = serde_json::from_value(json!({
            "connections": {"plc": {"connected": null, "last_ok": null, "error": null}},
            "system_errors": null
        }))
        .unwrap();
        assert!(s.system_errors.is_empty());
        assert!(!s.connections["plc"].connected);

        let s: SystemState = serde_json::from_value(json!({"connections": null})).unwrap();
        assert!(s.connections.is_empty());
    }

    #[test]
    fn test_null_status_and_details_in_result() {
        let r: ScenarioResult = serde_json::from_value(json!({
            "status": "Coil Check Passed",
            "coil_pass": true,
            "visual_pass": null,
            "details": null
        }))
        .unwrap();
        assert_eq!(r.status, ScenarioStatus::CoilCheckPassed);
        assert!(r.details.is_empty());
        assert!(r.is_consistent());

        let r: ScenarioResult = serde_json::from_value(json!({"status": null})).unwrap();
        assert_eq!(r.status, ScenarioStatus::NotStarted);

        let d: ScenarioDef = serde_json::from_value(json!({"name": null, "sim_inputs": null})).unwrap();
        assert!(d.sim_inputs.is_empty());
    }

    #[test]
    fn test_system_state_keys_scenarios_by_number() {
        let s: SystemState = serde_json::from_value(json!({
            "connections": {"openplc": {"connected": true, "last_ok": 10.0, "error": null}},
            "system_errors": ["a"],
            "timestamp": 12.0,
            "test_results": {"3": {"status": "Passed", "coil_pass": true, "visual_pass": true}}
        }))
        .unwrap();
        assert!(s.connections["openplc"].connected);
        let results = s.test_results.unwrap();
        assert_eq!(results[&3].status, ScenarioStatus::Passed);
    }
}
