use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::api::{ApiClient, HttpError};
use crate::config::TagSources;
use crate::logging::{log_fetch_failure, log_history_load, Domain};
use crate::model::{HistoryPoint, SystemState};

/// Selectable tag names, namespaced and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagCatalog(Vec<String>);

impl TagCatalog {
    pub fn from_maps(
        coils: &Map<String, Value>,
        input_registers: &Map<String, Value>,
        simulation: &Map<String, Value>,
    ) -> Self {
        let mut tags = BTreeSet::new();
        tags.extend(input_registers.keys().map(|addr| format!("PLC_IW_{}", addr)));
        tags.extend(coils.keys().map(|addr| format!("PLC_QX_{}", addr)));
        tags.extend(simulation.keys().cloned());
        Self(tags.into_iter().collect())
    }

    pub fn from_sources(sources: &TagSources) -> Self {
        Self::from_maps(&sources.coils, &sources.input_registers, &sources.simulation)
    }

    pub fn from_system_state(state: &SystemState) -> Self {
        let empty = Map::new();
        let plc = state.plc_data.as_ref();
        Self::from_maps(
            plc.map(|p| &p.coils).unwrap_or(&empty),
            plc.map(|p| &p.input_registers).unwrap_or(&empty),
            state.simulation_data.as_ref().unwrap_or(&empty),
        )
    }

    pub fn tags(&self) -> &[String] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartPoint {
    pub at: DateTime<Utc>,
    pub value: f64,
}

impl ChartPoint {
    pub fn from_sample(p: &HistoryPoint) -> Option<Self> {
        let ms = (p.ts * 1000.0).round();
        if !ms.is_finite() {
            return None;
        }
        Utc.timestamp_millis_opt(ms as i64)
            .single()
            .map(|at| Self { at, value: p.value })
    }
}

/// Dataset plus the inline status line shown next to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChartModel {
    pub label: String,
    pub points: Vec<ChartPoint>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    NoSelection,
    Loaded(usize),
    Failed(HttpError),
    /// A later load started before this one finished.
    Superseded,
}

pub struct HistoryLoader {
    client: ApiClient,
    chart: Mutex<ChartModel>,
    seq: AtomicU64,
}

impl HistoryLoader {
    pub fn new(client: ApiClient) -> Self {
        Self { client, chart: Mutex::new(ChartModel::default()), seq: AtomicU64::new(0) }
    }

    fn chart_mut(&self) -> MutexGuard<'_, ChartModel> {
        match self.chart.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn chart(&self) -> ChartModel {
        self.chart_mut().clone()
    }

    pub async fn load(&self, tag: &str) -> LoadOutcome {
        if tag.trim().is_empty() {
            self.chart_mut().status = "Please select a tag.".to_string();
            return LoadOutcome::NoSelection;
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut chart = self.chart_mut();
            chart.status = format!("Loading history for {}...", tag);
            chart.label = format!("{} Value", tag);
        }

        let outcome = self.client.history(tag).await;
        if self.seq.load(Ordering::SeqCst) != seq {
            return LoadOutcome::Superseded;
        }

        let mut chart = self.chart_mut();
        match outcome {
            Ok(mut series) => {
                let samples = series.remove(tag).flatten().unwrap_or_default();
                chart.points = samples.iter().filter_map(ChartPoint::from_sample).collect();
                let n = chart.points.len();
                chart.status = format!("Loaded {} points for {}.", n, tag);
                log_history_load(tag, n);
                LoadOutcome::Loaded(n)
            }
            Err(err) => {
                log_fetch_failure(Domain::History, &format!("/history/{}", tag), err.status, &err.message);
                chart.points.clear();
                chart.status = format!("Error loading history: {}", err.message);
                LoadOutcome::Failed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedTransport;
    use crate::api::Method;
    use serde_json::json;
    use std::sync::Arc;

    fn loader() -> (HistoryLoader, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new());
        (HistoryLoader::new(ApiClient::new(transport.clone())), transport)
    }

    #[test]
    fn test_catalog_namespaces_and_sorts() {
        let coils = json!({"0": true, "1": false});
        let regs = json!({"0": 300, "4": 90});
        let sim = json!({"sim_Temperature": 40.0, "PLC_QX_0": 1});
        let cat = TagCatalog::from_maps(
            coils.as_object().unwrap(),
            regs.as_object().unwrap(),
            sim.as_object().unwrap(),
        );
        assert_eq!(
            cat.tags(),
            ["PLC_IW_0", "PLC_IW_4", "PLC_QX_0", "PLC_QX_1", "sim_Temperature"]
        );
    }

    #[test]
    fn test_catalog_from_state_without_data() {
        assert!(TagCatalog::from_system_state(&SystemState::default()).tags().is_empty());
    }

    #[tokio::test]
    async fn test_load_preserves_order_and_converts_to_millis() {
        let (loader, transport) = loader();
        transport.reply(Method::Get, "/history/T1", Ok(json!({"T1": [[1000, 5.5], [1001, 6.0]]})));

        assert_eq!(loader.load("T1").await, LoadOutcome::Loaded(2));
        let chart = loader.chart();
        assert_eq!(chart.points[0].at.timestamp_millis(), 1_000_000);
        assert_eq!(chart.points[0].value, 5.5);
        assert_eq!(chart.points[1].at.timestamp_millis(), 1_001_000);
        assert_eq!(chart.points[1].value, 6.0);
        assert_eq!(chart.label, "T1 Value");
        assert!(chart.status.contains('2'));
    }

    #[tokio::test]
    async fn test_absent_key_is_empty_series() {
        let (loader, transport) = loader();
        transport.reply(Method::Get, "/history/T2", Ok(json!({})));
        assert_eq!(loader.load("T2").await, LoadOutcome::Loaded(0));
        assert!(loader.chart().points.is_empty());
    }

    #[tokio::test]
    async fn test_tag_is_requested_verbatim() {
        let (loader, transport) = loader();
        transport.reply(Method::Get, "/history/ T1 ", Ok(json!({" T1 ": [[1000, 2.0]], "T1": []})));
        assert_eq!(loader.load(" T1 ").await, LoadOutcome::Loaded(1));
        assert_eq!(transport.calls()[0].path, "/history/ T1 ");
        assert_eq!(loader.chart().label, " T1  Value");
    }

    #[tokio::test]
    async fn test_null_series_is_empty() {
        let (loader, transport) = loader();
        transport.reply(Method::Get, "/history/T3", Ok(json!({"T3": null})));
        assert_eq!(loader.load("T3").await, LoadOutcome::Loaded(0));
        assert_eq!(loader.chart().status, "Loaded 0 points for T3.");
    }

    #[tokio::test]
    async fn test_empty_selection_is_noop() {
        let (loader, transport) = loader();
        assert_eq!(loader.load("  ").await, LoadOutcome::NoSelection);
        assert_eq!(loader.chart().status, "Please select a tag.");
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failure_clears_previous_dataset() {
        let (loader, transport) = loader();
        transport.reply(Method::Get, "/history/T1", Ok(json!({"T1": [[1000, 1.0]]})));
        transport.reply(Method::Get, "/history/T1", Err(HttpError::from_response(503, &Value::Null)));

        loader.load("T1").await;
        assert_eq!(loader.chart().points.len(), 1);
        assert!(matches!(loader.load("T1").await, LoadOutcome::Failed(_)));
        let chart = loader.chart();
        assert!(chart.points.is_empty());
        assert_eq!(chart.status, "Error loading history: HTTP error 503");
    }
}
