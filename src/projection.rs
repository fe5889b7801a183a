//! Pure mappings from polled state to presentation records.

use std::fmt;

use chrono::{Local, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::model::{
    ConnectionStatus, LatestValues, ScenarioDef, ScenarioId, ScenarioResult, ScenarioStatus,
    SystemState,
};

pub const NO_DATA: &str = "No data available.";
pub const NO_SYSTEM_ERRORS: &str = "No recent system errors.";
pub const FETCH_STATUS_ERROR: &str = "Error fetching status updates.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indicator {
    Green,
    Yellow,
    Red,
}

impl Indicator {
    pub fn label(&self) -> &'static str {
        match self {
            Indicator::Green => "Connected",
            Indicator::Yellow => "Stale",
            Indicator::Red => "Disconnected",
        }
    }
}

/// Stale exactly at `timeout_secs`.
pub fn classify(status: &ConnectionStatus, now: f64, timeout_secs: f64) -> Indicator {
    if !status.connected {
        return Indicator::Red;
    }
    match status.last_ok {
        Some(last_ok) if now - last_ok < timeout_secs => Indicator::Green,
        _ => Indicator::Yellow,
    }
}

pub fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Local wall-clock time, `N/A` for absent or zero timestamps.
pub fn format_timestamp(unix_secs: Option<f64>) -> String {
    let secs = match unix_secs {
        Some(s) if s.is_finite() && s != 0.0 => s,
        _ => return "N/A".to_string(),
    };
    match Local.timestamp_millis_opt((secs * 1000.0).round() as i64).single() {
        Some(t) => t.format("%H:%M:%S").to_string(),
        None => "N/A".to_string(),
    }
}

pub fn failure_label(at_unix_secs: f64) -> String {
    format!("Error at {}", format_timestamp(Some(at_unix_secs)))
}

/// Non-integral numbers get two decimals; everything else prints as-is.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() != 0.0 => format!("{:.2}", f),
            Some(f) => format!("{}", f),
            None => n.to_string(),
        },
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableRow {
    Entry { key: String, value: String },
    NoData,
}

impl fmt::Display for TableRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableRow::Entry { key, value } => write!(f, "{:<24} {}", key, value),
            TableRow::NoData => f.write_str(NO_DATA),
        }
    }
}

/// Address-like keys first in numeric order, then the rest as received.
pub fn render_table(values: &Map<String, Value>) -> Vec<TableRow> {
    if values.is_empty() {
        return vec![TableRow::NoData];
    }
    let mut numeric: Vec<(u64, &String, &Value)> = Vec::new();
    let mut named: Vec<(&String, &Value)> = Vec::new();
    for (k, v) in values {
        match k.parse::<u64>() {
            Ok(n) if n.to_string() == *k => numeric.push((n, k, v)),
            _ => named.push((k, v)),
        }
    }
    numeric.sort_by_key(|(n, _, _)| *n);
    numeric
        .into_iter()
        .map(|(_, k, v)| (k, v))
        .chain(named)
        .map(|(k, v)| TableRow::Entry { key: k.clone(), value: format_value(v) })
        .collect()
}

/// Most recent first.
pub fn render_errors(errors: &[String]) -> Vec<String> {
    errors.iter().rev().cloned().collect()
}

// =============================================================================
// Live views
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCard {
    pub component: String,
    pub indicator: Indicator,
    pub label: &'static str,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusView {
    pub cards: Vec<StatusCard>,
    pub errors: Vec<String>,
    pub last_updated: String,
}

pub fn project_status(state: &SystemState, now: f64, timeout_secs: f64) -> StatusView {
    let cards = state
        .connections
        .iter()
        .map(|(component, status)| {
            let indicator = classify(status, now, timeout_secs);
            StatusCard {
                component: component.clone(),
                indicator,
                label: indicator.label(),
                error: status.error.clone().filter(|e| !e.is_empty()),
            }
        })
        .collect();
    StatusView {
        cards,
        errors: render_errors(&state.system_errors),
        last_updated: format_timestamp(state.timestamp),
    }
}

impl fmt::Display for StatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for card in &self.cards {
            write!(f, "[{:?}] {:<12} {}", card.indicator, card.component, card.label)?;
            if let Some(err) = &card.error {
                write!(f, "  ({})", err)?;
            }
            writeln!(f)?;
        }
        if self.errors.is_empty() {
            writeln!(f, "{}", NO_SYSTEM_ERRORS)?;
        }
        for err in &self.errors {
            writeln!(f, " - {}", err)?;
        }
        write!(f, "last updated: {}", self.last_updated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailsView {
    pub coils: Vec<TableRow>,
    pub input_registers: Vec<TableRow>,
    pub simulation: Vec<TableRow>,
    pub last_updated: String,
}

pub fn project_details(values: &LatestValues, now: f64) -> DetailsView {
    DetailsView {
        coils: render_table(&values.plc.coils),
        input_registers: render_table(&values.plc.input_registers),
        simulation: render_table(&values.simulation),
        last_updated: format_timestamp(Some(now)),
    }
}

impl fmt::Display for DetailsView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (title, rows) in [
            ("PLC coils", &self.coils),
            ("PLC input registers", &self.input_registers),
            ("Simulation", &self.simulation),
        ] {
            writeln!(f, "{}", title)?;
            for row in rows {
                writeln!(f, "  {}", row)?;
            }
        }
        write!(f, "last updated: {}", self.last_updated)
    }
}

// =============================================================================
// Scenario rendering
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckColor {
    Green,
    Red,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckMark {
    pub text: &'static str,
    pub color: CheckColor,
}

pub fn check_mark(verdict: Option<bool>) -> CheckMark {
    match verdict {
        Some(true) => CheckMark { text: "PASS", color: CheckColor::Green },
        Some(false) => CheckMark { text: "FAIL", color: CheckColor::Red },
        None => CheckMark { text: "N/A", color: CheckColor::Neutral },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadgeStyle {
    Passed,
    Failed,
    Running,
    Waiting,
}

pub fn badge_style(status: &ScenarioStatus) -> Option<BadgeStyle> {
    match status {
        ScenarioStatus::Passed => Some(BadgeStyle::Passed),
        ScenarioStatus::Failed
        | ScenarioStatus::VisualFailed
        | ScenarioStatus::CoilCheckFailed
        | ScenarioStatus::Error => Some(BadgeStyle::Failed),
        ScenarioStatus::Running => Some(BadgeStyle::Running),
        ScenarioStatus::CoilCheckPassed => Some(BadgeStyle::Waiting),
        ScenarioStatus::NotStarted | ScenarioStatus::Unrecognized(_) => None,
    }
}

/// Whether the pass/fail buttons for the human check are offered.
pub fn affordance_visible(status: &ScenarioStatus, visual_pass: Option<bool>) -> bool {
    *status == ScenarioStatus::CoilCheckPassed && visual_pass.is_none()
}

/// Unformatted `key=value` pairs; only the tables round numbers.
pub fn details_text(details: &Map<String, Value>) -> String {
    details
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}={}", k, s),
            other => format!("{}={}", k, other),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn inputs_text(def: &ScenarioDef) -> String {
    def.sim_inputs
        .iter()
        .map(|(k, v)| format!("{}={}", k, format_value(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioView {
    pub id: ScenarioId,
    pub name: Option<String>,
    pub status: String,
    pub badge: Option<BadgeStyle>,
    pub coil: CheckMark,
    pub visual: CheckMark,
    pub error: String,
    pub details: String,
    pub inputs: String,
    pub show_visual_buttons: bool,
    pub run_enabled: bool,
}

impl ScenarioView {
    /// `visual_buttons_suppressed` hides the buttons while a verdict is in
    /// flight; it never makes them visible on its own.
    pub fn project(
        id: ScenarioId,
        result: &ScenarioResult,
        def: Option<&ScenarioDef>,
        run_enabled: bool,
        visual_buttons_suppressed: bool,
    ) -> Self {
        Self {
            id,
            name: result.name.clone().or_else(|| def.and_then(|d| d.name.clone())),
            status: result.status.to_string(),
            badge: badge_style(&result.status),
            coil: check_mark(result.coil_pass),
            visual: check_mark(result.visual_pass),
            error: result.error.clone().unwrap_or_default(),
            details: details_text(&result.details),
            inputs: def.map(inputs_text).unwrap_or_default(),
            show_visual_buttons: !visual_buttons_suppressed
                && affordance_visible(&result.status, result.visual_pass),
            run_enabled,
        }
    }
}

impl fmt::Display for ScenarioView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ", self.id)?;
        if let Some(name) = &self.name {
            write!(f, "{} ", name)?;
        }
        write!(
            f,
            "[{}] coil={} visual={}",
            self.status, self.coil.text, self.visual.text
        )?;
        if !self.error.is_empty() {
            write!(f, " error={}", self.error)?;
        }
        if !self.details.is_empty() {
            write!(f, " ({})", self.details)?;
        }
        if self.show_visual_buttons {
            write!(f, " <awaiting visual check>")?;
        }
        Ok(())
    }
}
