//! Client-side model of the PLC/simulation bridge dashboard.
//!
//! Polls the bridge REST API for live telemetry, drives the two-phase
//! scenario verification workflow, and loads per-tag history series.

pub mod api;
pub mod config;
pub mod history;
pub mod logging;
pub mod model;
pub mod projection;
pub mod refresh;
pub mod scenario;
