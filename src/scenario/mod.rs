//! Two-phase scenario verification: automated coil check, then a
//! human-confirmed visual check.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::api::{ApiClient, HttpError};
use crate::logging::{log, log_fetch_failure, obj, v_str, Domain, Level};
use crate::model::{ScenarioId, ScenarioResult};

pub mod machine;
mod store;

pub use machine::VisualOutcome;
pub use store::ScenarioStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("unknown scenario {0}")]
    UnknownScenario(ScenarioId),
    #[error("scenario {0} already has a request in flight")]
    InFlight(ScenarioId),
    #[error("scenario {0} is not awaiting a visual check")]
    NotAwaitingVisual(ScenarioId),
    #[error("answer for scenario {0} was superseded")]
    Superseded(ScenarioId),
    #[error("view detached; answer discarded")]
    Detached,
    #[error("{0}")]
    Remote(#[from] HttpError),
}

/// Surfaces an error the user has to acknowledge before work continues.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn alert(&self, message: &str);
}

/// Records the alert and returns immediately.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn alert(&self, message: &str) {
        log(Level::Warn, Domain::Scenario, "alert", obj(&[("msg", v_str(message))]));
    }
}

#[derive(Clone)]
pub struct VerificationEngine {
    client: ApiClient,
    store: ScenarioStore,
    notifier: Arc<dyn Notifier>,
}

impl VerificationEngine {
    pub fn new(client: ApiClient, store: ScenarioStore, notifier: Arc<dyn Notifier>) -> Self {
        Self { client, store, notifier }
    }

    pub fn store(&self) -> &ScenarioStore {
        &self.store
    }

    /// Execute the automated portion.
    ///
    /// A failed remote call is not an error here: the scenario ends up in a
    /// local `Error` record, which is returned.
    pub async fn run(&self, id: ScenarioId) -> Result<ScenarioResult, EngineError> {
        let ticket = self.store.begin_run(id)?;
        let outcome = self.client.run_scenario(id).await;
        if let Err(e) = &outcome {
            log_fetch_failure(Domain::Scenario, &format!("/test-scenario/{}/run", id), e.status, &e.message);
        }
        self.store.reconcile_run(id, ticket, outcome)
    }

    /// Record the human verdict. On failure the user is alerted and the
    /// pass/fail choice is offered again once the alert returns.
    pub async fn record_visual(&self, id: ScenarioId, passed: bool) -> Result<ScenarioResult, EngineError> {
        let ticket = self.store.begin_visual(id)?;
        let outcome = self.client.visual_check(id, passed).await;
        match self.store.reconcile_visual(id, ticket, outcome)? {
            VisualOutcome::Recorded(result) => Ok(result),
            VisualOutcome::Rejected(err) => {
                log_fetch_failure(
                    Domain::Scenario,
                    &format!("/test-scenario/{}/visual-check", id),
                    err.status,
                    &err.message,
                );
                self.notifier
                    .alert(&format!("Error recording visual check: {}", err.message))
                    .await;
                self.store.restore_visual(id);
                Err(EngineError::Remote(err))
            }
        }
    }

    /// Pull `/test-results` and adopt it for every idle scenario.
    pub async fn resync(&self) -> Result<usize, EngineError> {
        let snapshot = self.client.test_results().await.map_err(|e| {
            log_fetch_failure(Domain::Scenario, "/test-results", e.status, &e.message);
            e
        })?;
        Ok(self.store.merge_snapshot(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedTransport;
    use crate::api::Method;
    use crate::model::{ScenarioDef, ScenarioStatus};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn alert(&self, message: &str) {
            self.seen.lock().unwrap().push(message.to_string());
        }
    }

    fn engine(results: BTreeMap<ScenarioId, ScenarioResult>) -> (VerificationEngine, Arc<ScriptedTransport>, Arc<RecordingNotifier>) {
        let transport = Arc::new(ScriptedTransport::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut defs = BTreeMap::new();
        defs.insert(3, ScenarioDef::default());
        let store = ScenarioStore::new(defs, results);
        let engine = VerificationEngine::new(ApiClient::new(transport.clone()), store, notifier.clone());
        (engine, transport, notifier)
    }

    fn waiting_snapshot() -> BTreeMap<ScenarioId, ScenarioResult> {
        let mut m = BTreeMap::new();
        m.insert(
            3,
            ScenarioResult {
                status: ScenarioStatus::CoilCheckPassed,
                coil_pass: Some(true),
                visual_pass: None,
                ..Default::default()
            },
        );
        m
    }

    #[tokio::test]
    async fn test_run_to_coil_check_passed() {
        let (engine, transport, _) = engine(BTreeMap::new());
        transport.reply(
            Method::Post,
            "/test-scenario/3/run",
            Ok(json!({"status": "Coil Check Passed", "coil_pass": true, "visual_pass": null})),
        );
        let mut events = engine.store().subscribe();

        engine.run(3).await.unwrap();

        let provisional = events.recv().await.unwrap();
        assert_eq!(provisional.status, "Running");
        assert!(!provisional.run_enabled);
        let settled = events.recv().await.unwrap();
        assert!(settled.show_visual_buttons);
        assert!(!settled.run_enabled);
    }

    #[tokio::test]
    async fn test_run_http_500_becomes_local_error() {
        let (engine, transport, _) = engine(BTreeMap::new());
        transport.reply(
            Method::Post,
            "/test-scenario/3/run",
            Err(HttpError::from_response(500, &json!({"error": "db down"}))),
        );
        let r = engine.run(3).await.unwrap();
        assert_eq!(r.status, ScenarioStatus::Error);
        assert_eq!(r.error.as_deref(), Some("db down"));
        assert_eq!(r.coil_pass, Some(false));
        assert_eq!(r.visual_pass, None);
        assert!(engine.store().view(3).unwrap().run_enabled);
    }

    #[tokio::test]
    async fn test_second_run_rejected_without_request() {
        let (engine, transport, _) = engine(BTreeMap::new());
        let release = transport.hold(Method::Post, "/test-scenario/3/run");
        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(3).await }
        });
        tokio::task::yield_now().await;
        while engine.store().result(3).unwrap().status != ScenarioStatus::Running {
            tokio::task::yield_now().await;
        }

        assert_eq!(engine.run(3).await, Err(EngineError::InFlight(3)));

        release
            .send(Ok(json!({"status": "Failed", "coil_pass": false, "visual_pass": null})))
            .unwrap();
        let r = first.await.unwrap().unwrap();
        assert_eq!(r.status, ScenarioStatus::Failed);
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_visual_pass_hides_buttons_and_marks_green() {
        let (engine, transport, notifier) = engine(waiting_snapshot());
        transport.reply(
            Method::Post,
            "/test-scenario/3/visual-check",
            Ok(json!({"status": "Passed", "coil_pass": true, "visual_pass": true})),
        );
        let r = engine.record_visual(3, true).await.unwrap();
        assert_eq!(r.status, ScenarioStatus::Passed);

        let view = engine.store().view(3).unwrap();
        assert!(!view.show_visual_buttons);
        assert_eq!(view.coil.text, "PASS");
        assert_eq!(view.visual.text, "PASS");
        assert!(notifier.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_visual_failure_alerts_then_restores() {
        let (engine, transport, notifier) = engine(waiting_snapshot());
        transport.reply(
            Method::Post,
            "/test-scenario/3/visual-check",
            Err(HttpError::from_response(400, &json!({"error": "not run yet"}))),
        );
        let mut events = engine.store().subscribe();

        let err = engine.record_visual(3, false).await.unwrap_err();
        assert_eq!(err.to_string(), "not run yet");

        let hidden = events.recv().await.unwrap();
        assert!(!hidden.show_visual_buttons);
        let _reconciled = events.recv().await.unwrap();
        let restored = events.recv().await.unwrap();
        assert!(restored.show_visual_buttons);
        assert_eq!(
            notifier.seen.lock().unwrap().as_slice(),
            ["Error recording visual check: not run yet".to_string()]
        );
        assert_eq!(engine.store().result(3).unwrap().status, ScenarioStatus::CoilCheckPassed);
    }

    #[tokio::test]
    async fn test_visual_rejected_when_not_waiting() {
        let (engine, transport, _) = engine(BTreeMap::new());
        assert_eq!(engine.record_visual(3, true).await, Err(EngineError::NotAwaitingVisual(3)));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_resync_adopts_server_records() {
        let (engine, transport, _) = engine(BTreeMap::new());
        transport.reply(
            Method::Get,
            "/test-results",
            Ok(json!({"3": {"status": "Visual Check Failed", "coil_pass": true, "visual_pass": false}})),
        );
        assert_eq!(engine.resync().await.unwrap(), 1);
        let view = engine.store().view(3).unwrap();
        assert_eq!(view.status, "Visual Failed");
        assert_eq!(view.visual.text, "FAIL");
    }

    #[tokio::test]
    async fn test_resync_failure_leaves_table() {
        let (engine, _transport, _) = engine(waiting_snapshot());
        assert!(matches!(engine.resync().await, Err(EngineError::Remote(_))));
        assert_eq!(engine.store().result(3).unwrap().status, ScenarioStatus::CoilCheckPassed);
    }
}
