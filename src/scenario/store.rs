use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::api::HttpError;
use crate::logging::log_transition;
use crate::model::{ScenarioDef, ScenarioId, ScenarioResult};
use crate::projection::ScenarioView;

use super::machine::{Rejection, ScenarioEntry, Stale, Ticket, VisualOutcome};
use super::EngineError;

struct Inner {
    entries: BTreeMap<ScenarioId, ScenarioEntry>,
    defs: BTreeMap<ScenarioId, ScenarioDef>,
    attached: bool,
}

/// Single-writer table of scenario records.
///
/// Cloning shares the table. Every mutation publishes the scenario's new
/// [`ScenarioView`] to subscribers.
#[derive(Clone)]
pub struct ScenarioStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<ScenarioView>,
}

impl ScenarioStore {
    pub fn new(
        defs: BTreeMap<ScenarioId, ScenarioDef>,
        results: BTreeMap<ScenarioId, ScenarioResult>,
    ) -> Self {
        let mut entries: BTreeMap<ScenarioId, ScenarioEntry> = results
            .into_iter()
            .map(|(id, r)| (id, ScenarioEntry::new(r)))
            .collect();
        for id in defs.keys() {
            entries
                .entry(*id)
                .or_insert_with(|| ScenarioEntry::new(ScenarioResult::not_started()));
        }
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(Inner { entries, defs, attached: true })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScenarioView> {
        self.events.subscribe()
    }

    pub fn ids(&self) -> Vec<ScenarioId> {
        self.lock().entries.keys().copied().collect()
    }

    pub fn result(&self, id: ScenarioId) -> Option<ScenarioResult> {
        self.lock().entries.get(&id).map(|e| e.result().clone())
    }

    pub fn view(&self, id: ScenarioId) -> Option<ScenarioView> {
        let inner = self.lock();
        inner.entries.get(&id).map(|e| project(&inner, id, e))
    }

    pub fn views(&self) -> Vec<ScenarioView> {
        let inner = self.lock();
        inner.entries.iter().map(|(id, e)| project(&inner, *id, e)).collect()
    }

    /// Stop applying answers, e.g. when the page is left.
    pub fn detach(&self) {
        self.lock().attached = false;
    }

    pub fn attach(&self) {
        self.lock().attached = true;
    }

    fn publish(&self, view: ScenarioView) {
        // no subscribers is fine
        let _ = self.events.send(view);
    }

    pub(crate) fn begin_run(&self, id: ScenarioId) -> Result<Ticket, EngineError> {
        let (ticket, view) = {
            let mut inner = self.lock();
            let entry = inner.entries.get_mut(&id).ok_or(EngineError::UnknownScenario(id))?;
            let prev = entry.result().status.to_string();
            let ticket = entry.begin_run().map_err(|r| rejection(id, r))?;
            log_transition(id, &prev, &entry.result().status.to_string(), "local");
            let entry = entry.clone();
            (ticket, project(&inner, id, &entry))
        };
        self.publish(view);
        Ok(ticket)
    }

    pub(crate) fn reconcile_run(
        &self,
        id: ScenarioId,
        ticket: Ticket,
        outcome: Result<ScenarioResult, HttpError>,
    ) -> Result<ScenarioResult, EngineError> {
        let (result, view) = {
            let mut inner = self.lock();
            let attached = inner.attached;
            let entry = inner.entries.get_mut(&id).ok_or(EngineError::UnknownScenario(id))?;
            if !attached {
                entry.abandon(ticket).map_err(|Stale| EngineError::Superseded(id))?;
                return Err(EngineError::Detached);
            }
            let result = entry
                .reconcile_run(ticket, outcome)
                .map_err(|Stale| EngineError::Superseded(id))?
                .clone();
            log_transition(id, "Running", result.status.as_str(), "remote");
            let entry = entry.clone();
            (result, project(&inner, id, &entry))
        };
        self.publish(view);
        Ok(result)
    }

    pub(crate) fn begin_visual(&self, id: ScenarioId) -> Result<Ticket, EngineError> {
        let (ticket, view) = {
            let mut inner = self.lock();
            let entry = inner.entries.get_mut(&id).ok_or(EngineError::UnknownScenario(id))?;
            let ticket = entry.begin_visual().map_err(|r| rejection(id, r))?;
            let entry = entry.clone();
            (ticket, project(&inner, id, &entry))
        };
        self.publish(view);
        Ok(ticket)
    }

    pub(crate) fn reconcile_visual(
        &self,
        id: ScenarioId,
        ticket: Ticket,
        outcome: Result<ScenarioResult, HttpError>,
    ) -> Result<VisualOutcome, EngineError> {
        let (outcome, view) = {
            let mut inner = self.lock();
            let attached = inner.attached;
            let entry = inner.entries.get_mut(&id).ok_or(EngineError::UnknownScenario(id))?;
            if !attached {
                entry.abandon(ticket).map_err(|Stale| EngineError::Superseded(id))?;
                return Err(EngineError::Detached);
            }
            let prev = entry.result().status.to_string();
            let outcome = entry
                .reconcile_visual(ticket, outcome)
                .map_err(|Stale| EngineError::Superseded(id))?;
            if let VisualOutcome::Recorded(r) = &outcome {
                log_transition(id, &prev, r.status.as_str(), "remote");
            }
            let entry = entry.clone();
            (outcome, project(&inner, id, &entry))
        };
        self.publish(view);
        Ok(outcome)
    }

    pub(crate) fn restore_visual(&self, id: ScenarioId) {
        let view = {
            let mut inner = self.lock();
            let Some(entry) = inner.entries.get_mut(&id) else {
                return;
            };
            entry.restore_visual();
            let entry = entry.clone();
            project(&inner, id, &entry)
        };
        self.publish(view);
    }

    /// Adopt server records for idle scenarios; returns how many changed.
    pub(crate) fn merge_snapshot(&self, snapshot: BTreeMap<ScenarioId, ScenarioResult>) -> usize {
        let mut changed = Vec::new();
        {
            let mut inner = self.lock();
            for (id, result) in snapshot {
                let entry = inner
                    .entries
                    .entry(id)
                    .or_insert_with(|| ScenarioEntry::new(ScenarioResult::not_started()));
                if entry.result() == &result {
                    continue;
                }
                let prev = entry.result().status.to_string();
                if entry.replace_if_idle(result) {
                    log_transition(id, &prev, entry.result().status.as_str(), "resync");
                    let entry = entry.clone();
                    changed.push(project(&inner, id, &entry));
                }
            }
        }
        let n = changed.len();
        for view in changed {
            self.publish(view);
        }
        n
    }
}

fn project(inner: &Inner, id: ScenarioId, entry: &ScenarioEntry) -> ScenarioView {
    ScenarioView::project(
        id,
        entry.result(),
        inner.defs.get(&id),
        entry.run_enabled(),
        entry.visual_suppressed(),
    )
}

fn rejection(id: ScenarioId, r: Rejection) -> EngineError {
    match r {
        Rejection::InFlight => EngineError::InFlight(id),
        Rejection::NotAwaitingVisual => EngineError::NotAwaitingVisual(id),
    }
}
