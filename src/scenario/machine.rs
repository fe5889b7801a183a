//! Per-scenario verification state machine.
//!
//! Remote calls follow a provisional/authoritative pattern: `begin_*`
//! applies the optimistic local state and hands out a ticket, `reconcile_*`
//! applies the server answer only if that ticket is still the current one.

use crate::api::HttpError;
use crate::model::{ScenarioResult, ScenarioStatus};

pub type Ticket = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A run or visual verdict for this scenario has not been answered yet.
    InFlight,
    /// The scenario is not in the waiting-for-human state.
    NotAwaitingVisual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stale;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Run(Ticket),
    Visual(Ticket),
}

#[derive(Debug, Clone, PartialEq)]
pub enum VisualOutcome {
    Recorded(ScenarioResult),
    /// The verdict was not stored. Buttons stay hidden until
    /// [`ScenarioEntry::restore_visual`] after the user acknowledged.
    Rejected(HttpError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioEntry {
    result: ScenarioResult,
    pending: Option<Pending>,
    run_enabled: bool,
    visual_suppressed: bool,
    next_ticket: Ticket,
    /// Record and trigger state from before the provisional `Running`.
    before_run: Option<(ScenarioResult, bool)>,
}

const RUN_FALLBACK: &str = "Failed to run test.";

impl ScenarioEntry {
    pub fn new(result: ScenarioResult) -> Self {
        let run_enabled = result.status != ScenarioStatus::Running;
        Self {
            result,
            pending: None,
            run_enabled,
            visual_suppressed: false,
            next_ticket: 1,
            before_run: None,
        }
    }

    pub fn result(&self) -> &ScenarioResult {
        &self.result
    }

    pub fn run_enabled(&self) -> bool {
        self.run_enabled
    }

    pub fn visual_suppressed(&self) -> bool {
        self.visual_suppressed
    }

    pub fn in_flight(&self) -> bool {
        self.pending.is_some()
    }

    pub fn visual_buttons_visible(&self) -> bool {
        !self.visual_suppressed && self.result.awaits_visual()
    }

    fn issue(&mut self) -> Ticket {
        let t = self.next_ticket;
        self.next_ticket += 1;
        t
    }

    pub fn begin_run(&mut self) -> Result<Ticket, Rejection> {
        if self.pending.is_some() {
            return Err(Rejection::InFlight);
        }
        let ticket = self.issue();
        self.pending = Some(Pending::Run(ticket));
        self.before_run = Some((self.result.clone(), self.run_enabled));
        self.run_enabled = false;
        self.result.status = ScenarioStatus::Running;
        self.result.error = None;
        Ok(ticket)
    }

    /// Trigger stays disabled only when the answer waits for a human.
    pub fn reconcile_run(
        &mut self,
        ticket: Ticket,
        outcome: Result<ScenarioResult, HttpError>,
    ) -> Result<&ScenarioResult, Stale> {
        if self.pending != Some(Pending::Run(ticket)) {
            return Err(Stale);
        }
        self.pending = None;
        self.before_run = None;
        self.result = match outcome {
            Ok(r) if r.is_consistent() => r,
            Ok(r) => ScenarioResult::synthetic_error(format!(
                "inconsistent result from server (status={}, coil_pass={:?}, visual_pass={:?})",
                r.status, r.coil_pass, r.visual_pass
            )),
            Err(e) if e.message.is_empty() => ScenarioResult::synthetic_error(RUN_FALLBACK),
            Err(e) => ScenarioResult::synthetic_error(e.message),
        };
        self.run_enabled = self.result.status != ScenarioStatus::CoilCheckPassed;
        self.visual_suppressed = false;
        Ok(&self.result)
    }

    pub fn begin_visual(&mut self) -> Result<Ticket, Rejection> {
        if self.pending.is_some() {
            return Err(Rejection::InFlight);
        }
        if !self.visual_buttons_visible() {
            return Err(Rejection::NotAwaitingVisual);
        }
        let ticket = self.issue();
        self.pending = Some(Pending::Visual(ticket));
        self.visual_suppressed = true;
        Ok(ticket)
    }

    pub fn reconcile_visual(
        &mut self,
        ticket: Ticket,
        outcome: Result<ScenarioResult, HttpError>,
    ) -> Result<VisualOutcome, Stale> {
        if self.pending != Some(Pending::Visual(ticket)) {
            return Err(Stale);
        }
        self.pending = None;
        match outcome {
            Ok(r) if r.is_consistent() => {
                self.result = r;
                self.visual_suppressed = false;
                self.run_enabled = self.result.status != ScenarioStatus::Running;
                Ok(VisualOutcome::Recorded(self.result.clone()))
            }
            Ok(r) => Ok(VisualOutcome::Rejected(HttpError::malformed(format!(
                "inconsistent result from server (status={}, coil_pass={:?}, visual_pass={:?})",
                r.status, r.coil_pass, r.visual_pass
            )))),
            Err(e) => Ok(VisualOutcome::Rejected(e)),
        }
    }

    /// Forget an outstanding request without applying its answer. A run
    /// is rolled back to the record it started from.
    pub fn abandon(&mut self, ticket: Ticket) -> Result<(), Stale> {
        match self.pending {
            Some(Pending::Run(t)) if t == ticket => {
                if let Some((result, run_enabled)) = self.before_run.take() {
                    self.result = result;
                    self.run_enabled = run_enabled;
                }
            }
            Some(Pending::Visual(t)) if t == ticket => {}
            _ => return Err(Stale),
        }
        self.pending = None;
        self.visual_suppressed = false;
        Ok(())
    }

    /// Offer the pass/fail buttons again after a rejected verdict.
    pub fn restore_visual(&mut self) {
        if self.pending.is_none() {
            self.visual_suppressed = false;
        }
    }

    /// Adopt a server snapshot unless a local request is outstanding.
    pub fn replace_if_idle(&mut self, result: ScenarioResult) -> bool {
        if self.pending.is_some() || !result.is_consistent() {
            return false;
        }
        self.run_enabled = result.status != ScenarioStatus::Running;
        self.visual_suppressed = false;
        self.result = result;
        true
    }
}
