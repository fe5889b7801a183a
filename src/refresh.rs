//! Periodic re-synchronisation of the live views.
//!
//! Each [`Refresher`] owns one recurring timer. Activation cancels the
//! previous timer, fetches immediately and then once per period until
//! deactivated. Results are published through a `watch` channel; a cycle
//! that finishes after its activation was superseded is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::api::{ApiClient, HttpError};
use crate::logging::{log_fetch_failure, log_refresh, Domain, ProfileScope};
use crate::projection::{
    failure_label, format_timestamp, now_secs, project_details, project_status, DetailsView,
    StatusView, FETCH_STATUS_ERROR,
};

/// One fetch-and-render cycle for a view.
#[async_trait]
pub trait RefreshSource: Send + Sync + 'static {
    type View: Clone + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn domain(&self) -> Domain;

    async fn fetch(&self) -> Result<Self::View, HttpError>;

    /// "Last updated" text for a successful cycle.
    fn stamp(&self, _view: &Self::View) -> String {
        format_timestamp(Some(now_secs()))
    }

    fn failure_text(&self, err: &HttpError) -> String {
        err.message.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewState<V> {
    /// Last successfully rendered view, kept across failed cycles.
    pub view: Option<V>,
    pub error: Option<String>,
    pub last_updated: String,
    pub cycles: u64,
}

impl<V> Default for ViewState<V> {
    fn default() -> Self {
        Self { view: None, error: None, last_updated: "N/A".to_string(), cycles: 0 }
    }
}

pub struct Refresher<S: RefreshSource> {
    source: Arc<S>,
    period: Duration,
    suppress_overlap: bool,
    slot: Arc<watch::Sender<ViewState<S::View>>>,
    generation: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
    live_timers: Arc<AtomicUsize>,
}

impl<S: RefreshSource> Refresher<S> {
    pub fn new(source: S, period: Duration, suppress_overlap: bool) -> Self {
        let (tx, _rx) = watch::channel(ViewState::default());
        Self {
            source: Arc::new(source),
            period: period.max(Duration::from_millis(1)),
            suppress_overlap,
            slot: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
            live_timers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState<S::View>> {
        self.slot.subscribe()
    }

    pub fn snapshot(&self) -> ViewState<S::View> {
        self.slot.borrow().clone()
    }

    /// Must be called from within a tokio runtime.
    pub fn activate(&self) {
        let mut task = match self.task.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(prev) = task.take() {
            prev.abort();
        }
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        log_refresh(self.source.domain(), self.source.name(), "activate", gen);

        let source = self.source.clone();
        let slot = self.slot.clone();
        let generation = self.generation.clone();
        let live = self.live_timers.clone();
        let period = self.period;
        let suppress = self.suppress_overlap;

        *task = Some(tokio::spawn(async move {
            let _timer = TimerGuard::enter(live);
            let busy = Arc::new(AtomicBool::new(false));
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if suppress && busy.swap(true, Ordering::SeqCst) {
                    log_refresh(source.domain(), source.name(), "cycle_skipped", gen);
                    continue;
                }
                tokio::spawn(run_cycle(
                    source.clone(),
                    slot.clone(),
                    generation.clone(),
                    gen,
                    suppress.then(|| busy.clone()),
                ));
            }
        }));
    }

    pub fn deactivate(&self) {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut task) = self.task.lock() {
            if let Some(prev) = task.take() {
                prev.abort();
            }
        }
        log_refresh(self.source.domain(), self.source.name(), "deactivate", gen);
    }

    pub fn is_active(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Number of timer loops currently running for this view.
    pub fn live_timers(&self) -> usize {
        self.live_timers.load(Ordering::SeqCst)
    }
}

impl<S: RefreshSource> Drop for Refresher<S> {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(prev) = task.take() {
                prev.abort();
            }
        }
    }
}

struct TimerGuard(Arc<AtomicUsize>);

impl TimerGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct BusyGuard(Option<Arc<AtomicBool>>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Some(flag) = &self.0 {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

async fn run_cycle<S: RefreshSource>(
    source: Arc<S>,
    slot: Arc<watch::Sender<ViewState<S::View>>>,
    generation: Arc<AtomicU64>,
    gen: u64,
    busy: Option<Arc<AtomicBool>>,
) {
    let _busy = BusyGuard(busy);
    let outcome = {
        let _scope = ProfileScope::with_context("refresh_cycle", &[("view", json!(source.name()))]);
        source.fetch().await
    };

    if generation.load(Ordering::SeqCst) != gen {
        log_refresh(source.domain(), source.name(), "stale_result_dropped", gen);
        return;
    }

    match outcome {
        Ok(view) => {
            let stamp = source.stamp(&view);
            slot.send_modify(|state| {
                state.view = Some(view);
                state.error = None;
                state.last_updated = stamp;
                state.cycles += 1;
            });
        }
        Err(err) => {
            log_fetch_failure(source.domain(), source.name(), err.status, &err.message);
            let text = source.failure_text(&err);
            slot.send_modify(|state| {
                state.error = Some(text);
                state.last_updated = failure_label(now_secs());
                state.cycles += 1;
            });
        }
    }
}

// =============================================================================
// Live view sources
// =============================================================================

/// Summary view over `GET /system-state`.
pub struct StatusSource {
    client: ApiClient,
    timeout_secs: f64,
}

impl StatusSource {
    pub fn new(client: ApiClient, timeout_secs: f64) -> Self {
        Self { client, timeout_secs }
    }
}

#[async_trait]
impl RefreshSource for StatusSource {
    type View = StatusView;

    fn name(&self) -> &'static str {
        "status"
    }

    fn domain(&self) -> Domain {
        Domain::Status
    }

    async fn fetch(&self) -> Result<StatusView, HttpError> {
        let state = self.client.system_state().await?;
        Ok(project_status(&state, now_secs(), self.timeout_secs))
    }

    fn stamp(&self, view: &StatusView) -> String {
        view.last_updated.clone()
    }

    fn failure_text(&self, _err: &HttpError) -> String {
        FETCH_STATUS_ERROR.to_string()
    }
}

/// Tag value tables over `GET /latest-values`.
pub struct DetailsSource {
    client: ApiClient,
}

impl DetailsSource {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RefreshSource for DetailsSource {
    type View = DetailsView;

    fn name(&self) -> &'static str {
        "details"
    }

    fn domain(&self) -> Domain {
        Domain::Details
    }

    async fn fetch(&self) -> Result<DetailsView, HttpError> {
        let values = self.client.latest_values().await?;
        Ok(project_details(&values, now_secs()))
    }

    fn stamp(&self, view: &DetailsView) -> String {
        view.last_updated.clone()
    }
}
