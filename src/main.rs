use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::signal;

use bridgemon::api::ApiClient;
use bridgemon::config::{Bootstrap, Config};
use bridgemon::history::{HistoryLoader, LoadOutcome, TagCatalog};
use bridgemon::logging::{log, log_startup, obj, v_str, Domain, Level};
use bridgemon::model::{ScenarioDef, ScenarioId};
use bridgemon::refresh::{DetailsSource, Refresher, StatusSource, ViewState};
use bridgemon::scenario::{Notifier, ScenarioStore, VerificationEngine};

const USAGE: &str = "usage: bridgemon [watch | scenarios | run <id> | visual <id> pass|fail | history <tag> | tags]";

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let boot = match &cfg.bootstrap_path {
        Some(path) => Bootstrap::from_path(path)?,
        None => Bootstrap::default(),
    };
    log_startup(&cfg.api_base, cfg.refresh_interval_ms, boot.scenarios.len());

    let client = ApiClient::http(&cfg.api_base, cfg.http_timeout())
        .with_context(|| format!("invalid BRIDGE_API_BASE {}", cfg.api_base))?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str).unwrap_or("watch");
    match cmd {
        "watch" => watch(&cfg, client).await,
        "scenarios" => {
            let engine = scenario_engine(client, boot).await;
            for view in engine.store().views() {
                println!("{}", view);
            }
            Ok(())
        }
        "run" => {
            let id = parse_id(args.get(1))?;
            let engine = scenario_engine(client, boot).await;
            let result = engine.run(id).await?;
            print_scenario(&engine, id);
            if result.awaits_visual() {
                println!("awaiting visual check: bridgemon visual {} pass|fail", id);
            }
            Ok(())
        }
        "visual" => {
            let id = parse_id(args.get(1))?;
            let passed = match args.get(2).map(String::as_str) {
                Some("pass") => true,
                Some("fail") => false,
                _ => bail!(USAGE),
            };
            let engine = scenario_engine(client, boot).await;
            let outcome = engine.record_visual(id, passed).await;
            print_scenario(&engine, id);
            outcome.map(|_| ()).map_err(Into::into)
        }
        "history" => {
            let tag = args.get(1).map(String::as_str).unwrap_or("");
            let loader = HistoryLoader::new(client);
            let outcome = loader.load(tag).await;
            let chart = loader.chart();
            if let LoadOutcome::Loaded(_) = outcome {
                println!("{}", chart.label);
                for p in &chart.points {
                    println!("  {}  {}", p.at.to_rfc3339(), p.value);
                }
            }
            println!("{}", chart.status);
            Ok(())
        }
        "tags" => {
            let catalog = match &boot.tag_sources {
                Some(sources) => TagCatalog::from_sources(sources),
                None => TagCatalog::from_system_state(&client.system_state().await?),
            };
            for tag in catalog.tags() {
                println!("{}", tag);
            }
            Ok(())
        }
        _ => bail!(USAGE),
    }
}

fn parse_id(raw: Option<&String>) -> Result<ScenarioId> {
    let raw = raw.context(USAGE)?;
    raw.parse().with_context(|| format!("invalid scenario id {:?}", raw))
}

fn print_scenario(engine: &VerificationEngine, id: ScenarioId) {
    if let Some(view) = engine.store().view(id) {
        println!("{}", view);
    }
}

/// Catalog from the bootstrap file when present, otherwise from the server;
/// then adopt the server's current results.
async fn scenario_engine(client: ApiClient, boot: Bootstrap) -> VerificationEngine {
    let defs: BTreeMap<ScenarioId, ScenarioDef> = if boot.scenarios.is_empty() {
        match client.test_scenarios().await {
            Ok(defs) => defs,
            Err(e) => {
                log(Level::Warn, Domain::Scenario, "catalog_unavailable", obj(&[("msg", v_str(&e.message))]));
                BTreeMap::new()
            }
        }
    } else {
        boot.scenarios
    };
    let store = ScenarioStore::new(defs, boot.results);
    let engine = VerificationEngine::new(client, store, Arc::new(StdinNotifier));
    if let Err(e) = engine.resync().await {
        log(Level::Warn, Domain::Scenario, "resync_skipped", obj(&[("msg", v_str(&e.to_string()))]));
    }
    engine
}

/// Prints the alert and blocks until Enter is pressed.
struct StdinNotifier;

#[async_trait]
impl Notifier for StdinNotifier {
    async fn alert(&self, message: &str) {
        eprintln!("{}", message);
        eprintln!("press Enter to continue");
        let _ = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
        })
        .await;
    }
}

async fn watch(cfg: &Config, client: ApiClient) -> Result<()> {
    let status = Refresher::new(
        StatusSource::new(client.clone(), cfg.connection_timeout_secs),
        cfg.refresh_interval(),
        cfg.suppress_overlap,
    );
    let details = Refresher::new(DetailsSource::new(client), cfg.refresh_interval(), cfg.suppress_overlap);
    let mut status_rx = status.subscribe();
    let mut details_rx = details.subscribe();
    status.activate();
    details.activate();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                print_state("status", &*status_rx.borrow_and_update());
            }
            changed = details_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                print_state("details", &*details_rx.borrow_and_update());
            }
        }
    }

    status.deactivate();
    details.deactivate();
    log(Level::Info, Domain::System, "shutdown", obj(&[]));
    Ok(())
}

fn print_state<V: std::fmt::Display>(title: &str, state: &ViewState<V>) {
    println!("== {} ==", title);
    if let Some(view) = &state.view {
        println!("{}", view);
    }
    if let Some(err) = &state.error {
        println!("{}", err);
        println!("last updated: {}", state.last_updated);
    }
    println!();
}
