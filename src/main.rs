use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use guerite::action::ActionEngine;
use guerite::api::{self, TriggerFlag};
use guerite::config::Settings;
use guerite::engine::bollard_engine::BollardEngine;
use guerite::listener;
use guerite::metrics::Metrics;
use guerite::notifications::NotificationDispatcher;
use guerite::scheduler::{self, WakeReason};
use guerite::state::StateStore;
use guerite::view;

const CONNECT_BACKOFF_CAP_SECONDS: u64 = 300;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "guerite=info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting Guerite");

    let settings = Settings::from_env();
    let engine = connect_with_retry(&settings).await?;
    let metrics = Arc::new(Metrics::new());
    let notifier = Arc::new(NotificationDispatcher::new(&settings));
    let state_store = StateStore::new(&settings.state_file, &settings.upgrade_state_path(), &settings.known_state_path());

    let action_engine = Arc::new(ActionEngine::new(Arc::new(engine), settings.clone(), state_store, metrics.clone(), notifier));
    action_engine.load_state().await;

    let wake = scheduler::wake_signal();
    let trigger = Arc::new(TriggerFlag::default());

    log_startup_schedule(&settings, &action_engine).await;

    if settings.http_api_enabled {
        let _api_handle = api::start(&settings, metrics.clone(), wake.clone(), trigger.clone()).await;
    }

    let listener_settings = settings.clone();
    let listener_wake = wake.clone();
    let listener_docker_host = settings.docker_host.clone();
    let listener_action_engine = action_engine.clone();
    let _listener_handle = tokio::spawn(async move {
        listener::run(
            move || BollardEngine::connect(&listener_docker_host).expect("failed to connect event listener"),
            listener_settings,
            listener_wake,
            listener_action_engine,
        )
        .await;
    });

    run_main_loop(action_engine, settings, wake, trigger).await
}

async fn connect_with_retry(settings: &Settings) -> Result<BollardEngine> {
    let mut attempt = 0;
    let mut backoff = settings.docker_connect_backoff_seconds;
    loop {
        match BollardEngine::connect(&settings.docker_host) {
            Ok(client) => return Ok(client),
            Err(error) => {
                attempt += 1;
                if attempt >= settings.docker_connect_retries {
                    return Err(error).context("failed to connect to the container engine after exhausting retries");
                }
                warn!("failed to connect to the container engine (attempt {attempt}): {error}; retrying in {backoff}s");
                tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(CONNECT_BACKOFF_CAP_SECONDS);
            }
        }
    }
}

fn schedule_label_filters(settings: &Settings) -> Vec<String> {
    vec![
        settings.update_label.clone(),
        settings.restart_label.clone(),
        settings.recreate_label.clone(),
        settings.health_label.clone(),
    ]
}

async fn log_startup_schedule(settings: &Settings, action_engine: &ActionEngine<BollardEngine>) {
    let filters = schedule_label_filters(settings);
    let containers = match action_engine.engine.list(&filters).await {
        Ok(containers) => view::select(containers, settings),
        Err(error) => {
            warn!("failed to list containers for startup schedule summary: {error}");
            return;
        }
    };
    for line in scheduler::schedule_summary(&containers, settings, chrono::Utc::now()) {
        info!("upcoming: {line}");
    }
}

async fn run_main_loop(
    action_engine: Arc<ActionEngine<BollardEngine>>,
    settings: Settings,
    wake: Arc<Notify>,
    trigger: Arc<TriggerFlag>,
) -> Result<()> {
    let mut reason = WakeReason::Startup;

    loop {
        if let Err(error) = action_engine.tick(&reason).await {
            warn!("tick failed: {error}");
        }

        if settings.run_once {
            info!("run-once complete, exiting");
            return Ok(());
        }

        let filters = schedule_label_filters(&settings);
        let containers = action_engine
            .engine
            .list(&filters)
            .await
            .map(|containers| view::select(containers, &settings))
            .unwrap_or_default();
        let next = scheduler::next_wake(&containers, &settings, chrono::Utc::now());

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting after current tick");
                return Ok(());
            }
            woke_early = scheduler::interruptible_wait(next.at, &wake) => {
                reason = if trigger.take() {
                    WakeReason::HttpApi
                } else if woke_early {
                    WakeReason::DockerEvent
                } else {
                    WakeReason::Schedule { name: next.name.clone(), label: next.label.clone() }
                };
            }
        }
    }
}
