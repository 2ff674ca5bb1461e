use anyhow::Result;
use autotune_tracker::TrackerClient;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autotune_core::artifacts::RunStore;
use autotune_core::config::Config;
use autotune_core::llm::build_lm;
use autotune_core::state::TickOutcome;
use autotune_core::{status, Worker};

/// Continuously tune the crisis-line agent's system prompt from live traces.
#[derive(Parser, Debug)]
#[command(name = "autotune", version, about, long_about = None)]
struct Cli {
    /// Override the AUTOTUNE_POLL_SECONDS tick interval.
    #[arg(long)]
    poll_seconds: Option<u64>,

    /// Publish the promoted prompt to the live agent (same as
    /// AUTOTUNE_UPDATE_LIVE_PROMPT=true).
    #[arg(long)]
    update_live_prompt: bool,

    /// Run a single tick and exit.
    #[arg(long)]
    once: bool,
}

const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_EXTERNAL_FAILURE: i32 = 3;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autotune_core=info,autotune_tracker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err:#}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };
    if let Some(poll_seconds) = cli.poll_seconds {
        config.poll_seconds = poll_seconds.max(1);
    }
    if cli.update_live_prompt {
        config.update_live_prompt = true;
    }

    match run(config, cli.once).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            // Failures before the loop starts are setup problems: a bad
            // gateway URL or an unwritable artifacts directory.
            error!("startup failed: {err:#}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    }
}

/// Sleep until either the tick interval elapses or a shutdown is requested.
async fn shutdown_requested(flag: &AtomicBool) {
    while !flag.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn run(config: Config, once: bool) -> Result<i32> {
    info!(
        project = %config.project,
        dataset = %config.dataset_name,
        poll_seconds = config.poll_seconds,
        "starting autotune loop"
    );

    let agent_lm = build_lm(
        &config.llm_api_url,
        &config.llm_api_key,
        &config.agent_llm,
        0.7,
    )
    .await?;
    let judge_lm = build_lm(
        &config.llm_api_url,
        &config.llm_api_key,
        &config.judge_model,
        0.9,
    )
    .await?;
    let tracker = TrackerClient::new(&config.tracker_url, &config.tracker_api_key, &config.project)?;
    let store = RunStore::new(config.runs_dir.clone(), config.status_file.clone())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    {
        let api_store = store.clone();
        let port = config.http_port;
        tokio::spawn(async move {
            if let Err(err) = status::serve(api_store, port).await {
                error!("status API failed: {err:#}");
            }
        });
    }

    let poll_interval = Duration::from_secs(config.poll_seconds);
    let mut worker = Worker::new(config, tracker, store, agent_lm, judge_lm, shutdown.clone());

    if once {
        let outcome = worker.tick().await;
        info!(?outcome, "single tick complete");
        return Ok(if worker.persistent_failure() {
            EXIT_EXTERNAL_FAILURE
        } else {
            0
        });
    }

    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown_requested(&shutdown) => {
                break;
            }
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let outcome = worker.tick().await;
        match &outcome {
            TickOutcome::Progressed => {}
            TickOutcome::Waited(reason) => info!(reason = %reason, "tick waited"),
            TickOutcome::Errored(kind) => info!(?kind, "tick errored"),
        }

        if worker.persistent_failure() {
            error!("external dependencies have been failing for too long, giving up");
            return Ok(EXIT_EXTERNAL_FAILURE);
        }
    }

    info!("autotune loop stopped");
    Ok(0)
}
