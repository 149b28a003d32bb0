//! statebus - statechart runtime demo host
//!
//! Runs a ping/pong pair of machines through the orchestrator and reports
//! how they settled.

use clap::Parser;
use serde_json::{json, Value};
use statebus_core::{ActionContext, Bindings, Chart, GuardContext};
use statebus_orchestrator::{Metrics, Orchestrator, OrchestratorConfig, TransitionRecord};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "statebus")]
#[command(about = "Runs two statechart machines exchanging events through the orchestrator")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "STATEBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Ping/pong rounds before the server side finishes
    #[arg(short, long, default_value_t = 3)]
    rounds: u64,

    /// Seconds to wait for the exchange to finish
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

fn bindings() -> Bindings {
    Bindings::new()
        .action("serve", |ctx: &mut ActionContext<'_>| {
            let round = ctx.get("round").and_then(Value::as_u64).unwrap_or(0) + 1;
            ctx.set("round", json!(round));
            let reply_to = ctx.machine_id().to_string();
            ctx.request_send("pong", "PING", json!({ "round": round, "reply_to": reply_to }));
            Ok(())
        })
        .action("reply", |ctx: &mut ActionContext<'_>| {
            let data = ctx.event().data.clone();
            let returned = ctx.get("returned").and_then(Value::as_u64).unwrap_or(0) + 1;
            ctx.set("returned", json!(returned));
            let reply_to = data["reply_to"].as_str().unwrap_or("ping").to_string();
            ctx.request_send(reply_to, "PONG", json!({ "round": data["round"] }));
            Ok(())
        })
        .guard("lastRound", |guard: &GuardContext<'_>| {
            let round = guard.event.data["round"].as_u64().unwrap_or(0);
            let rounds = guard.context["rounds"].as_u64().unwrap_or(0);
            Ok(round >= rounds)
        })
}

fn charts(rounds: u64) -> Result<(Arc<Chart>, Arc<Chart>), Box<dyn std::error::Error>> {
    let bindings = bindings();
    let ping = Chart::from_json(
        &json!({
            "id": "ping",
            "initial": "idle",
            "context": { "rounds": rounds, "round": 0 },
            "states": {
                "idle": { "on": { "SERVE": { "target": "rally", "actions": "serve" } } },
                "rally": {
                    "on": {
                        "PONG": [
                            { "target": "finished", "guard": "lastRound" },
                            { "actions": "serve" }
                        ]
                    }
                },
                "finished": { "type": "final" }
            }
        }),
        &bindings,
    )?;
    let pong = Chart::from_json(
        &json!({
            "id": "pong",
            "context": { "returned": 0 },
            "states": { "waiting": { "on": { "PING": { "actions": "reply" } } } }
        }),
        &bindings,
    )?;
    Ok((ping, pong))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration (file if given, then env overrides)
    let config = match OrchestratorConfig::load_from(cli.config.as_deref()) {
        Ok(config) => {
            if let Some(path) = &cli.config {
                tracing::info!("Loaded config from {}", path.display());
            }
            config
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting statebus demo");
    tracing::info!("  Pool size: {}", config.pool_size);
    tracing::info!("  Rounds: {}", cli.rounds);

    let mut orchestrator = Orchestrator::new(config.clone());
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        orchestrator = orchestrator.with_metrics(metrics.clone());
        tracing::info!("  Metrics: enabled");
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let finished = Arc::new(Notify::new());
    {
        let finished = finished.clone();
        orchestrator.on_transition(0, move |record: &TransitionRecord| {
            tracing::info!(
                "[{}] {} -> {} on '{}' from {}",
                record.machine_id,
                record.previous,
                record.snapshot.value,
                record.event.name,
                record.from
            );
            if record.machine_id == "ping" && record.snapshot.done {
                finished.notify_one();
            }
        });
    }

    let (ping, pong) = charts(cli.rounds)?;
    orchestrator.spawn_machine("ping", ping).await?;
    orchestrator.spawn_machine("pong", pong).await?;
    orchestrator.send_event("host", "ping", "SERVE", Value::Null).await?;

    tokio::select! {
        result = tokio::time::timeout(Duration::from_secs(cli.timeout), finished.notified()) => {
            if result.is_err() {
                tracing::warn!("Exchange did not finish within {}s", cli.timeout);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping...");
        }
    }

    let ping = orchestrator.snapshot("ping")?;
    let pong = orchestrator.snapshot("pong")?;
    tracing::info!(
        "ping settled in {} after {} round(s); pong returned {}",
        ping.value,
        ping.context["round"],
        pong.context["returned"]
    );

    let outcomes = orchestrator.shutdown().await;
    for (id, outcome) in outcomes {
        tracing::info!("[{}] {:?}", id, outcome);
    }

    if let Some(metrics) = metrics {
        println!("{}", String::from_utf8_lossy(&metrics.encode()));
    }

    tracing::info!("Demo stopped");
    Ok(())
}
