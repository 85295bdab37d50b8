use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use matchmaking::{
    HistoryMap, Pair, PairingEngine, Participant, ParticipantId, WeightingStrategy,
};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use round_engine::{
    simulated_collaborators, EngineConfig, EventBus, GroupId, InMemoryStore, PoolMember,
    SimulatedProvisioner, StartRequest, Supervisor,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file (defaults plus FRIENDING_* env vars when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run rounds against simulated channels and print events as JSON lines
    Simulate {
        #[arg(long, default_value_t = 6)]
        participants: u64,

        #[arg(long, default_value_t = 1)]
        duration_minutes: u32,

        /// Stop each round after this many seconds
        #[arg(long)]
        stop_after_secs: Option<u64>,

        #[arg(long, default_value_t = 1)]
        rounds: u32,
    },
    /// Print the optimal pairing for a JSON pool + history document
    Pair {
        #[arg(long)]
        input: PathBuf,
    },
}

/// `pair` input document.
#[derive(Debug, Deserialize)]
struct PairInput {
    participants: Vec<ParticipantId>,
    #[serde(default)]
    history: Vec<(ParticipantId, ParticipantId, DateTime<Utc>)>,
    #[serde(default)]
    weighting: Option<WeightingStrategy>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::from_env(),
    };

    match cli.command {
        Command::Simulate {
            participants,
            duration_minutes,
            stop_after_secs,
            rounds,
        } => {
            simulate(
                config,
                participants,
                duration_minutes,
                stop_after_secs.map(Duration::from_secs),
                rounds,
            )
            .await
        }
        Command::Pair { input } => pair(&config, &input),
    }
}

async fn simulate(
    config: EngineConfig,
    participants: u64,
    duration_minutes: u32,
    stop_after: Option<Duration>,
    rounds: u32,
) -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let channels = Arc::new(SimulatedProvisioner::new());
    let events = EventBus::new().shared();
    let lobby = channels.add_channel("Lobby");

    let pool: Vec<PoolMember> = (1..=participants)
        .map(|id| PoolMember::present(Participant::new(id, format!("member-{id}"))))
        .collect();
    for member in &pool {
        channels.place(member.participant.id, &lobby);
    }

    let mut receiver = events.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let supervisor = Supervisor::new(simulated_collaborators(
        store.clone(),
        channels.clone(),
        events,
        config,
    ));
    let group_id = GroupId(1);

    for n in 1..=rounds {
        let started = supervisor
            .start_round(StartRequest {
                group_id,
                requester: pool.first().map(|m| m.participant.id),
                pool: pool.clone(),
                lobby: lobby.clone(),
                duration_minutes,
            })
            .await
            .with_context(|| format!("Round {n} was rejected"))?;
        println!("{}", serde_json::to_string(&started)?);

        if let Some(delay) = stop_after {
            tokio::time::sleep(delay).await;
            let ack = supervisor.stop_round(group_id)?;
            info!(round_id = ?ack.round_id, "Stop requested");
        }

        let Some(report) = supervisor.join(group_id).await else {
            bail!("Round {n} task did not complete");
        };
        println!("{}", serde_json::to_string(&report)?);
    }

    drop(supervisor);
    if let Err(e) = printer.await {
        warn!(error = %e, "Event printer failed");
    }

    info!(
        rounds = store.round_count(),
        live_channels = channels.live_channels().len(),
        "Simulation finished"
    );
    Ok(())
}

fn pair(config: &EngineConfig, input: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let doc: PairInput = serde_json::from_str(&raw).context("Failed to parse pairing input")?;

    let mut history = HistoryMap::new();
    for (a, b, at) in doc.history {
        let Some(key) = Pair::new(a, b) else {
            bail!("History entry pairs {a} with itself");
        };
        history
            .entry(key)
            .and_modify(|seen| *seen = (*seen).max(at))
            .or_insert(at);
    }

    let weighting = doc
        .weighting
        .unwrap_or(config.weighting)
        .build(history, Utc::now());
    let result = PairingEngine::new().create_pairs(&doc.participants, weighting.as_ref());
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
