#![deny(warnings)]

//! Headless CLI driving one scripted career-simulation session:
//! phase walk with overlapping save triggers, a few rapid building
//! drags, a debounce settle, and a leave-time flush.

use anyhow::Result;
use city_layout::{FileFallback, Reconciler};
use docstore::{DocumentStore, MemoryStore, SqliteStore};
use progress_core::{BuildingId, PhaseTrack, SimulationId, UserId, COMPLETE_PHASE};
use save_sync::{Award, AwardError, CompletionAward, PhaseController, SaveOutcome, Session};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn parse_args() -> (String, String, Option<String>) {
    let mut user = "demo-user".to_string();
    let mut simulation = "finance-simulation".to_string();
    let mut db: Option<String> = None;
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--user" => user = it.next().unwrap_or(user),
            "--simulation" => simulation = it.next().unwrap_or(simulation),
            "--db" => db = it.next(),
            _ => {}
        }
    }
    (user, simulation, db)
}

/// Award collaborator that just records the grant in the log.
struct LogAward;

impl Award for LogAward {
    async fn award(
        &self,
        user: &UserId,
        simulation: &SimulationId,
        points: u32,
        unlock_tokens: &[String],
    ) -> Result<(), AwardError> {
        info!(%user, %simulation, points, ?unlock_tokens, "completion award granted");
        Ok(())
    }
}

async fn run_session<S: DocumentStore + 'static>(
    store: Arc<S>,
    user: &str,
    simulation: &str,
) -> Result<()> {
    let track = PhaseTrack::standard();
    let controller = PhaseController::new(
        UserId(user.to_string()),
        SimulationId(simulation.to_string()),
        track.clone(),
        CompletionAward {
            points: 100,
            unlock_tokens: vec!["bank".to_string(), "library".to_string()],
        },
    );
    let session = Session::new(controller, Arc::clone(&store), LogAward);
    let autosave = session.spawn_autosave(Duration::from_secs(2));

    // Walk the track; each transition fires its own save.
    let phases: Vec<String> = track.phases().map(str::to_string).collect();
    for window in phases.windows(2) {
        let (transition, outcome) = session
            .complete_phase(json!({"phase": window[0].clone()}), &window[1])
            .await?;
        info!(from = %transition.from, to = %transition.to, ?outcome, "phase completed");
    }
    if session.manual_save().await == SaveOutcome::Dropped {
        info!("manual save dropped; a background save was in flight");
    }
    autosave.abort();

    // City view: mount, drag a building twice in quick succession, let
    // the debounce settle, then flush as if the page were closing.
    let fallback = FileFallback::new("./saves/fallback");
    let mut scene = Reconciler::mount(store, UserId(user.to_string()), fallback).await?;
    scene.on_drop(BuildingId("bank".to_string()), 83.0, 77.0);
    scene.on_drop(BuildingId("bank".to_string()), 163.0, 238.0);
    scene.settle().await;
    scene.on_drop(BuildingId("library".to_string()), 321.0, 161.0);
    let report = scene.flush_now().await;

    let snapshot = session.snapshot().await;
    println!(
        "Session OK | phase: {} ({}%) | answers recorded: {} | completed: {}",
        snapshot.current_phase,
        session.progress_percentage().await,
        snapshot.phase_progress.len(),
        snapshot.completed,
    );
    println!(
        "City OK | buildings placed: {} | flush attempted: {} | flush succeeded: {}",
        scene.positions().len(),
        report.attempted,
        report.succeeded,
    );
    anyhow::ensure!(
        snapshot.current_phase == COMPLETE_PHASE,
        "session ended before the terminal phase"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logging setup
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (user, simulation, db) = parse_args();
    info!(%user, %simulation, ?db, "starting session");

    match db {
        Some(url) => {
            if let Some(path) = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))
            {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let store = Arc::new(SqliteStore::open(&url).await?);
            run_session(store, &user, &simulation).await
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            run_session(store, &user, &simulation).await
        }
    }
}
