//! Main Entrypoint for the Lumi Voice Agent
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Loading the stage catalog and any knowledge snippets.
//! 3. Running a voice session on the default microphone and speaker.
//! 4. Moving to the next stage's session when the agent promotes the student.

use anyhow::Context;
use clap::Parser;
use gemini_realtime::GeminiLiveClient;
use lumi_core::{ConnectionState, Promotion, SessionConfig, SessionEvent, StageCatalog, StageTrack};
use lumi_voice::{ChannelObserver, SessionManager, backend::CpalBackend, config::VoiceConfig};
use std::{fs, path::PathBuf, sync::Arc};
use tracing::{error, info, trace};

#[derive(Parser)]
#[command(name = "lumi", about = "Lumi - real-time voice onboarding agent", version)]
struct Cli {
    /// JSON stage catalog. Overrides STAGES_PATH; the built-in catalog is used if neither is set.
    #[arg(long)]
    stages: Option<PathBuf>,
    /// Zero-based index of the stage to start in.
    #[arg(long, default_value_t = 0)]
    stage: usize,
    /// Text file whose content is handed to the agent as a knowledge snippet. Repeatable.
    #[arg(long = "knowledge")]
    knowledge: Vec<PathBuf>,
    /// Stay in the current stage when the agent promotes the student.
    #[arg(long)]
    no_auto_advance: bool,
}

fn load_catalog(path: Option<&PathBuf>) -> anyhow::Result<StageCatalog> {
    let catalog = match path {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("Failed to read stage catalog {}", path.display()))?;
            StageCatalog::from_json(&json)
                .with_context(|| format!("Failed to parse stage catalog {}", path.display()))?
        }
        None => StageCatalog::builtin(),
    };
    anyhow::ensure!(!catalog.stages.is_empty(), "Stage catalog contains no stages");
    Ok(catalog)
}

fn load_knowledge(paths: &[PathBuf]) -> anyhow::Result<Vec<String>> {
    paths
        .iter()
        .map(|path| {
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read knowledge file {}", path.display()))
        })
        .collect()
}

fn session_config(track: &StageTrack, snippets: &[String]) -> anyhow::Result<SessionConfig> {
    let stage = track.current().context("No current stage")?;
    Ok(SessionConfig::for_stage(
        stage,
        &track.catalog().global_instruction,
        snippets.to_vec(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let config = VoiceConfig::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded.");

    // --- 3. Load Stages and Knowledge ---
    let catalog = load_catalog(cli.stages.as_ref().or(config.stages_path.as_ref()))?;
    let snippets = load_knowledge(&cli.knowledge)?;
    let mut track = StageTrack::new(catalog, cli.stage);
    info!(
        stage = track.current_index(),
        snippets = snippets.len(),
        "Stage catalog loaded."
    );

    // --- 4. Start the Session ---
    let connector = Arc::new(GeminiLiveClient::new(
        config.gemini_api_key.clone(),
        config.endpoint.clone(),
    ));
    let (observer, mut events) = ChannelObserver::new();
    let manager = SessionManager::new(
        connector,
        Arc::new(CpalBackend),
        Arc::new(observer),
        config.session.clone(),
    );

    info!(
        model = %config.session.model,
        voice = %config.session.voice,
        "Connecting to Gemini Live..."
    );
    manager
        .connect(session_config(&track, &snippets)?)
        .await
        .context("Failed to start voice session")?;
    info!("Listening. Press Ctrl+C to stop.");

    // --- 5. Run Until Interrupted ---
    // Set while moving to the next stage, whose teardown reports Disconnected.
    let mut reconnecting = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Disconnecting...");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::StateChanged(ConnectionState::Error) => {
                        error!("Voice session failed.");
                        break;
                    }
                    SessionEvent::StateChanged(ConnectionState::Disconnected) if reconnecting => {
                        reconnecting = false;
                        info!("Previous stage's session closed.");
                    }
                    SessionEvent::StateChanged(ConnectionState::Disconnected) => {
                        info!("Voice session ended by the remote side.");
                        break;
                    }
                    SessionEvent::StateChanged(state) => info!(%state, "Session state changed."),
                    SessionEvent::Volume(level) => trace!(level, "Volume"),
                    SessionEvent::Speaking(speaking) => info!(speaking, "Agent speaking changed."),
                    SessionEvent::Promotion(increment) if cli.no_auto_advance => {
                        info!(
                            stage = track.current_index(),
                            target = ?track.promotion_target(increment),
                            "Promotion recorded; staying in the current stage."
                        );
                    }
                    SessionEvent::Promotion(increment) => match track.promote(increment) {
                        Promotion::AtFinalStage => info!("Student completed the final stage."),
                        Promotion::Advanced { to, .. } => {
                            info!(stage = to, "Reconnecting with the next stage.");
                            reconnecting = true;
                            let next = session_config(&track, &snippets)?;
                            if let Err(e) = manager.connect(next).await {
                                error!(error = %e, "Failed to start the next stage's session.");
                                break;
                            }
                        }
                    },
                }
            }
        }
    }

    manager.disconnect().await;
    info!("Lumi has shut down.");
    Ok(())
}
