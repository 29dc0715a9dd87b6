//! Agent Updater - CLI entry point
//!
//! Performs exactly one update run and exits. Scheduling is left to the
//! host (systemd timer, cron).

use agent_updater::{abort_startup, load_settings, run, Collaborators, RunOptions};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use updater_common::config::DEFAULT_SETTINGS_FILE;
use updater_common::events::{EventCode, FanoutSink, JsonlEventLog, TracingSink};
use updater_common::local_version::AGENT_UPDATER_VERSION_MARKER;
use updater_common::{
    EmbeddedVersionReader, HttpReleaseProvider, ReqwestTransport, SystemdService, UpdaterSettings,
};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "agent-updater")]
#[command(about = "Keep the agent and its plugins up to date", long_about = None)]
#[command(version)]
struct Cli {
    /// Updater settings file (TOML)
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    settings: PathBuf,

    /// Agent configuration document (overrides the settings file)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Installation root (overrides the settings file)
    #[arg(long)]
    install_root: Option<PathBuf>,

    /// Plan and stage but never deploy
    #[arg(long)]
    dry_run: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Keep the embedded version marker in the binary
    std::hint::black_box(&AGENT_UPDATER_VERSION_MARKER);
    info!("Agent Updater v{} starting", env!("CARGO_PKG_VERSION"));

    let run_id = Uuid::new_v4();

    // Until the settings are known, report to the default event log
    let mut defaults = UpdaterSettings::default();
    if let Some(root) = &cli.install_root {
        defaults.install_root = root.clone();
    }
    let startup_events = event_sinks(&defaults, run_id);
    let Some(mut settings) = load_settings(&cli.settings, &startup_events) else {
        warn!("Run {} aborted: cannot load {}", run_id, cli.settings.display());
        return Ok(());
    };
    if let Some(root) = cli.install_root {
        settings.install_root = root;
    }
    if let Some(config) = cli.config {
        settings.agent_config = config;
    }

    let events = event_sinks(&settings, run_id);
    let transport =
        match ReqwestTransport::new(settings.request_timeout(), settings.download_timeout()) {
            Ok(transport) => transport,
            Err(e) => {
                abort_startup(&events, EventCode::GeneralError, format!("HTTP client: {}", e));
                warn!("Run {} aborted: {}", run_id, e);
                return Ok(());
            }
        };
    let provider = HttpReleaseProvider::new(transport);
    let service = SystemdService::new(&settings.service_name);
    let versions = EmbeddedVersionReader;

    let collaborators = Collaborators {
        provider: &provider,
        transport: provider.transport(),
        service: &service,
        versions: &versions,
        events: &events,
    };

    let outcome = run(
        &settings,
        RunOptions {
            dry_run: cli.dry_run,
        },
        &collaborators,
    )
    .await;

    // Expected failures are reported through events; the exit status stays 0
    match &outcome {
        agent_updater::RunOutcome::Deployed(deployed) if deployed.error().is_some() => {
            warn!("Run {} finished: {}", run_id, outcome)
        }
        _ => info!("Run {} finished: {}", run_id, outcome),
    }

    Ok(())
}

fn event_sinks(settings: &UpdaterSettings, run_id: Uuid) -> FanoutSink {
    let events = FanoutSink::new().with(TracingSink);
    match settings.event_log_path() {
        Some(path) => events.with(JsonlEventLog::new(path, run_id)),
        None => events,
    }
}
