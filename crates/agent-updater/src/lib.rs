//! Agent Updater - one update run for the agent and its plugins
//!
//! `run` wires the pipeline together and always reports a terminal
//! `RunFinished` event. Expected failures (bad config, unreachable release
//! source, service refusing to stop) end the run cleanly; they are outcomes,
//! not errors.

use std::fmt;
use std::path::Path;
use tracing::{info, warn};
use updater_common::config::AgentConfig;
use updater_common::events::{Event, EventCode, EventSink};
use updater_common::lock::RunLock;
use updater_common::{
    AssemblyRegistry, DeployOutcome, Deployer, HttpTransport, Planner, ReleaseProvider,
    ServiceController, Stager, StagingResult, UpdaterSettings, VersionReader,
};

/// Side-effecting collaborators of a run
pub struct Collaborators<'a> {
    pub provider: &'a dyn ReleaseProvider,
    pub transport: &'a dyn HttpTransport,
    pub service: &'a dyn ServiceController,
    pub versions: &'a dyn VersionReader,
    pub events: &'a dyn EventSink,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Plan and stage, never touch the service or live files
    pub dry_run: bool,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Settings or the HTTP client could not be set up; no run was attempted
    StartupFailed,
    ConfigFailed,
    Disabled,
    Locked,
    UpToDate,
    /// Planner deadline hit; nothing staged or deployed
    PlanTruncated,
    DryRun(StagingResult),
    Deployed(DeployOutcome),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::StartupFailed => write!(f, "updater could not start"),
            RunOutcome::ConfigFailed => write!(f, "configuration could not be loaded"),
            RunOutcome::Disabled => write!(f, "auto-update disabled"),
            RunOutcome::Locked => write!(f, "another run is in progress"),
            RunOutcome::UpToDate => write!(f, "everything up to date"),
            RunOutcome::PlanTruncated => write!(f, "planning deadline reached"),
            RunOutcome::DryRun(staging) => write!(
                f,
                "dry run, {} of {} staged file(s) verified",
                staging.iter().filter(|(_, ok)| *ok).count(),
                staging.len()
            ),
            RunOutcome::Deployed(DeployOutcome::Success { copied, failed }) => write!(
                f,
                "deployed {} file(s), {} copy error(s)",
                copied.len(),
                failed.len()
            ),
            RunOutcome::Deployed(DeployOutcome::NoOp) => write!(f, "nothing to deploy"),
            RunOutcome::Deployed(DeployOutcome::Failed(e)) => write!(f, "deployment failed: {}", e),
        }
    }
}

/// Perform one Registry -> Plan -> Stage -> Deploy pass
pub async fn run(
    settings: &UpdaterSettings,
    options: RunOptions,
    collaborators: &Collaborators<'_>,
) -> RunOutcome {
    let outcome = run_inner(settings, options, collaborators).await;
    finish(collaborators.events, &outcome);
    outcome
}

/// Load updater settings, reporting a broken file as a finished run
///
/// `None` means the error and the terminal event were already emitted.
pub fn load_settings(path: &Path, events: &dyn EventSink) -> Option<UpdaterSettings> {
    match UpdaterSettings::load_or_default(path) {
        Ok(settings) => Some(settings),
        Err(e) => {
            abort_startup(events, e.code(), format!("Config error: {}", e));
            None
        }
    }
}

/// Report a failure that prevented the run from starting at all
pub fn abort_startup(
    events: &dyn EventSink,
    code: EventCode,
    message: impl Into<String>,
) -> RunOutcome {
    events.emit(Event::error(code, message));
    let outcome = RunOutcome::StartupFailed;
    finish(events, &outcome);
    outcome
}

fn finish(events: &dyn EventSink, outcome: &RunOutcome) {
    events.emit(Event::info(
        EventCode::RunFinished,
        format!("Run finished: {}", outcome),
    ));
}

async fn run_inner(
    settings: &UpdaterSettings,
    options: RunOptions,
    c: &Collaborators<'_>,
) -> RunOutcome {
    let config_path = settings.agent_config_path();
    let config = match AgentConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            c.events.emit(Event::error(e.code(), format!("Config error: {}", e)));
            return RunOutcome::ConfigFailed;
        }
    };

    let auto_update = &config.auto_update;
    if !auto_update.enabled {
        c.events
            .emit(Event::info(EventCode::NoUpdates, "Auto-update disabled"));
        return RunOutcome::Disabled;
    }

    let _lock = match RunLock::acquire(&settings.install_root) {
        Ok(lock) => lock,
        Err(e) => {
            c.events.emit(Event::error(e.code(), format!("Run skipped: {}", e)));
            return RunOutcome::Locked;
        }
    };

    let registry =
        AssemblyRegistry::build(settings.default_assemblies(), config.discovered_assemblies());
    info!(
        "Checking {} assemblies against {} ({})",
        registry.len(),
        auto_update.uri,
        auto_update.source
    );

    let planned = Planner::new(c.provider, c.versions, c.events, &settings.install_root)
        .with_deadline(settings.plan_deadline())
        .plan(&registry, auto_update.source, &auto_update.uri)
        .await;

    if planned.truncated {
        warn!(
            "Planning stopped early with {} file(s) planned; skipping deployment",
            planned.plan.len()
        );
        return RunOutcome::PlanTruncated;
    }
    if planned.plan.is_empty() {
        c.events
            .emit(Event::info(EventCode::NoUpdates, "No updates available"));
        return RunOutcome::UpToDate;
    }

    let staging = Stager::new(c.transport, c.events, settings.staging_path(), settings.checksum)
        .stage(&planned.plan)
        .await;

    if options.dry_run {
        for (dest, verified) in staging.iter() {
            info!(
                "[dry-run] {} {}",
                if verified { "would install" } else { "unverified" },
                dest.display()
            );
        }
        return RunOutcome::DryRun(staging);
    }

    let deployed = Deployer::new(c.service, c.events, settings.checksum, settings.updater_path())
        .with_timings(settings.stop_timeout(), settings.settle_delay())
        .deploy(&planned.plan, &staging)
        .await;

    if deployed.is_noop() {
        c.events.emit(Event::info(
            EventCode::NoUpdates,
            "No updates to apply besides the updater itself",
        ));
    }
    RunOutcome::Deployed(deployed)
}
