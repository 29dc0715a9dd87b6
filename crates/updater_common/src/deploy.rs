//! Deployment orchestrator
//!
//! Applies a verified staging result to the live installation:
//!
//! ```text
//! Verifying -> Excluding -> (NoOp) -> Stopping -> Copying -> Starting -> Success
//!     |                                  |
//!     +-> ChecksumGateFailure            +-> ServiceControlFailure / ServiceStopTimeout
//! ```
//!
//! The checksum gate runs before anything else: if a single planned file is
//! unverified the service is never queried and no live file is written.

use crate::checksum::ChecksumAlgorithm;
use crate::events::{Event, EventCode, EventSink};
use crate::planner::UpdatePlan;
use crate::service::{ServiceController, ServiceError, ServiceStatus};
use crate::staging::StagingResult;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("service control failed: {0}")]
    ServiceControlFailure(#[source] ServiceError),

    #[error("service did not stop: {0}")]
    ServiceStopTimeout(#[source] ServiceError),

    #[error("{} file(s) failed verification", .unverified.len())]
    ChecksumGateFailure { unverified: Vec<PathBuf> },

    #[error("could not copy {}: {source}", .path.display())]
    CopyError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DeployError {
    pub fn code(&self) -> EventCode {
        match self {
            DeployError::ServiceControlFailure(_) | DeployError::ServiceStopTimeout(_) => {
                EventCode::ServiceNotStarted
            }
            DeployError::ChecksumGateFailure { .. } => EventCode::ChecksumFailed,
            DeployError::CopyError { .. } => EventCode::CopyError,
        }
    }
}

#[derive(Debug)]
pub enum DeployOutcome {
    /// Copy phase ran; individual copy failures are listed, not fatal
    Success {
        copied: Vec<PathBuf>,
        failed: Vec<PathBuf>,
    },
    /// Nothing left to apply after self-exclusion
    NoOp,
    Failed(DeployError),
}

impl DeployOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeployOutcome::Success { .. })
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, DeployOutcome::NoOp)
    }

    pub fn error(&self) -> Option<&DeployError> {
        match self {
            DeployOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

pub struct Deployer<'a> {
    service: &'a dyn ServiceController,
    events: &'a dyn EventSink,
    checksum: ChecksumAlgorithm,
    updater_path: PathBuf,
    stop_timeout: Duration,
    settle_delay: Duration,
}

impl<'a> Deployer<'a> {
    pub fn new(
        service: &'a dyn ServiceController,
        events: &'a dyn EventSink,
        checksum: ChecksumAlgorithm,
        updater_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            service,
            events,
            checksum,
            updater_path: updater_path.into(),
            stop_timeout: Duration::from_secs(25),
            settle_delay: Duration::from_secs(5),
        }
    }

    pub fn with_timings(mut self, stop_timeout: Duration, settle_delay: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self.settle_delay = settle_delay;
        self
    }

    pub async fn deploy(&self, plan: &UpdatePlan, staging: &StagingResult) -> DeployOutcome {
        if let Err(e) = self.checksum_gate(plan, staging) {
            self.events.emit(Event::error(
                e.code(),
                format!("Checksum failed, deployment aborted: {}", e),
            ));
            return DeployOutcome::Failed(e);
        }

        let (plan, excluded) = self.exclude_self(plan);
        if !excluded.is_empty() {
            info!(
                "Deferring self-update of {} to the next run",
                self.updater_path.display()
            );
        }
        if plan.is_empty() {
            return DeployOutcome::NoOp;
        }

        if let Err(e) = self.stop_service().await {
            self.events.emit(Event::error(
                e.code(),
                format!("Service '{}' not stopped; no files copied: {}", self.service.name(), e),
            ));
            return DeployOutcome::Failed(e);
        }

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        let (copied, failed) = self.copy_files(&plan, staging).await;
        self.remove_staged_checksums(&plan, staging).await;

        if let Err(e) = self.start_service().await {
            self.events.emit(Event::error(
                e.code(),
                format!("Service '{}' not started: {}", self.service.name(), e),
            ));
            return DeployOutcome::Failed(e);
        }

        info!("Deployed {} file(s), {} failed", copied.len(), failed.len());
        DeployOutcome::Success { copied, failed }
    }

    /// Every non-checksum file of the plan must be staged and verified
    fn checksum_gate(&self, plan: &UpdatePlan, staging: &StagingResult) -> Result<(), DeployError> {
        let mut unverified: Vec<PathBuf> = plan
            .paths()
            .filter(|p| !self.is_checksum_path(p))
            .filter(|p| staging.is_verified(p) != Some(true))
            .map(Path::to_path_buf)
            .collect();
        unverified.extend(staging.unverified().map(Path::to_path_buf));
        unverified.sort();
        unverified.dedup();

        if unverified.is_empty() {
            Ok(())
        } else {
            Err(DeployError::ChecksumGateFailure { unverified })
        }
    }

    /// Drop the running updater and its checksum sibling from `plan`.
    /// Returns the remaining plan and the removed paths.
    pub fn exclude_self(&self, plan: &UpdatePlan) -> (UpdatePlan, Vec<PathBuf>) {
        let mut remaining = plan.clone();
        let mut excluded = Vec::new();
        for path in [
            self.updater_path.clone(),
            self.checksum.sibling_of(&self.updater_path),
        ] {
            if remaining.remove(&path).is_some() {
                excluded.push(path);
            }
        }
        (remaining, excluded)
    }

    async fn stop_service(&self) -> Result<(), DeployError> {
        let status = self
            .service
            .status()
            .await
            .map_err(DeployError::ServiceControlFailure)?;

        match status {
            ServiceStatus::Running | ServiceStatus::StartPending => {
                info!("Stopping service '{}'", self.service.name());
                self.service
                    .stop()
                    .await
                    .map_err(DeployError::ServiceControlFailure)?;
            }
            ServiceStatus::StopPending => {}
            ServiceStatus::Stopped => return Ok(()),
            // Cannot tell whether the binaries are in use
            ServiceStatus::Unknown => {
                return Err(DeployError::ServiceControlFailure(ServiceError::UnknownState(
                    self.service.name().to_string(),
                )))
            }
        }

        self.service
            .wait_for_status(ServiceStatus::Stopped, self.stop_timeout)
            .await
            .map_err(|e| match e {
                ServiceError::Timeout { .. } => DeployError::ServiceStopTimeout(e),
                other => DeployError::ServiceControlFailure(other),
            })
    }

    async fn start_service(&self) -> Result<(), DeployError> {
        let status = self
            .service
            .status()
            .await
            .map_err(DeployError::ServiceControlFailure)?;
        if status == ServiceStatus::Stopped {
            info!("Starting service '{}'", self.service.name());
            self.service
                .start()
                .await
                .map_err(DeployError::ServiceControlFailure)?;
        }
        Ok(())
    }

    async fn copy_files(
        &self,
        plan: &UpdatePlan,
        staging: &StagingResult,
    ) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let mut copied = Vec::new();
        let mut failed = Vec::new();

        for dest in plan.paths().filter(|p| !self.is_checksum_path(p)) {
            let result = match staging.staged_file(dest) {
                Some(staged) => install_file(&staged, dest).await,
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "destination has no file name",
                )),
            };

            match result {
                Ok(()) => {
                    self.events.emit(Event::info(
                        EventCode::Updated,
                        format!("Application updated: {}", dest.display()),
                    ));
                    copied.push(dest.to_path_buf());
                }
                Err(source) => {
                    let e = DeployError::CopyError {
                        path: dest.to_path_buf(),
                        source,
                    };
                    self.events.emit(Event::error(e.code(), format!("Copy error\n{}", e)));
                    failed.push(dest.to_path_buf());
                }
            }
        }

        (copied, failed)
    }

    async fn remove_staged_checksums(&self, plan: &UpdatePlan, staging: &StagingResult) {
        for dest in plan.paths().filter(|p| self.is_checksum_path(p)) {
            if let Some(staged) = staging.staged_file(dest) {
                if let Err(e) = fs::remove_file(&staged).await {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("Could not remove {}: {}", staged.display(), e);
                    }
                }
            }
        }
    }

    fn is_checksum_path(&self, path: &Path) -> bool {
        self.checksum.is_checksum_file(&path.to_string_lossy())
    }
}

/// Copy to `<dest>.new` next to the destination, then rename over it
async fn install_file(staged: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut temp = dest.as_os_str().to_os_string();
    temp.push(".new");
    let temp = PathBuf::from(temp);

    let previous = fs::metadata(dest).await.ok().map(|m| m.permissions());

    let result = async {
        fs::copy(staged, &temp).await?;
        match &previous {
            Some(perms) => fs::set_permissions(&temp, perms.clone()).await?,
            None => set_executable(&temp).await?,
        }
        fs::rename(&temp, dest).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp).await;
    }
    result
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
