//! Host service control
//!
//! The deployer only needs four things from the service manager: current
//! status, stop, start, and a bounded wait for a target status. Production
//! goes through `systemctl`; tests use [`FakeService`].

use crate::events::EventCode;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

/// How often status is polled while waiting
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    StartPending,
    StopPending,
    Unknown,
}

impl ServiceStatus {
    /// Map a systemd `ActiveState` value
    pub fn from_active_state(state: &str) -> Self {
        match state.trim() {
            "active" | "reloading" => ServiceStatus::Running,
            "inactive" | "failed" => ServiceStatus::Stopped,
            "activating" => ServiceStatus::StartPending,
            "deactivating" => ServiceStatus::StopPending,
            _ => ServiceStatus::Unknown,
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::StartPending => "start pending",
            ServiceStatus::StopPending => "stop pending",
            ServiceStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service '{0}' is not registered")]
    NotRegistered(String),

    #[error("service '{0}' is in an unknown state")]
    UnknownState(String),

    #[error("service command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("service did not reach '{wanted}' within {}s (last: {last})", .waited.as_secs())]
    Timeout {
        wanted: ServiceStatus,
        last: ServiceStatus,
        waited: Duration,
    },
}

impl ServiceError {
    pub fn code(&self) -> EventCode {
        EventCode::ServiceNotStarted
    }
}

#[async_trait]
pub trait ServiceController: Send + Sync {
    fn name(&self) -> &str;

    async fn status(&self) -> Result<ServiceStatus, ServiceError>;

    /// Request a stop; does not wait for it to complete
    async fn stop(&self) -> Result<(), ServiceError>;

    /// Request a start; does not wait for it to complete
    async fn start(&self) -> Result<(), ServiceError>;

    /// Poll until `wanted` is reached or `timeout` elapses
    async fn wait_for_status(
        &self,
        wanted: ServiceStatus,
        timeout: Duration,
    ) -> Result<(), ServiceError> {
        let started = Instant::now();
        loop {
            let last = self.status().await?;
            if last == wanted {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(ServiceError::Timeout {
                    wanted,
                    last,
                    waited,
                });
            }
            let left = timeout - waited;
            tokio::time::sleep(left.min(STATUS_POLL_INTERVAL)).await;
        }
    }
}

/// systemd unit controlled through `systemctl`
#[derive(Debug, Clone)]
pub struct SystemdService {
    unit: String,
}

impl SystemdService {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<String, ServiceError> {
        let command = format!("systemctl {}", args.join(" "));
        debug!("Running {}", command);

        let output = Command::new("systemctl")
            .args(args)
            .output()
            .await
            .map_err(|e| ServiceError::Command {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ServiceError::Command {
                command,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ServiceController for SystemdService {
    fn name(&self) -> &str {
        &self.unit
    }

    async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        let stdout = self
            .systemctl(&["show", "-p", "LoadState,ActiveState", &self.unit])
            .await?;

        let mut load_state = "";
        let mut active_state = "";
        for line in stdout.lines() {
            if let Some(v) = line.strip_prefix("LoadState=") {
                load_state = v;
            } else if let Some(v) = line.strip_prefix("ActiveState=") {
                active_state = v;
            }
        }

        if load_state.trim() == "not-found" {
            return Err(ServiceError::NotRegistered(self.unit.clone()));
        }
        Ok(ServiceStatus::from_active_state(active_state))
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.systemctl(&["stop", "--no-block", &self.unit]).await.map(|_| ())
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.systemctl(&["start", "--no-block", &self.unit]).await.map(|_| ())
    }
}

/// Calls observed by [`FakeService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCall {
    Status,
    Stop,
    Start,
}

/// In-memory service that records every call (testing)
#[derive(Debug)]
pub struct FakeService {
    name: String,
    state: Mutex<ServiceStatus>,
    calls: Mutex<Vec<ServiceCall>>,
    /// Stop leaves the service in StopPending forever
    hang_on_stop: bool,
    fail_start: bool,
    registered: bool,
}

impl FakeService {
    pub fn new(initial: ServiceStatus) -> Self {
        Self {
            name: "agent".to_string(),
            state: Mutex::new(initial),
            calls: Mutex::new(Vec::new()),
            hang_on_stop: false,
            fail_start: false,
            registered: true,
        }
    }

    pub fn running() -> Self {
        Self::new(ServiceStatus::Running)
    }

    pub fn stopped() -> Self {
        Self::new(ServiceStatus::Stopped)
    }

    pub fn unregistered() -> Self {
        Self {
            registered: false,
            ..Self::new(ServiceStatus::Unknown)
        }
    }

    pub fn hanging_on_stop(mut self) -> Self {
        self.hang_on_stop = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn current(&self) -> ServiceStatus {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ServiceStatus::Unknown)
    }

    fn record(&self, call: ServiceCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn set(&self, status: ServiceStatus) {
        if let Ok(mut state) = self.state.lock() {
            *state = status;
        }
    }
}

#[async_trait]
impl ServiceController for FakeService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        self.record(ServiceCall::Status);
        if !self.registered {
            return Err(ServiceError::NotRegistered(self.name.clone()));
        }
        Ok(self.current())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.record(ServiceCall::Stop);
        if !self.registered {
            return Err(ServiceError::NotRegistered(self.name.clone()));
        }
        if self.hang_on_stop {
            self.set(ServiceStatus::StopPending);
        } else {
            self.set(ServiceStatus::Stopped);
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.record(ServiceCall::Start);
        if !self.registered || self.fail_start {
            return Err(ServiceError::Command {
                command: format!("start {}", self.name),
                message: "refused".to_string(),
            });
        }
        self.set(ServiceStatus::Running);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_state_mapping() {
        assert_eq!(ServiceStatus::from_active_state("active"), ServiceStatus::Running);
        assert_eq!(ServiceStatus::from_active_state("failed"), ServiceStatus::Stopped);
        assert_eq!(ServiceStatus::from_active_state("deactivating\n"), ServiceStatus::StopPending);
        assert_eq!(ServiceStatus::from_active_state("activating"), ServiceStatus::StartPending);
        assert_eq!(ServiceStatus::from_active_state("maintenance"), ServiceStatus::Unknown);
    }

    #[tokio::test]
    async fn test_wait_for_status_succeeds_immediately() {
        let service = FakeService::running();
        service.stop().await.unwrap();
        service
            .wait_for_status(ServiceStatus::Stopped, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(
            service.calls(),
            vec![ServiceCall::Stop, ServiceCall::Status]
        );
    }

    #[tokio::test]
    async fn test_wait_for_status_times_out() {
        let service = FakeService::running().hanging_on_stop();
        service.stop().await.unwrap();
        let err = service
            .wait_for_status(ServiceStatus::Stopped, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Timeout {
                last: ServiceStatus::StopPending,
                ..
            }
        ));
        assert_eq!(err.code(), EventCode::ServiceNotStarted);
    }

    #[tokio::test]
    async fn test_unregistered_service() {
        let service = FakeService::unregistered();
        assert!(matches!(
            service.status().await,
            Err(ServiceError::NotRegistered(_))
        ));
    }
}
