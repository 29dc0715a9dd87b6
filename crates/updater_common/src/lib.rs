//! Updater Common - release discovery, staging and deployment for the agent
//!
//! One run is a single pass: Registry -> Plan -> Stage -> Deploy.
//! Every collaborator with side effects (HTTP, service manager, version
//! probing, event reporting) sits behind a trait with a fake for tests.

pub mod assembly;
pub mod checksum;
pub mod config;
pub mod deploy;
pub mod events;
pub mod local_version;
pub mod lock;
pub mod planner;
pub mod release;
pub mod service;
pub mod staging;
pub mod transport;
pub mod version;

pub use assembly::{Assembly, AssemblyKind, AssemblyRegistry};
pub use checksum::ChecksumAlgorithm;
pub use config::{AgentConfig, AutoUpdateConfig, ConfigError, UpdaterSettings};
pub use deploy::{DeployError, DeployOutcome, Deployer};
pub use events::{Event, EventCode, EventSink, Severity};
pub use local_version::{EmbeddedVersionReader, VersionReader};
pub use lock::{LockError, RunLock};
pub use planner::{PlanOutcome, Planner, UpdatePlan};
pub use release::{HttpReleaseProvider, ProviderError, Release, ReleaseAsset, ReleaseProvider, ReleaseSource};
pub use service::{ServiceController, ServiceError, ServiceStatus, SystemdService};
pub use staging::{StageFailure, Stager, StagingResult};
pub use transport::{HttpTransport, ReqwestTransport, TransportError};
pub use version::{Version, VersionParseError};
