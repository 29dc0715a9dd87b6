//! Update planner - decide which assemblies are stale
//!
//! For each assembly, strictly in order:
//! 1. fetch the latest release (errors are reported, the assembly is skipped)
//! 2. the release version was parsed by the provider
//! 3. read the local version (`0.0.0` if absent or unreadable)
//! 4. if remote > local, every release asset lands in the plan next to the
//!    assembly's local path
//!
//! Planning never fails as a whole. Equal versions never produce entries,
//! so a second run against an unchanged release source plans nothing.

use crate::assembly::{Assembly, AssemblyRegistry};
use crate::events::{Event, EventCode, EventSink};
use crate::local_version::VersionReader;
use crate::release::{ProviderError, Release, ReleaseProvider, ReleaseSource};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Destination path -> download URL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    entries: BTreeMap<PathBuf, String>,
}

impl UpdatePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry; a later insert for the same path wins
    pub fn insert(&mut self, dest: impl Into<PathBuf>, url: impl Into<String>) {
        self.entries.insert(dest.into(), url.into());
    }

    pub fn remove(&mut self, dest: &Path) -> Option<String> {
        self.entries.remove(dest)
    }

    pub fn get(&self, dest: &Path) -> Option<&str> {
        self.entries.get(dest).map(String::as_str)
    }

    pub fn contains(&self, dest: &Path) -> bool {
        self.entries.contains_key(dest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.entries.iter().map(|(p, u)| (p.as_path(), u.as_str()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }

    /// Union with another plan; entries of `other` win on collision
    pub fn merge(&mut self, other: UpdatePlan) {
        self.entries.extend(other.entries);
    }
}

impl FromIterator<(PathBuf, String)> for UpdatePlan {
    fn from_iter<I: IntoIterator<Item = (PathBuf, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Result of a planning pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanOutcome {
    pub plan: UpdatePlan,
    /// The deadline expired before every assembly was checked
    pub truncated: bool,
}

/// Plans updates for a registry of assemblies
pub struct Planner<'a> {
    provider: &'a dyn ReleaseProvider,
    versions: &'a dyn VersionReader,
    events: &'a dyn EventSink,
    install_root: PathBuf,
    deadline: Option<Duration>,
}

impl<'a> Planner<'a> {
    pub fn new(
        provider: &'a dyn ReleaseProvider,
        versions: &'a dyn VersionReader,
        events: &'a dyn EventSink,
        install_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider,
            versions,
            events,
            install_root: install_root.into(),
            deadline: None,
        }
    }

    /// Stop planning once `deadline` has elapsed
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn plan(
        &self,
        registry: &AssemblyRegistry,
        source: ReleaseSource,
        base: &str,
    ) -> PlanOutcome {
        let started = Instant::now();
        let mut outcome = PlanOutcome::default();

        for assembly in registry {
            let remaining = match self.deadline {
                Some(limit) => match limit.checked_sub(started.elapsed()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => {
                        outcome.truncated = true;
                        break;
                    }
                },
                None => None,
            };

            let fetch = self.provider.fetch_latest(source, base, assembly.name());
            let result = match remaining {
                Some(left) => match tokio::time::timeout(left, fetch).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.events.emit(Event::warning(
                            EventCode::FetchFailed,
                            format!(
                                "Planning deadline reached while checking {}; remaining assemblies skipped",
                                assembly.name()
                            ),
                        ));
                        outcome.truncated = true;
                        break;
                    }
                },
                None => fetch.await,
            };

            match result {
                Ok(release) => {
                    let contribution = self.plan_assembly(assembly, &release);
                    outcome.plan.merge(contribution);
                }
                Err(e) => self.report_fetch_error(assembly, &e),
            }
        }

        info!(
            "Planned {} file(s) across {} assemblies{}",
            outcome.plan.len(),
            registry.len(),
            if outcome.truncated { " (truncated)" } else { "" }
        );
        outcome
    }

    /// Entries contributed by one assembly's release
    fn plan_assembly(&self, assembly: &Assembly, release: &Release) -> UpdatePlan {
        let local = self
            .versions
            .local_version(&assembly.local_path(&self.install_root));

        if release.version <= local {
            debug!(
                "{} is current (local {}, remote {})",
                assembly.name(),
                local,
                release.version
            );
            return UpdatePlan::new();
        }

        info!(
            "{} {} -> {} ({} assets)",
            assembly.name(),
            local,
            release.version,
            release.assets.len()
        );

        let target_dir = assembly.target_dir(&self.install_root);
        let mut plan = UpdatePlan::new();
        for asset in &release.assets {
            if !is_plain_file_name(&asset.filename) {
                self.events.emit(Event::warning(
                    EventCode::FetchFailed,
                    format!(
                        "Ignoring asset '{}' of {}: not a plain file name",
                        asset.filename,
                        assembly.name()
                    ),
                ));
                continue;
            }
            plan.insert(target_dir.join(&asset.filename), asset.url.clone());
        }
        plan
    }

    fn report_fetch_error(&self, assembly: &Assembly, error: &ProviderError) {
        let message = match error {
            ProviderError::TransportFailure {
                status,
                url,
                message,
            } => {
                let status = status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".to_string());
                format!(
                    "Request failed: {}\nPlugin: {}\nRequestURL: {}\nError Message: {}",
                    status,
                    assembly.name(),
                    url,
                    message
                )
            }
            other => format!(
                "General Request Error\nPlugin: {}\nError: {}",
                assembly.name(),
                other
            ),
        };
        self.events.emit(Event::error(error.code(), message));
    }
}

/// Asset names come from the network and must not escape the target dir
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::local_version::FixedVersionReader;
    use crate::release::ReleaseAsset;
    use crate::version::Version;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StubProvider {
        releases: HashMap<String, Result<Release, ProviderError>>,
    }

    #[async_trait]
    impl ReleaseProvider for StubProvider {
        async fn fetch_latest(
            &self,
            _source: ReleaseSource,
            _base: &str,
            assembly_name: &str,
        ) -> Result<Release, ProviderError> {
            self.releases
                .get(assembly_name)
                .cloned()
                .unwrap_or(Err(ProviderError::NoSuchRelease {
                    reason: "stub".to_string(),
                }))
        }
    }

    fn release(version: &str, files: &[&str]) -> Release {
        Release {
            version: Version::parse(version).unwrap(),
            assets: files
                .iter()
                .map(|f| ReleaseAsset::new(*f, format!("https://dl.test/{}", f)))
                .collect(),
        }
    }

    #[test]
    fn test_plan_merge_later_wins() {
        let mut a = UpdatePlan::new();
        a.insert("/x/a", "one");
        let mut b = UpdatePlan::new();
        b.insert("/x/a", "two");
        b.insert("/x/b", "three");
        a.merge(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.get(Path::new("/x/a")), Some("two"));
    }

    #[test]
    fn test_plain_file_names() {
        assert!(is_plain_file_name("plugin.so.sha1"));
        assert!(!is_plain_file_name("../agent"));
        assert!(!is_plain_file_name("sub/file"));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name(""));
    }

    #[tokio::test]
    async fn test_plan_skips_current_and_failed() {
        let root = PathBuf::from("/opt/agent");
        let http = crate::assembly::Assembly::plugin("http");
        let console = crate::assembly::Assembly::plugin("console");
        let broken = crate::assembly::Assembly::plugin("broken");

        let provider = StubProvider {
            releases: HashMap::from([
                ("http".to_string(), Ok(release("2.0.0", &["http.so", "http.so.sha1"]))),
                ("console".to_string(), Ok(release("1.0.0", &["console.so"]))),
                (
                    "broken".to_string(),
                    Err(ProviderError::TransportFailure {
                        status: Some(500),
                        url: "https://api.test/broken".to_string(),
                        message: String::new(),
                    }),
                ),
            ]),
        };
        let versions = FixedVersionReader::new()
            .with(http.local_path(&root), "1.9.9")
            .with(console.local_path(&root), "1.0.0.0");
        let events = RecordingSink::new();

        let registry = AssemblyRegistry::build(vec![broken, http, console], vec![]);
        let planner = Planner::new(&provider, &versions, &events, &root);
        let outcome = planner
            .plan(&registry, ReleaseSource::GitHub, "https://api.test")
            .await;

        assert!(!outcome.truncated);
        let paths: Vec<&Path> = outcome.plan.paths().collect();
        assert_eq!(
            paths,
            vec![
                root.join("plugins/http.so").as_path(),
                root.join("plugins/http.so.sha1").as_path()
            ]
        );
        assert_eq!(events.codes(), vec![EventCode::RequestFailed]);
        let message = &events.events()[0].message;
        assert!(message.contains("500"));
        assert!(message.contains("https://api.test/broken"));
    }

    #[tokio::test]
    async fn test_zero_deadline_truncates() {
        let provider = StubProvider {
            releases: HashMap::new(),
        };
        let versions = FixedVersionReader::new();
        let events = RecordingSink::new();
        let registry = AssemblyRegistry::build(vec![Assembly::plugin("http")], vec![]);

        let planner = Planner::new(&provider, &versions, &events, "/opt/agent")
            .with_deadline(Some(Duration::ZERO));
        let outcome = planner
            .plan(&registry, ReleaseSource::GitLab, "https://api.test")
            .await;

        assert!(outcome.truncated);
        assert!(outcome.plan.is_empty());
        assert!(events.events().is_empty());
    }
}
