//! Configuration
//!
//! Two documents feed a run:
//! - the host agent's `config.json`, which names the plugins in use and the
//!   auto-update source (read-only for us, owned by the agent)
//! - the updater's own `updater.toml`, all fields optional
//!
//! Relative paths in the settings are resolved against the install root.

use crate::assembly::Assembly;
use crate::checksum::ChecksumAlgorithm;
use crate::events::EventCode;
use crate::release::ReleaseSource;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default location of the updater settings
pub const DEFAULT_SETTINGS_FILE: &str = "/etc/agent-updater/updater.toml";

/// Configuration load failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid configuration in {}: {message}", .path.display())]
    SchemaInvalid { path: PathBuf, message: String },

    #[error("could not read configuration {}: {source}", .path.display())]
    Unknown {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConfigError {
    pub fn code(&self) -> EventCode {
        EventCode::ConfigError
    }
}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
        _ => ConfigError::Unknown {
            path: path.to_path_buf(),
            source: e,
        },
    })
}

// ============================================================================
// Agent configuration (config.json)
// ============================================================================

/// Auto-update section of the agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoUpdateConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub source: ReleaseSource,

    /// Base authority or `{name}` template of the release API
    #[serde(default)]
    pub uri: String,

    /// Extra root-level dependencies to keep current
    #[serde(default)]
    pub additional_updates: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for AutoUpdateConfig {
    /// A config without an auto-update section does not update
    fn default() -> Self {
        Self {
            enabled: false,
            source: ReleaseSource::default(),
            uri: String::new(),
            additional_updates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPluginConfig {
    pub name: String,
    #[serde(default)]
    pub output_plugins: Vec<PluginRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSinkConfig {
    #[serde(default)]
    pub output_plugins: Vec<PluginRef>,
}

/// The host agent's configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default, alias = "autoUpdates")]
    pub auto_update: AutoUpdateConfig,

    #[serde(default)]
    pub input_plugins: Vec<InputPluginConfig>,

    #[serde(default, alias = "eventLogs")]
    pub event_sinks: Vec<EventSinkConfig>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = read_config_file(path)?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: AgentConfig =
            serde_json::from_str(content).map_err(|e| ConfigError::SchemaInvalid {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

        if config.auto_update.enabled && config.auto_update.uri.trim().is_empty() {
            return Err(ConfigError::SchemaInvalid {
                path: origin.to_path_buf(),
                message: "autoUpdate.uri is required when auto-update is enabled".to_string(),
            });
        }

        Ok(config)
    }

    /// Every plugin name in use, lowercased, deduplicated, in document order
    pub fn plugin_names(&self) -> Vec<String> {
        let inputs = self.input_plugins.iter().flat_map(|input| {
            std::iter::once(input.name.as_str())
                .chain(input.output_plugins.iter().map(|o| o.name.as_str()))
        });
        let sinks = self
            .event_sinks
            .iter()
            .flat_map(|sink| sink.output_plugins.iter().map(|o| o.name.as_str()));

        let mut seen = HashSet::new();
        inputs
            .chain(sinks)
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty() && seen.insert(name.clone()))
            .collect()
    }

    /// Assemblies this configuration asks us to track
    pub fn discovered_assemblies(&self) -> Vec<Assembly> {
        self.plugin_names()
            .into_iter()
            .map(Assembly::plugin)
            .chain(
                self.auto_update
                    .additional_updates
                    .iter()
                    .map(|name| Assembly::dependency(name.trim())),
            )
            .collect()
    }
}

// ============================================================================
// Updater settings (updater.toml)
// ============================================================================

/// Updater settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterSettings {
    /// Installation root holding the agent, its dependencies and `plugins/`
    pub install_root: PathBuf,

    /// Agent configuration document
    pub agent_config: PathBuf,

    /// Staging directory for downloads
    pub staging_dir: PathBuf,

    /// Service to stop and restart around the copy
    pub service_name: String,

    /// Always-tracked assemblies
    pub agent_executable: String,
    pub agent_dependency: String,
    pub updater_executable: String,

    pub checksum: ChecksumAlgorithm,

    pub stop_timeout_secs: u64,
    pub settle_delay_secs: u64,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,

    /// Stop planning after this long and skip deployment
    pub plan_deadline_secs: Option<u64>,

    /// JSONL event log; none disables the file log
    pub event_log: Option<PathBuf>,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from("/opt/agent"),
            agent_config: PathBuf::from("config.json"),
            staging_dir: PathBuf::from("tmp"),
            service_name: "agent".to_string(),
            agent_executable: "agent".to_string(),
            agent_dependency: "agent-plugin".to_string(),
            updater_executable: "agent-updater".to_string(),
            checksum: ChecksumAlgorithm::default(),
            stop_timeout_secs: 25,
            settle_delay_secs: 5,
            request_timeout_secs: 30,
            download_timeout_secs: 300,
            plan_deadline_secs: None,
            event_log: Some(PathBuf::from("/var/log/agent-updater/events.jsonl")),
        }
    }
}

impl UpdaterSettings {
    /// Load settings from an explicit file; the file must exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = read_config_file(path)?;
        Self::parse(&content, path)
    }

    /// Load from a file if present, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::SchemaInvalid {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.install_root.join(path)
        }
    }

    pub fn agent_config_path(&self) -> PathBuf {
        self.resolve(&self.agent_config)
    }

    pub fn staging_path(&self) -> PathBuf {
        self.resolve(&self.staging_dir)
    }

    pub fn event_log_path(&self) -> Option<PathBuf> {
        self.event_log.as_deref().map(|p| self.resolve(p))
    }

    /// Assemblies tracked regardless of configuration
    pub fn default_assemblies(&self) -> Vec<Assembly> {
        vec![
            Assembly::executable(&self.agent_executable),
            Assembly::dependency(&self.agent_dependency),
            Assembly::executable(&self.updater_executable),
        ]
    }

    /// Live path of the updater's own executable
    pub fn updater_path(&self) -> PathBuf {
        Assembly::executable(&self.updater_executable).local_path(&self.install_root)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs.max(1))
    }

    pub fn plan_deadline(&self) -> Option<Duration> {
        self.plan_deadline_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const AGENT_CONFIG: &str = r#"{
        "autoUpdate": {
            "enabled": true,
            "source": "github",
            "uri": "https://api.github.test/repos/org/",
            "additionalUpdates": ["libcrypto-shim"]
        },
        "inputPlugins": [
            {"name": "EventLog", "settings": {}, "outputPlugins": [{"name": "Http"}, {"name": "console"}]},
            {"name": "perf", "outputPlugins": [{"name": "http"}]}
        ],
        "eventSinks": [
            {"outputPlugins": [{"name": "console"}, {"name": "syslog"}]}
        ]
    }"#;

    #[test]
    fn test_agent_config_parse() {
        let config = AgentConfig::parse(AGENT_CONFIG, Path::new("config.json")).unwrap();
        assert!(config.auto_update.enabled);
        assert_eq!(config.auto_update.source, ReleaseSource::GitHub);
        assert_eq!(
            config.plugin_names(),
            vec!["eventlog", "http", "console", "perf", "syslog"]
        );

        let assemblies = config.discovered_assemblies();
        assert_eq!(assemblies.len(), 6);
        assert_eq!(assemblies[5].name(), "libcrypto-shim");
        assert_eq!(assemblies[5].kind(), crate::assembly::AssemblyKind::Dependency);
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::parse(
            r#"{"autoUpdate": {"uri": "https://gitlab.test/api"}}"#,
            Path::new("config.json"),
        )
        .unwrap();
        assert!(config.auto_update.enabled);
        assert_eq!(config.auto_update.source, ReleaseSource::GitLab);
        assert!(config.plugin_names().is_empty());

        let bare = AgentConfig::parse("{}", Path::new("config.json")).unwrap();
        assert!(!bare.auto_update.enabled);
    }

    #[test]
    fn test_source_is_case_insensitive() {
        for (raw, expected) in [
            ("gitHub", ReleaseSource::GitHub),
            ("GitHUB", ReleaseSource::GitHub),
            ("gitlab", ReleaseSource::GitLab),
            ("GITlab", ReleaseSource::GitLab),
        ] {
            let body = format!(r#"{{"autoUpdate": {{"source": "{}", "uri": "x"}}}}"#, raw);
            let config = AgentConfig::parse(&body, Path::new("config.json")).unwrap();
            assert_eq!(config.auto_update.source, expected, "source {:?}", raw);
        }
    }

    #[test]
    fn test_agent_config_errors() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("config.json");
        assert!(matches!(AgentConfig::load(&missing), Err(ConfigError::NotFound(_))));

        fs::write(&missing, "{ \"inputPlugins\": 5 }").unwrap();
        let err = AgentConfig::load(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::SchemaInvalid { .. }));
        assert_eq!(err.code(), EventCode::ConfigError);

        let err = AgentConfig::parse(r#"{"autoUpdate": {"enabled": true}}"#, &missing).unwrap_err();
        assert!(matches!(err, ConfigError::SchemaInvalid { .. }));

        let err = AgentConfig::parse(
            r#"{"autoUpdate": {"source": "bitbucket", "uri": "x"}}"#,
            &missing,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::SchemaInvalid { .. }));
    }

    #[test]
    fn test_settings_defaults_and_overrides() {
        let settings = UpdaterSettings::parse(
            r#"
            install_root = "/srv/agent"
            service_name = "agentd"
            checksum = "sha256"
            stop_timeout_secs = 10
            event_log = "logs/events.jsonl"
            "#,
            Path::new("updater.toml"),
        )
        .unwrap();

        assert_eq!(settings.service_name, "agentd");
        assert_eq!(settings.checksum, ChecksumAlgorithm::Sha256);
        assert_eq!(settings.stop_timeout(), Duration::from_secs(10));
        assert_eq!(settings.settle_delay(), Duration::from_secs(5));
        assert_eq!(settings.staging_path(), PathBuf::from("/srv/agent/tmp"));
        assert_eq!(settings.agent_config_path(), PathBuf::from("/srv/agent/config.json"));
        assert_eq!(
            settings.event_log_path(),
            Some(PathBuf::from("/srv/agent/logs/events.jsonl"))
        );
        assert_eq!(settings.default_assemblies().len(), 3);
    }

    #[test]
    fn test_settings_file_optional() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("updater.toml");
        let settings = UpdaterSettings::load_or_default(&path).unwrap();
        assert_eq!(settings.stop_timeout_secs, 25);
        assert!(matches!(UpdaterSettings::load(&path), Err(ConfigError::NotFound(_))));

        fs::write(&path, "stop_timeout_secs = \"soon\"").unwrap();
        assert!(matches!(
            UpdaterSettings::load_or_default(&path),
            Err(ConfigError::SchemaInvalid { .. })
        ));
    }
}
