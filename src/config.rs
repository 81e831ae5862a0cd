//! TOML configuration for the IDMEF event manager.
//!
//! A layered configuration model: an environment-variable override for the
//! config file path, a standard system location, and compiled-in defaults
//! if neither is present. Every section is `#[serde(default)]` so a config
//! file only needs to override what it cares about.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;

const ENV_CONFIG_PATH: &str = "IDMEF_MANAGER_CONFIG";
const SYSTEM_CONFIG_PATH: &str = "/etc/idmef-manager/config.toml";

/// Root configuration for the manager process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ManagerConfig {
    pub identity: IdentityConfig,
    pub listen: ListenConfig,
    pub spool: SpoolConfig,
    pub sinks: Vec<SinkConfig>,
    pub decode_plugins: DecodePluginsConfig,
    pub logging: LoggingConfig,
}

impl ManagerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source: Box::new(source),
        })?;
        config.validate()?;
        info!(path = %path.display(), "loaded manager configuration");
        Ok(config)
    }

    /// Try, in order: the `IDMEF_MANAGER_CONFIG` env var, the standard
    /// system path, then compiled-in defaults. Only an explicitly named
    /// config file that fails to load is treated as fatal; the system path
    /// and the default fallback are best-effort.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
            return Self::load(Path::new(&env_path));
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            return match Self::load(system_path) {
                Ok(cfg) => Ok(cfg),
                Err(e) => {
                    warn!(path = %system_path.display(), error = %e, "system config present but invalid, using defaults");
                    Self::default().validated()
                }
            };
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default().validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    /// Cross-field checks TOML deserialization alone can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.unix_path.is_none() && self.listen.tcp_addrs.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        let mut seen = std::collections::HashSet::new();
        for sink in &self.sinks {
            let key = (sink.name.clone(), sink.instance.clone());
            if !seen.insert(key) {
                return Err(ConfigError::DuplicateSinkInstance {
                    sink: sink.name.clone(),
                    instance: sink.instance.clone(),
                });
            }
        }

        Ok(())
    }

    /// The effective retry period for a given sink, honoring a per-sink
    /// override keyed `<name>[<instance>]` over the process-wide default.
    pub fn retry_period_for(&self, sink: &str, instance: &str) -> std::time::Duration {
        let key = format!("{sink}[{instance}]");
        let secs = self
            .spool
            .overrides
            .get(&key)
            .and_then(|o| o.retry_secs)
            .unwrap_or(self.spool.default_retry_secs);
        std::time::Duration::from_secs(secs)
    }

    /// The effective spool quota for a given sink.
    pub fn quota_for(&self, sink: &str, instance: &str) -> usize {
        let key = format!("{sink}[{instance}]");
        self.spool
            .overrides
            .get(&key)
            .and_then(|o| o.quota)
            .unwrap_or(self.spool.default_quota)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// This manager's own 64-bit analyzer id, appended to every event's
    /// analyzer chain during normalization.
    pub analyzer_id: u64,
    /// Path to the manager's Ed25519 private key (raw 32-byte secret),
    /// generated on first run if absent.
    pub private_key_path: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            analyzer_id: 1,
            private_key_path: PathBuf::from("/var/lib/idmef-manager/identity.ed25519"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// A local UNIX-domain socket path, if enabled. Connections accepted
    /// here may downgrade to plaintext after authentication.
    pub unix_path: Option<PathBuf>,
    /// TCP/IPv4 or TCP/IPv6 bind addresses; always TLS.
    pub tcp_addrs: Vec<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            unix_path: None,
            tcp_addrs: vec!["0.0.0.0:4690".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub directory: PathBuf,
    pub default_quota: usize,
    /// Process-wide default, in seconds, matching the compiled-in constant
    /// from the original design; overridable per sink below.
    pub default_retry_secs: u64,
    /// Keyed `<sink-name>[<instance-name>]`, matching the on-disk spool
    /// file naming convention.
    pub overrides: HashMap<String, SinkSpoolOverride>,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/lib/idmef-manager/spool"),
            default_quota: crate::spool::DEFAULT_QUOTA,
            default_retry_secs: crate::fanout::DEFAULT_RETRY_PERIOD.as_secs(),
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SinkSpoolOverride {
    pub quota: Option<usize>,
    pub retry_secs: Option<u64>,
}

/// One `[[sinks]]` table entry. `kind` selects which built-in sink
/// implementation to construct; `params` carries whatever that
/// implementation needs and is otherwise opaque to the config loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub kind: String,
    pub name: String,
    pub instance: String,
    #[serde(default)]
    pub params: toml::value::Table,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DecodePluginsConfig {
    /// Directory scanned for externally-supplied decode plugins. Loading
    /// from this directory is an external collaborator's job; the manager
    /// only carries the configured path through.
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_one_listener_and_validates() {
        let cfg = ManagerConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn no_listeners_is_rejected() {
        let mut cfg = ManagerConfig::default();
        cfg.listen.tcp_addrs.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoListeners)));
    }

    #[test]
    fn duplicate_sink_instance_is_rejected() {
        let mut cfg = ManagerConfig::default();
        cfg.sinks.push(SinkConfig {
            kind: "xml-file".into(),
            name: "xml-file".into(),
            instance: "default".into(),
            params: Default::default(),
        });
        cfg.sinks.push(SinkConfig {
            kind: "xml-file".into(),
            name: "xml-file".into(),
            instance: "default".into(),
            params: Default::default(),
        });
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateSinkInstance { .. })
        ));
    }

    #[test]
    fn per_sink_override_takes_precedence_over_default() {
        let mut cfg = ManagerConfig::default();
        cfg.spool.default_retry_secs = 600;
        cfg.spool.overrides.insert(
            "sql[primary]".to_string(),
            SinkSpoolOverride {
                quota: Some(50),
                retry_secs: Some(30),
            },
        );

        assert_eq!(
            cfg.retry_period_for("sql", "primary"),
            std::time::Duration::from_secs(30)
        );
        assert_eq!(cfg.quota_for("sql", "primary"), 50);
        assert_eq!(
            cfg.retry_period_for("sql", "secondary"),
            std::time::Duration::from_secs(600)
        );
    }

    #[test]
    fn loads_from_a_toml_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [identity]
            analyzer_id = 42

            [listen]
            tcp_addrs = ["127.0.0.1:4690"]

            [[sinks]]
            kind = "xml-file"
            name = "xml-file"
            instance = "default"
            "#,
        )
        .unwrap();

        let cfg = ManagerConfig::load(&path).unwrap();
        assert_eq!(cfg.identity.analyzer_id, 42);
        assert_eq!(cfg.sinks.len(), 1);
    }

    #[test]
    fn unreadable_path_is_a_config_error() {
        let err = ManagerConfig::load(Path::new("/nonexistent/path/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
