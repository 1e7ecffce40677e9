//! Configuration loading.
//!
//! Layers, lowest first: built-in defaults, the TOML file, then
//! `PODSPAWN__SECTION__KEY` environment variables. The file is optional and is
//! never created here; podspawn runs under sshd as whichever user logged in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::DEFAULT_SANDBOX_PREFIX;
use crate::runtime::DockerRuntime;
use crate::session::SessionConfig;

pub const APP_NAME: &str = "podspawn";

/// System-wide config file, read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/podspawn/config.toml";

/// Where per-user public key files live by default.
pub const DEFAULT_KEY_DIR: &str = "/etc/podspawn/keys";

const ENV_PREFIX: &str = "PODSPAWN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("loading configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("expanding {field} path {value:?}: {message}")]
    Expand {
        field: &'static str,
        value: String,
        message: String,
    },

    #[error("invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: &'static str,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionSection,
    pub auth: AuthConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub image: String,
    pub shell: String,
    pub placeholder: Vec<String>,
    pub sandbox_prefix: String,
    pub cleanup_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    /// Enables per-sandbox provisioning locks when set.
    pub lock_dir: Option<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            image: defaults.image,
            shell: defaults.shell,
            placeholder: defaults.placeholder,
            sandbox_prefix: DEFAULT_SANDBOX_PREFIX.to_string(),
            cleanup_timeout_secs: defaults.cleanup_timeout.as_secs(),
            stop_timeout_secs: defaults.stop_timeout.as_secs(),
            lock_dir: None,
        }
    }
}

impl SessionSection {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            image: self.image.clone(),
            shell: self.shell.clone(),
            placeholder: self.placeholder.clone(),
            sandbox_prefix: self.sandbox_prefix.clone(),
            cleanup_timeout: Duration::from_secs(self.cleanup_timeout_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            lock_dir: self.lock_dir.as_ref().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Directory holding one public key file per user.
    pub key_dir: String,
    /// Program named in forced commands. Defaults to the running executable.
    pub binary: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_dir: DEFAULT_KEY_DIR.to_string(),
            binary: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Engine socket. Falls back to `DOCKER_HOST`, then
    /// [`DEFAULT_SOCKET`](crate::runtime::DEFAULT_SOCKET).
    pub socket: Option<String>,
}

impl RuntimeConfig {
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.socket.as_ref().map(PathBuf::from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

impl AppConfig {
    /// Load from `path` (or [`DEFAULT_CONFIG_PATH`]) and the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH)), None)
    }

    /// Load with an explicit environment map in place of the process
    /// environment.
    pub fn load_from(
        path: &Path,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let built = Config::builder()
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .source(env),
            )
            .build()?;

        let mut config: AppConfig = built.try_deserialize()?;
        config.expand_paths()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // A zero deadline would abandon every sandbox at session end
        if self.session.cleanup_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "session.cleanup_timeout_secs",
                message: "must be at least 1",
            });
        }
        Ok(())
    }

    fn expand_paths(&mut self) -> Result<(), ConfigError> {
        self.auth.key_dir = expand("auth.key_dir", &self.auth.key_dir)?;
        expand_opt("auth.binary", &mut self.auth.binary)?;
        expand_opt("session.lock_dir", &mut self.session.lock_dir)?;
        expand_opt("runtime.socket", &mut self.runtime.socket)?;
        expand_opt("logging.file", &mut self.logging.file)?;
        Ok(())
    }

    /// Effective engine socket.
    pub fn engine_socket(&self) -> PathBuf {
        DockerRuntime::resolve_socket(self.runtime.socket_path().as_deref())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn expand(field: &'static str, value: &str) -> Result<String, ConfigError> {
    shellexpand::full(value)
        .map(|expanded| expanded.into_owned())
        .map_err(|e| ConfigError::Expand {
            field,
            value: value.to_string(),
            message: e.to_string(),
        })
}

fn expand_opt(field: &'static str, value: &mut Option<String>) -> Result<(), ConfigError> {
    if let Some(raw) = value.as_deref() {
        *value = Some(expand(field, raw)?);
    }
    Ok(())
}

/// Default log file for `spawn`: `<state dir>/podspawn/podspawn.log`.
pub fn default_log_file() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir).join(APP_NAME).join("podspawn.log"));
    }
    dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("state")))
        .map(|dir| dir.join(APP_NAME).join("podspawn.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("absent.toml"), env(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.auth.key_dir, "/etc/podspawn/keys");
        assert!(!dir.path().join("absent.toml").exists());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[session]
image = "ghcr.io/acme/dev:latest"
shell = "/bin/zsh"
cleanup_timeout_secs = 30

[auth]
key_dir = "/srv/keys"

[logging]
level = "debug"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path, env(&[])).unwrap();
        assert_eq!(config.session.image, "ghcr.io/acme/dev:latest");
        assert_eq!(config.session.shell, "/bin/zsh");
        assert_eq!(config.session.cleanup_timeout_secs, 30);
        assert_eq!(config.session.sandbox_prefix, "podspawn-");
        assert_eq!(config.auth.key_dir, "/srv/keys");
        assert_eq!(config.logging.level, "debug");

        let session = config.session.to_session_config();
        assert_eq!(session.cleanup_timeout, Duration::from_secs(30));
        assert_eq!(session.stop_timeout, Duration::from_secs(10));
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nimage = \"alpine:3.20\"\n").unwrap();

        let config = AppConfig::load_from(
            &path,
            env(&[
                ("PODSPAWN__SESSION__IMAGE", "debian:12"),
                ("PODSPAWN__RUNTIME__SOCKET", "/run/docker.sock"),
            ]),
        )
        .unwrap();
        assert_eq!(config.session.image, "debian:12");
        assert_eq!(config.engine_socket(), PathBuf::from("/run/docker.sock"));
    }

    #[test]
    fn paths_are_expanded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nlock_dir = \"~/locks\"\n").unwrap();

        let config = AppConfig::load_from(&path, env(&[])).unwrap();
        let lock_dir = config.session.lock_dir.unwrap();
        assert!(!lock_dir.starts_with('~'), "{lock_dir}");
        assert!(lock_dir.ends_with("/locks"));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session\nimage = ").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path, env(&[])),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn zero_cleanup_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\ncleanup_timeout_secs = 0\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path, env(&[])),
            Err(ConfigError::Invalid {
                field: "session.cleanup_timeout_secs",
                ..
            })
        ));
    }

    #[test]
    fn renders_as_toml() {
        let rendered = AppConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[session]"));
        assert!(rendered.contains("image = \"ubuntu:24.04\""));
        assert!(rendered.contains("key_dir = \"/etc/podspawn/keys\""));
    }
}
