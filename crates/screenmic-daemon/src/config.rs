//! Daemon configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use screenmic_core::{EngineOptions, ReplacePolicy};
use screenmic_pipewire::{CaptureNodeProps, PipeWireOptions};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// PipeWire settings
    #[serde(default)]
    pub pipewire: PipeWireConfig,
    /// Link session settings
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Backend options for [`screenmic_pipewire::connect`].
    #[must_use]
    pub fn pipewire_options(&self) -> PipeWireOptions {
        let pw = &self.pipewire;
        PipeWireOptions {
            capture: CaptureNodeProps {
                name: pw.capture_node_name.clone(),
                description: pw.capture_description.clone(),
                positions: pw.capture_positions.clone(),
            },
            ready_timeout: Duration::from_millis(pw.ready_timeout_ms),
            request_timeout: Duration::from_millis(pw.request_timeout_ms),
            probe_timeout: Duration::from_millis(pw.probe_timeout_ms),
        }
    }

    #[must_use]
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions { replace_policy: self.session.replace_policy }
    }

    /// Socket to listen on, honoring the override.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.daemon.socket_path.clone().unwrap_or_else(screenmic_ipc::socket_path)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Daemon-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Override for the IPC socket path
    pub socket_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), log_format: LogFormat::default(), socket_path: None }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// PipeWire settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeWireConfig {
    /// Name of the virtual capture node
    #[serde(default = "default_capture_name")]
    pub capture_node_name: String,
    /// Description shown by mixers
    #[serde(default = "default_capture_description")]
    pub capture_description: String,
    /// Channel positions of the capture node
    #[serde(default = "default_capture_positions")]
    pub capture_positions: Vec<String>,
    /// Bound on the initial connection handshake
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
    /// Bound on each request to the PipeWire thread
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Bound on the availability probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for PipeWireConfig {
    fn default() -> Self {
        Self {
            capture_node_name: default_capture_name(),
            capture_description: default_capture_description(),
            capture_positions: default_capture_positions(),
            ready_timeout_ms: default_ready_timeout(),
            request_timeout_ms: default_request_timeout(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

fn default_capture_name() -> String {
    "screenmic-capture".to_string()
}

fn default_capture_description() -> String {
    "screenmic Capture".to_string()
}

fn default_capture_positions() -> Vec<String> {
    vec!["FL".to_string(), "FR".to_string()]
}

fn default_ready_timeout() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_probe_timeout() -> u64 {
    500
}

/// Link session settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    /// What a second `link` does while a session is active
    #[serde(default)]
    pub replace_policy: ReplacePolicy,
}

/// Load configuration from file or defaults.
pub fn load_config() -> Result<Config> {
    let config_path = config_path()?;

    if config_path.exists() {
        load_from(&config_path)
    } else {
        info!(?config_path, "Config file not found, using defaults");
        Ok(Config::default())
    }
}

/// Load configuration from a specific file.
pub fn load_from(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {path:?}"))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {path:?}"))?;

    if config.pipewire.capture_positions.is_empty() {
        anyhow::bail!("capture_positions must name at least one channel");
    }

    Ok(config)
}

/// Get the configuration file path.
fn config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("org", "screenmic", "screenmic")
        .context("Could not determine config directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(content.as_bytes()).expect("Failed to write config");
        file
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("");
        let config = load_from(file.path()).expect("Failed to load config");

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.log_format, LogFormat::Pretty);
        assert_eq!(config.session.replace_policy, ReplacePolicy::Replace);

        let options = config.pipewire_options();
        assert_eq!(options.capture.name, "screenmic-capture");
        assert_eq!(options.capture.channels(), 2);
        assert_eq!(options.ready_timeout, Duration::from_secs(1));
        assert_eq!(options.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_sections_override_defaults() {
        let file = write_config(
            r#"
            [daemon]
            log_format = "json"
            socket_path = "/tmp/screenmic-test.sock"

            [pipewire]
            capture_node_name = "meeting-mic"
            capture_positions = ["MONO"]
            request_timeout_ms = 250

            [session]
            replace_policy = "reject"
            "#,
        );
        let config = load_from(file.path()).expect("Failed to load config");

        assert_eq!(config.daemon.log_format, LogFormat::Json);
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/screenmic-test.sock"));
        assert_eq!(config.engine_options().replace_policy, ReplacePolicy::Reject);

        let options = config.pipewire_options();
        assert_eq!(options.capture.name, "meeting-mic");
        assert_eq!(options.capture.position_list(), "MONO");
        assert_eq!(options.request_timeout, Duration::from_millis(250));
        assert_eq!(options.probe_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let file = write_config("[session]\nreplace_policy = \"merge\"\n");
        assert!(load_from(file.path()).is_err());
    }

    #[test]
    fn test_empty_positions_are_rejected() {
        let file = write_config("[pipewire]\ncapture_positions = []\n");
        assert!(load_from(file.path()).is_err());
    }
}
