use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the wirelift daemon and CLI.
#[derive(Debug, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub upgrade: UpgradeSettings,
}

/// Daemon runtime settings.
#[derive(Debug, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Directory holding the per-peer WireGuard templates.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Directory for generated runtime configs and the lock file.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            tcp_port: default_tcp_port(),
            config_dir: default_config_dir(),
            runtime_dir: default_runtime_dir(),
        }
    }
}

/// Timing configuration for the recovery path and the idle-teardown
/// watchdog.
#[derive(Debug, Deserialize)]
pub struct TimingSettings {
    /// How long recovery waits for the control plane to report the
    /// peer reachable again before giving up.
    #[serde(default = "default_recovery_wait")]
    pub recovery_wait_secs: u64,

    /// PersistentKeepalive written into generated configs.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Handshake age after which the watchdog considers a tunnel lost.
    #[serde(default = "default_handshake_stale")]
    pub handshake_stale_secs: u64,

    /// Poll interval of the idle-teardown watchdog.
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            recovery_wait_secs: default_recovery_wait(),
            keepalive_secs: default_keepalive(),
            handshake_stale_secs: default_handshake_stale(),
            watchdog_interval_secs: default_watchdog_interval(),
        }
    }
}

impl TimingSettings {
    pub fn recovery_wait(&self) -> Duration {
        Duration::from_secs(self.recovery_wait_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

/// Defaults for negotiation behavior; CLI flags narrow these further.
#[derive(Debug, Deserialize)]
pub struct UpgradeSettings {
    /// Allow numeric suffixes when the interface name is taken.
    #[serde(default = "default_true")]
    pub suffix: bool,
    /// Register an idle-teardown watchdog for new tunnels.
    #[serde(default = "default_true")]
    pub autoremove: bool,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            suffix: true,
            autoremove: true,
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/wirelift/wirelift.sock")
}
fn default_tcp_port() -> u16 {
    41642
}
fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/wirelift")
}
fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/run/wirelift")
}
fn default_recovery_wait() -> u64 {
    45
}
fn default_keepalive() -> u64 {
    10
}
fn default_handshake_stale() -> u64 {
    180
}
fn default_watchdog_interval() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl Settings {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        let settings: Settings =
            toml::from_str(&content).context("Failed to parse TOML config")?;
        Ok(settings)
    }

    /// Load from default paths or return default settings.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/wirelift/config.toml",
            "~/.wirelift/config.toml",
            "./wirelift.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(settings) = Self::load(&expanded) {
                    return settings;
                }
            }
        }

        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.daemon.tcp_port, 41642);
        assert_eq!(
            settings.daemon.socket_path,
            PathBuf::from("/run/wirelift/wirelift.sock")
        );
        assert_eq!(settings.timing.recovery_wait(), Duration::from_secs(45));
        assert!(settings.upgrade.suffix);
        assert!(settings.upgrade.autoremove);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings: Settings =
            toml::from_str("[daemon]\ntcp_port = 51000\n\n[upgrade]\nautoremove = false\n")
                .unwrap();
        assert_eq!(settings.daemon.tcp_port, 51000);
        assert_eq!(settings.daemon.config_dir, PathBuf::from("/etc/wirelift"));
        assert!(!settings.upgrade.autoremove);
        assert!(settings.upgrade.suffix);
    }
}
