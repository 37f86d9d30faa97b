use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Session settings for the coordination ensemble
///
/// ```toml
/// [connection]
/// hosts = ["zk1:2181", "zk2:2181", "zk3:2181"]
/// session_timeout_ms = 10000
/// randomize_hosts = true
/// chroot = "/services/billing"
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConnectionConfig {
    /// Ensemble members as `host:port`
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,

    /// Session timeout negotiated with the ensemble (unit: milliseconds)
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Shuffle `hosts` before connecting so clients spread across members
    #[serde(default = "default_randomize_hosts")]
    pub randomize_hosts: bool,

    /// Path prefix under which every operation is rooted. Created on open if missing.
    #[serde(default)]
    pub chroot: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            session_timeout_ms: default_session_timeout_ms(),
            randomize_hosts: default_randomize_hosts(),
            chroot: None,
        }
    }
}

impl ConnectionConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "connection.hosts must contain at least one host:port".into(),
            )));
        }
        for host in &self.hosts {
            validate_host_port(host)?;
        }

        if self.session_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "connection.session_timeout_ms must be greater than 0".into(),
            )));
        }

        if let Some(chroot) = &self.chroot {
            if !chroot.starts_with('/') || chroot.len() < 2 || chroot.ends_with('/') || chroot.contains("//") {
                return Err(Error::Config(ConfigError::Message(format!(
                    "connection.chroot must be an absolute path without a trailing slash, got {chroot:?}"
                ))));
            }
        }
        Ok(())
    }
}

/// Accepts `host:port` where host is a name or IPv4 address and port fits in u16
pub fn validate_host_port(addr: &str) -> Result<()> {
    let invalid = || {
        Error::Config(ConfigError::Message(format!(
            "invalid host {addr:?}, expected host:port"
        )))
    };
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
    if !host_ok || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}

fn default_hosts() -> Vec<String> {
    vec!["127.0.0.1:2181".to_string()]
}
fn default_session_timeout_ms() -> u64 {
    10_000
}
fn default_randomize_hosts() -> bool {
    true
}
