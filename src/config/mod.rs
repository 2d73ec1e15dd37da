//! Configuration and credential storage

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use url::Url;

/// Registration lifetime requested from the PBX, in seconds.
pub const REGISTER_EXPIRES: u32 = 600;

/// Application configuration. Read-only at runtime: the file is created
/// and edited by hand (or by provisioning), never written by the program.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Secure WebSocket URL of the PBX signaling endpoint (wss://host:port/ws)
    pub server_url: String,
    /// Extension to register as
    pub extension: String,
    /// SIP secret for digest authentication
    pub secret: String,
    /// Master switch; when false every connect attempt is refused
    pub enabled: bool,
    /// Append terminated calls to a JSONL log in the data directory
    pub call_log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_url: String::new(),
            extension: String::new(),
            secret: String::new(),
            enabled: true,
            call_log: false,
        }
    }
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("org", "softphone-cli", "softphone-cli")
            .context("Could not determine config directory")
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Path of the JSONL call log in the platform data directory
    pub fn call_log_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.data_dir().join("calls.jsonl"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Validates the connection parameters and returns the parsed signaling
    /// URL. Only `wss` is accepted; an unencrypted or non-WebSocket scheme
    /// is refused before any connection attempt.
    pub fn signaling_url(&self) -> Result<Url> {
        if !self.enabled {
            bail!("softphone is disabled in the configuration (enabled = false)");
        }
        if self.server_url.is_empty() {
            bail!(
                "server_url is not configured; edit {}",
                Self::config_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "the config file".to_string())
            );
        }
        let url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server_url {:?}", self.server_url))?;
        if url.scheme() != "wss" {
            bail!(
                "server_url must use the wss:// scheme, got {:?}",
                url.scheme()
            );
        }
        if url.host_str().is_none() {
            bail!("server_url has no host: {:?}", self.server_url);
        }
        if self.extension.is_empty() {
            bail!("extension is not configured");
        }
        Ok(url)
    }

    /// SIP domain used in request URIs and From/To, i.e. the PBX host.
    pub fn sip_domain(&self) -> Result<String> {
        let url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server_url {:?}", self.server_url))?;
        url.host_str()
            .map(str::to_string)
            .context("server_url has no host")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            server_url: "wss://pbx.example.org:8089/ws".to_string(),
            extension: "100".to_string(),
            secret: "s3cret".to_string(),
            enabled: true,
            call_log: false,
        }
    }

    #[test]
    fn test_accepts_wss_url() {
        let url = valid().signaling_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("pbx.example.org"));
        assert_eq!(valid().sip_domain().unwrap(), "pbx.example.org");
    }

    #[test]
    fn test_rejects_non_wss_schemes() {
        for scheme in ["ws://pbx/ws", "https://pbx/ws", "sip:pbx"] {
            let cfg = Config {
                server_url: scheme.to_string(),
                ..valid()
            };
            let err = cfg.signaling_url().unwrap_err();
            assert!(
                err.to_string().contains("wss"),
                "unexpected error for {scheme}: {err}"
            );
        }
    }

    #[test]
    fn test_rejects_unparseable_url() {
        let cfg = Config {
            server_url: "not a url".to_string(),
            ..valid()
        };
        assert!(cfg.signaling_url().is_err());
    }

    #[test]
    fn test_rejects_missing_fields() {
        let cfg = Config {
            server_url: String::new(),
            ..valid()
        };
        assert!(cfg.signaling_url().is_err());

        let cfg = Config {
            extension: String::new(),
            ..valid()
        };
        assert!(cfg.signaling_url().is_err());
    }

    #[test]
    fn test_rejects_disabled_config() {
        let cfg = Config {
            enabled: false,
            ..valid()
        };
        let err = cfg.signaling_url().unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: Config =
            toml::from_str("server_url = \"wss://pbx/ws\"\nextension = \"42\"").unwrap();
        assert_eq!(cfg.server_url, "wss://pbx/ws");
        assert_eq!(cfg.extension, "42");
        assert!(cfg.secret.is_empty());
        assert!(cfg.enabled);
        assert!(!cfg.call_log);
    }
}
