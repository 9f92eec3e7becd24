//! Configuration file
//!
//! Everything has a default, so a missing file at the default location is
//! the same as an empty one. Command-line flags are applied on top.

use crate::networkd::{FileSpec, Override};
use pia_network::HttpClientConfig;
use pia_vpn::{DEFAULT_CATALOG_URL, ProbeConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pia/pia.toml";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid mode {0:?} (expected octal like 0640)")]
    InvalidMode(String),

    #[error("token_validity_secs must be between 1 and {max}, got {value}")]
    InvalidTokenValidity { value: i64, max: i64 },
}

/// Tokens are issued for 24 hours; a fresh one must be treated as
/// expiring before that
const MAX_TOKEN_VALIDITY_SECS: i64 = 24 * 3600 - 1;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Region id, or `auto`
    pub region: String,
    /// WireGuard interface name; also names the cached session
    pub interface: String,
    pub cache_dir: PathBuf,
    pub catalog_url: String,
    /// Lifetime assumed for a fresh token
    pub token_validity_secs: i64,
    /// Use `wg genkey`/`wg pubkey` from this binary instead of generating
    /// keys in-process
    pub wg_binary: Option<PathBuf>,
    pub http: HttpSection,
    pub probe: ProbeSection,
    pub transmission: Option<TransmissionSection>,
    pub rtorrent: Option<RtorrentSection>,
    pub networkd: NetworkdSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            region: "ca_toronto".to_string(),
            interface: "pia".to_string(),
            cache_dir: PathBuf::from("/var/cache/pia"),
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            token_validity_secs: 23 * 3600 + 55 * 60,
            wg_binary: None,
            http: HttpSection::default(),
            probe: ProbeSection::default(),
            transmission: None,
            rtorrent: None,
            networkd: NetworkdSection::default(),
        }
    }
}

impl AppConfig {
    /// Load from `path`
    ///
    /// A missing file is only an error when the path was asked for
    /// explicitly.
    pub fn load(path: &Path, explicit: bool) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn token_validity(&self) -> Result<chrono::TimeDelta, ConfigError> {
        let value = self.token_validity_secs;
        let invalid = || ConfigError::InvalidTokenValidity {
            value,
            max: MAX_TOKEN_VALIDITY_SECS,
        };
        if !(1..=MAX_TOKEN_VALIDITY_SECS).contains(&value) {
            return Err(invalid());
        }
        chrono::TimeDelta::try_seconds(value).ok_or_else(invalid)
    }
}

/// `[http]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl HttpSection {
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..HttpClientConfig::default()
        }
    }
}

/// `[probe]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub count: u16,
    pub timeout_ms: u64,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            count: 3,
            timeout_ms: 1000,
        }
    }
}

impl ProbeSection {
    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            count: self.count.max(1),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// `[transmission]`
#[derive(Debug, Clone, Deserialize)]
pub struct TransmissionSection {
    /// Base URL, e.g. `http://localhost:9091`
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// `[rtorrent]`
#[derive(Debug, Clone, Deserialize)]
pub struct RtorrentSection {
    /// Base URL of the XML-RPC mount, without `/RPC2`
    pub url: String,
}

/// `[networkd]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkdSection {
    pub dir: PathBuf,
    pub netdev: FileSection,
    pub network: FileSection,
}

impl Default for NetworkdSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/etc/systemd/network"),
            netdev: FileSection::default(),
            network: FileSection::default(),
        }
    }
}

/// `[networkd.netdev]` / `[networkd.network]`; unset keys keep the
/// system's choice
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileSection {
    /// minijinja template to render instead of the built-in unit
    pub template: Option<PathBuf>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<String>,
}

impl FileSection {
    pub fn file_spec(&self) -> Result<FileSpec, ConfigError> {
        let mode = match self.mode.as_deref().map(str::trim) {
            None | Some("") => Override::Inherit,
            Some(text) => Override::Set(parse_mode(text)?),
        };
        Ok(FileSpec {
            template: self.template.clone(),
            owner: self.owner.clone().filter(|s| !s.is_empty()).into(),
            group: self.group.clone().filter(|s| !s.is_empty()).into(),
            mode,
        })
    }
}

fn parse_mode(text: &str) -> Result<u32, ConfigError> {
    let digits = text.strip_prefix("0o").unwrap_or(text);
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| ConfigError::InvalidMode(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.region, "ca_toronto");
        assert_eq!(config.interface, "pia");
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/pia"));
        assert_eq!(config.catalog_url, DEFAULT_CATALOG_URL);
        assert_eq!(
            config.token_validity().unwrap(),
            chrono::TimeDelta::minutes(23 * 60 + 55)
        );
        assert!(config.transmission.is_none());
        assert_eq!(config.probe.probe_config(), ProbeConfig::default());
    }

    #[test]
    fn test_full_file() {
        let config = AppConfig::from_toml(
            r#"
            username = "p1234567"
            password = "hunter2"
            region = "auto"
            interface = "wg_pia"
            wg_binary = "/usr/bin/wg"
            token_validity_secs = 86000

            [http]
            timeout_secs = 5

            [transmission]
            url = "http://localhost:9091"
            username = "admin"

            [rtorrent]
            url = "http://localhost:8080"

            [networkd]
            dir = "/run/systemd/network"

            [networkd.netdev]
            template = "/etc/pia/netdev.j2"
            owner = "root"
            group = "systemd-network"
            mode = "0640"
            "#,
        )
        .unwrap();

        assert_eq!(config.region, "auto");
        assert_eq!(config.wg_binary, Some(PathBuf::from("/usr/bin/wg")));
        assert_eq!(config.token_validity().unwrap(), chrono::TimeDelta::seconds(86000));
        assert_eq!(config.http.client_config().timeout, Duration::from_secs(5));
        assert_eq!(config.http.connect_timeout_secs, 10);
        assert_eq!(config.transmission.unwrap().username.as_deref(), Some("admin"));
        assert_eq!(config.rtorrent.unwrap().url, "http://localhost:8080");

        let netdev = config.networkd.netdev.file_spec().unwrap();
        assert_eq!(netdev.template, Some(PathBuf::from("/etc/pia/netdev.j2")));
        assert_eq!(netdev.owner, Override::Set("root".to_string()));
        assert_eq!(netdev.mode, Override::Set(0o640));
        assert_eq!(config.networkd.network.file_spec().unwrap(), FileSpec::default());
    }

    #[test]
    fn test_invalid_mode() {
        let section = FileSection {
            mode: Some("rw-r-----".to_string()),
            ..FileSection::default()
        };
        assert!(matches!(section.file_spec(), Err(ConfigError::InvalidMode(_))));
        assert_eq!(parse_mode("0o600").unwrap(), 0o600);
        assert!(parse_mode("99999").is_err());
    }

    #[test]
    fn test_token_validity_bounds() {
        for value in [0, -60, 86400, i64::MAX, i64::MIN] {
            let config = AppConfig {
                token_validity_secs: value,
                ..AppConfig::default()
            };
            assert!(
                matches!(
                    config.token_validity(),
                    Err(ConfigError::InvalidTokenValidity { .. })
                ),
                "{value} was accepted"
            );
        }

        let config = AppConfig::from_toml("token_validity_secs = 9223372036854775807").unwrap();
        assert!(config.token_validity().is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pia.toml");

        assert!(AppConfig::load(&path, false).is_ok());
        assert!(matches!(
            AppConfig::load(&path, true),
            Err(ConfigError::Io { .. })
        ));

        std::fs::write(&path, "region = [").unwrap();
        assert!(matches!(
            AppConfig::load(&path, false),
            Err(ConfigError::Parse { .. })
        ));
    }
}
