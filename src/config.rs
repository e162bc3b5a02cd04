use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::trace;

/// Default location of the server configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gullveig/server.conf";

#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read
    Io { path: PathBuf, source: std::io::Error },

    /// The file is not valid TOML or does not match the expected shape
    Parse(toml::de::Error),

    /// A value is present but unusable
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse(err) => write!(f, "invalid configuration file: {}", err),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse(err) => Some(err),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    pub mail: Option<MailConfig>,

    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_to")]
    pub bind_to: IpAddr,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    pub ssl_certificate: PathBuf,

    pub ssl_certificate_key: PathBuf,

    /// Shared secret every agent must present in `X-Client-Key`
    pub client_key: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds without a report after which a module is declared in outage
    #[serde(default = "default_service_timeout")]
    pub service_timeout: u64,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_to, self.bind_port)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout)
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// SQLite database file in the data directory
    #[default]
    Sqlite,

    /// In-memory storage (no persistence)
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageKind,

    /// Retention period in days for metric samples
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::default(),
            retention_days: default_retention_days(),
        }
    }
}

/// How the SMTP connection is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SmtpMode {
    /// Implicit TLS (usually port 465)
    #[default]
    Tls,
    /// Plain connection upgraded with STARTTLS (usually port 587)
    Starttls,
    /// Unencrypted, only for local relays
    Plain,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub smtp_host: String,

    pub smtp_port: Option<u16>,

    #[serde(default)]
    pub smtp_mode: SmtpMode,

    pub smtp_username: Option<String>,

    pub smtp_password: Option<String>,

    pub smtp_from: String,

    #[serde(default)]
    pub smtp_to: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
}

fn default_bind_to() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_bind_port() -> u16 {
    8765
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/gullveig")
}

fn default_service_timeout() -> u64 {
    120
}

fn default_retention_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Parse a configuration document
    ///
    /// Relative paths are resolved against `base_dir`.
    pub fn parse(content: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base_dir.join(&*path);
            }
        };

        resolve(&mut self.server.ssl_certificate);
        resolve(&mut self.server.ssl_certificate_key);
        resolve(&mut self.server.data_dir);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.client_key.is_empty() {
            return Err(ConfigError::Invalid(
                "server.client_key must not be empty".to_string(),
            ));
        }

        if self.server.service_timeout == 0 {
            return Err(ConfigError::Invalid(
                "server.service_timeout must be greater than zero".to_string(),
            ));
        }

        if let Some(mail) = &self.mail
            && mail.enabled
            && mail.smtp_to.is_empty()
        {
            return Err(ConfigError::Invalid(
                "mail.smtp_to needs at least one recipient".to_string(),
            ));
        }

        Ok(())
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    Config::parse(&content, base_dir).inspect(|config| trace!("loaded config: {config:?}"))
}
