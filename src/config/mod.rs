//! Configuration
//!
//! TOML configuration with `${VAR:-default}` substitution and
//! `EMBERMQ__`-prefixed environment overrides. The CLI in `main` layers its
//! flags on top of the loaded file.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::acl::AclConfig;
use crate::broker::{BrokerConfig, TlsConfig};


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static regex");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Worker pool size; 0 falls back to the default of 1024
    pub workers: usize,
    /// Plain TCP listener host
    pub host: String,
    /// Plain TCP listener port
    pub port: u16,
    /// TLS listener host
    pub tls_host: String,
    /// TLS listener port; unset disables the TLS listener
    pub tls_port: Option<u16>,
    /// TLS certificate configuration, required with `tls_port`
    pub tls: Option<TlsFileConfig>,
    /// WebSocket listener port; unset disables the WebSocket listener
    pub ws_port: Option<u16>,
    /// WebSocket upgrade path
    pub ws_path: String,
    /// Serve WebSocket over TLS
    pub ws_tls: bool,
    /// Cluster discovery endpoint, consumed by the external cluster client
    pub router: Option<String>,
    /// Verbose logging
    pub debug: bool,
    /// Topic access control rules
    pub acl: AclConfig,
    /// External integrations
    pub plugins: PluginsConfig,
}

/// TLS certificate file configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsFileConfig {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: Option<String>,
    /// Require and verify client certificates
    pub verify: bool,
}

/// Plugin selection
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PluginsConfig {
    /// Authentication plugin name (loaded externally)
    pub auth: Option<String>,
    /// Bridge sink name
    pub bridge: Option<String>,
}

const DEFAULT_WORKERS: usize = 1024;

impl Config {
    /// Load configuration from a TOML file with environment overrides.
    ///
    /// Environment usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` in the TOML
    /// 2. Override via env vars with the `EMBERMQ__` prefix and double
    ///    underscores for nesting, e.g. `EMBERMQ__PORT=1884` or
    ///    `EMBERMQ__TLS__CERT_FILE=/etc/broker/cert.pem`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("workers", DEFAULT_WORKERS as u64)?
            .set_default("host", "0.0.0.0")?
            .set_default("port", 1883)?
            .set_default("tls_host", "0.0.0.0")?
            .set_default("ws_path", "/mqtt")?
            .set_default("ws_tls", false)?
            .set_default("debug", false)?
            .set_default("acl.enabled", false)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No file: defaults plus environment
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("EMBERMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (no environment support).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.fill_defaults();
        config.validate()?;
        Ok(config)
    }

    /// `Default::default` leaves strings empty; fill in the documented
    /// defaults so `parse` and struct literals behave like `load`.
    fn fill_defaults(&mut self) {
        if self.host.is_empty() {
            self.host = "0.0.0.0".to_string();
        }
        if self.port == 0 {
            self.port = 1883;
        }
        if self.tls_host.is_empty() {
            self.tls_host = "0.0.0.0".to_string();
        }
        if self.ws_path.is_empty() {
            self.ws_path = "/mqtt".to_string();
        }
    }

    /// Worker pool size with the zero fallback applied.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            DEFAULT_WORKERS
        } else {
            self.workers
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(tls_port) = self.tls_port {
            let Some(ref tls) = self.tls else {
                return Err(ConfigError::Validation(
                    "tls_port requires a [tls] section".to_string(),
                ));
            };
            if tls.cert_file.is_empty() || tls.key_file.is_empty() {
                return Err(ConfigError::Validation(
                    "tls config error, no cert or key file".to_string(),
                ));
            }
            if tls_port == 0 {
                return Err(ConfigError::Validation(
                    "tls_port cannot be 0".to_string(),
                ));
            }
        }

        if self.ws_tls {
            if self.ws_port.is_none() {
                return Err(ConfigError::Validation(
                    "ws_tls requires ws_port".to_string(),
                ));
            }
            if self.tls.is_none() {
                return Err(ConfigError::Validation(
                    "ws_tls requires a [tls] section".to_string(),
                ));
            }
        }

        for rule in &self.acl.rules {
            if rule.topics.is_empty() {
                return Err(ConfigError::Validation(
                    "acl rule without topic patterns".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Assemble the broker's runtime configuration.
    pub fn broker_config(&self) -> Result<BrokerConfig, ConfigError> {
        let bind_addr = self.listen_addr(&self.host, self.port)?;

        let tls_bind_addr = self
            .tls_port
            .map(|port| self.listen_addr(&self.tls_host, port))
            .transpose()?;

        let ws_bind_addr = self
            .ws_port
            .map(|port| self.listen_addr(&self.host, port))
            .transpose()?;

        Ok(BrokerConfig {
            bind_addr,
            tls_bind_addr,
            tls: self.tls.as_ref().map(|tls| TlsConfig {
                cert_file: tls.cert_file.clone(),
                key_file: tls.key_file.clone(),
                ca_file: tls.ca_file.clone(),
                verify: tls.verify,
            }),
            ws_bind_addr,
            ws_path: self.ws_path.clone(),
            ws_tls: self.ws_tls,
            workers: self.worker_count(),
            connect_timeout: Duration::from_secs(30),
            ..BrokerConfig::default()
        })
    }

    fn listen_addr(&self, host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", host, port).parse().map_err(|_| {
            ConfigError::Validation(format!("invalid listen address {}:{}", host, port))
        })
    }
}
