//! Configuration parsing and management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Destination allow/deny lists
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Transaction capture settings
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Proxy-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address to bind the proxy server
    pub bind_address: String,

    /// Path to the CA certificate used to mint client-facing certificates
    pub ca_cert: Option<String>,

    /// Path to the CA private key
    pub ca_key: Option<String>,

    /// Host patterns the CA identity covers; empty covers every host
    pub intercept_hosts: Vec<String>,

    /// Username for Proxy-Authorization (Basic)
    pub auth_username: Option<String>,

    /// Password for Proxy-Authorization; `${VAR}` reads the environment
    pub auth_password: Option<String>,

    pub connect_timeout_ms: u64,

    pub idle_timeout_ms: u64,

    /// Size of each pooled relay buffer
    pub buffer_size: usize,

    /// How upstream server certificates are verified
    pub upstream_tls: UpstreamTrust,

    /// Path to a PEM CA to trust for upstream TLS instead of `upstream_tls`
    pub upstream_tls_ca: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            ca_cert: None,
            ca_key: None,
            intercept_hosts: Vec::new(),
            auth_username: None,
            auth_password: None,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 120_000,
            buffer_size: 16 * 1024,
            upstream_tls: UpstreamTrust::TrustAll,
            upstream_tls_ca: None,
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Upstream certificate verification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamTrust {
    /// Accept any upstream certificate; destinations are vetted by policy instead
    TrustAll,
    /// Verify against the bundled Mozilla root store
    Webpki,
}

/// Destination policy lists, entries are `host:port`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Transaction capture configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Parse tunnelled HTTP and dispatch transactions to observers
    pub enabled: bool,

    /// Register the built-in observer that logs each captured transaction
    pub log_transactions: bool,

    /// Path patterns the logging observer is interested in; empty means all
    pub log_paths: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_transactions: false,
            log_paths: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,

    /// Whether to log each CONNECT decision at info level
    pub log_connects: bool,

    /// Path to a JSONL audit log of CONNECT decisions
    pub audit_log: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_connects: true,
            audit_log: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        let proxy = &self.proxy;

        if proxy.ca_cert.is_some() != proxy.ca_key.is_some() {
            return Err(Error::config(
                "`ca_cert` and `ca_key` must be set together",
            ));
        }
        if proxy.auth_username.is_some() != proxy.auth_password.is_some() {
            return Err(Error::config(
                "`auth_username` and `auth_password` must be set together",
            ));
        }
        if proxy.buffer_size < 512 {
            return Err(Error::config(format!(
                "`buffer_size` must be at least 512, got {}",
                proxy.buffer_size
            )));
        }
        if proxy.connect_timeout_ms == 0 || proxy.idle_timeout_ms == 0 {
            return Err(Error::config("timeouts must be greater than zero"));
        }

        for (list, entries) in [("allow", &self.policy.allow), ("deny", &self.policy.deny)] {
            for entry in entries {
                validate_destination(entry).map_err(|msg| {
                    Error::config(format!("policy.{} entry {:?}: {}", list, entry, msg))
                })?;
            }
        }

        Ok(())
    }

    /// Resolve the proxy credentials, expanding `${VAR}` in the password
    pub fn resolved_auth(&self) -> Result<Option<(String, String)>> {
        match (&self.proxy.auth_username, &self.proxy.auth_password) {
            (Some(user), Some(pass)) => {
                Ok(Some((user.clone(), resolve_credential_value(pass)?)))
            }
            _ => Ok(None),
        }
    }

    /// Create a minimal configuration bound to the given address
    pub fn minimal(bind_address: String) -> Self {
        let mut config = Self::default();
        config.proxy.bind_address = bind_address;
        config
    }
}

/// Expand a `${VAR}` reference from the environment; other values pass through
pub fn resolve_credential_value(value: &str) -> Result<String> {
    match value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        Some(var) => std::env::var(var).map_err(|_| {
            Error::config(format!("environment variable {} is not set", var))
        }),
        None => Ok(value.to_string()),
    }
}

fn validate_destination(entry: &str) -> std::result::Result<(), &'static str> {
    let (host, port) = entry
        .rsplit_once(':')
        .ok_or("expected host:port")?;
    if host.is_empty() {
        return Err("host is empty");
    }
    port.parse::<u16>().map_err(|_| "port is not a number")?;
    Ok(())
}
