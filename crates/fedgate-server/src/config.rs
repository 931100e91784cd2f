//! Gateway configuration: TOML file + CLI overrides.

use fedgate_core::{FedError, FedResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub tls: TlsSection,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_local_domain")]
    pub local_domain: String,
    #[serde(default = "default_remote_domain")]
    pub remote_domain: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to dial for the outbound leg; defaults to the remote domain.
    #[serde(default)]
    pub connect_host: Option<String>,
    #[serde(default = "default_port")]
    pub connect_port: u16,
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_miss_threshold")]
    pub ping_miss_threshold: u32,
    #[serde(default = "default_true")]
    pub rewrite_domain: bool,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            local_domain: default_local_domain(),
            remote_domain: default_remote_domain(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            connect_host: None,
            connect_port: default_port(),
            socket_timeout_secs: default_socket_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_secs: default_reconnect_delay(),
            ping_interval_secs: default_ping_interval(),
            ping_miss_threshold: default_ping_miss_threshold(),
            rewrite_domain: true,
        }
    }
}

/// `[tls]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub accept_self_signed: bool,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            required: false,
            accept_self_signed: false,
            cert: default_cert_path(),
            key: default_key_path(),
        }
    }
}

fn default_local_domain() -> String {
    "proxy".to_string()
}
fn default_remote_domain() -> String {
    "openfire".to_string()
}
fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5269
}
fn default_socket_timeout() -> u64 {
    30
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_delay() -> u64 {
    1
}
fn default_ping_interval() -> u64 {
    15
}
fn default_ping_miss_threshold() -> u32 {
    4
}
fn default_cert_path() -> String {
    "~/.fedgate/cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.fedgate/key.pem".to_string()
}
fn default_true() -> bool {
    true
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub local_domain: String,
    pub remote_domain: String,
    pub bind_addr: String,
    pub port: u16,
    pub connect_host: String,
    pub connect_port: u16,
    pub socket_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub ping_miss_threshold: u32,
    pub rewrite_domain: bool,
    pub tls_required: bool,
    pub accept_self_signed: bool,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// CLI overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub local_domain: Option<String>,
    pub remote_domain: Option<String>,
    pub port: Option<u16>,
    pub connect_host: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub tls_required: Option<bool>,
}

impl GatewayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> FedResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| FedError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let gw = file_config.gateway;
        let tls = file_config.tls;

        let local_domain = cli.local_domain.unwrap_or(gw.local_domain);
        let remote_domain = cli.remote_domain.unwrap_or(gw.remote_domain);
        let connect_host = cli
            .connect_host
            .or(gw.connect_host)
            .unwrap_or_else(|| remote_domain.clone());
        let cert_str = cli.cert.unwrap_or(tls.cert);
        let key_str = cli.key.unwrap_or(tls.key);

        Ok(Self {
            local_domain,
            remote_domain,
            bind_addr: gw.bind_addr,
            port: cli.port.unwrap_or(gw.port),
            connect_host,
            connect_port: gw.connect_port,
            socket_timeout: Duration::from_secs(gw.socket_timeout_secs),
            reconnect_attempts: gw.reconnect_attempts,
            reconnect_delay: Duration::from_secs(gw.reconnect_delay_secs),
            ping_interval: Duration::from_secs(gw.ping_interval_secs),
            ping_miss_threshold: gw.ping_miss_threshold,
            rewrite_domain: gw.rewrite_domain,
            tls_required: cli.tls_required.unwrap_or(tls.required),
            accept_self_signed: tls.accept_self_signed,
            cert_path: expand_tilde_str(&cert_str),
            key_path: expand_tilde_str(&key_str),
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
