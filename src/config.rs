use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path, time::Duration};

#[derive(Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub targets: HashMap<String, TargetConfig>,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

#[derive(Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    pub allowed_proxy_ips: Option<Vec<String>>,
    pub tls: Option<TlsConfig>,
}

#[derive(Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// Origin an upgraded request is tunnelled to.
#[derive(Clone, Debug, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
}

impl TargetConfig {
    /// `host:port`, as used to open the origin connection.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for the outbound `Host` header; the default port is omitted.
    #[must_use]
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            self.authority()
        }
    }
}

/// Per-tunnel behaviour consumed by the header translator and the relay.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Close both directions when no bytes flow for this many milliseconds.
    pub idle_timeout_ms: Option<u64>,
    /// Tear the pair down as soon as either direction stops, instead of
    /// letting the surviving direction drain.
    pub abort_on_error: bool,
    /// Pseudonym announced in an appended `Via` header.
    pub via: Option<String>,
    /// Append the client address to `X-Forwarded-For`.
    pub forwarded_for: bool,
    /// Forward the client's `Host` header instead of the origin authority.
    pub preserve_host: bool,
}

impl TunnelConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}
