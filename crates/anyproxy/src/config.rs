//! Proxy configuration: TOML file + CLI overrides, and the policy that
//! turns the resulting flags into a resolver and rewrite chain.

use anyhow::Context as _;
use anyproxy_core::{
    chain, FixedResolver, PortMap, PortMatch, PortTarget, ProxyError, ProxyResult, Redirect,
    SharedResolver, SharedRewriter,
};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub echo: EchoSection,
}

/// `[proxy]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub target: String,
    #[serde(default = "default_target_port")]
    pub target_port: String,
    #[serde(default = "default_idle_grace")]
    pub idle_grace: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            target: String::new(),
            target_port: default_target_port(),
            idle_grace: default_idle_grace(),
            connect_timeout: default_connect_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// `[echo]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct EchoSection {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
}

impl Default for EchoSection {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_target_port() -> String {
    "0".to_string()
}
fn default_idle_grace() -> u64 {
    3
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_http_port() -> u16 {
    8080
}
fn default_https_port() -> u16 {
    8443
}

/// Values given on the command line; `None` falls back to the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    pub target: Option<String>,
    pub target_port: Option<String>,
    pub idle_grace: Option<u64>,
    pub connect_timeout: Option<u64>,
    pub shutdown_timeout: Option<u64>,
}

/// Resolved configuration (file + CLI overrides applied).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen: String,
    /// SOCKS5 port; `0` disables the proxy.
    pub port: u16,
    /// `0` disables the HTTP responder.
    pub http_port: u16,
    /// `0` disables the HTTPS responder.
    pub https_port: u16,
    /// Redirect target. Empty means the built-in echo responders.
    pub target: String,
    /// Redirect port. `0` keeps the requested port.
    pub target_port: String,
    pub idle_grace: Duration,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl AppConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: Overrides) -> anyhow::Result<Self> {
        let file_config = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read {}", path.display()))?;
                toml::from_str::<ConfigFile>(&content)
                    .with_context(|| format!("config parse error in {}", path.display()))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        let proxy = file_config.proxy;
        let echo = file_config.echo;
        Ok(Self {
            listen: cli.listen.unwrap_or(proxy.listen),
            port: cli.port.unwrap_or(proxy.port),
            http_port: cli.http_port.unwrap_or(echo.http_port),
            https_port: cli.https_port.unwrap_or(echo.https_port),
            target: cli.target.unwrap_or(proxy.target),
            target_port: cli.target_port.unwrap_or(proxy.target_port),
            idle_grace: Duration::from_secs(cli.idle_grace.unwrap_or(proxy.idle_grace)),
            connect_timeout: Duration::from_secs(cli.connect_timeout.unwrap_or(proxy.connect_timeout)),
            shutdown_timeout: Duration::from_secs(cli.shutdown_timeout.unwrap_or(proxy.shutdown_timeout)),
        })
    }

    pub fn socks_addr(&self) -> String {
        join_host_port(&self.listen, self.port)
    }

    pub fn http_addr(&self) -> String {
        join_host_port(&self.listen, self.http_port)
    }

    pub fn https_addr(&self) -> String {
        join_host_port(&self.listen, self.https_port)
    }

    /// Assemble the resolver and rewrite chain.
    ///
    /// - an empty target sends everything to the listen host (loopback when
    ///   listening on all interfaces), and with `target_port = 0` maps
    ///   80/443 onto the echo responders;
    /// - an unspecified target (`0.0.0.0` / `::`) keeps the requested host;
    /// - otherwise every request is redirected to `target:target_port`.
    pub fn pipeline(&self) -> ProxyResult<(SharedResolver, SharedRewriter)> {
        if self.target_port.trim().is_empty() {
            return Err(ProxyError::RewriteConfig("invalid target-port <empty>".into()));
        }
        let port: PortTarget = self.target_port.parse()?;

        let mut stages: Vec<SharedRewriter> = Vec::with_capacity(3);
        let (ip, keep_host) = if self.target.is_empty() {
            if port == PortTarget::Preserve {
                stages.push(Arc::new(PortMap::new(PortMatch::Port(80), self.http_port.into())));
                stages.push(Arc::new(PortMap::new(PortMatch::Port(443), self.https_port.into())));
            }
            (reachable(parse_ip(&self.listen)?), false)
        } else {
            let ip = parse_ip(&self.target)?;
            (ip, ip.is_unspecified())
        };

        if keep_host {
            stages.push(Arc::new(PortMap::new(PortMatch::Any, port)));
        } else {
            stages.push(Arc::new(Redirect::new(ip, port)));
        }

        Ok((Arc::new(FixedResolver::new(ip)), chain(stages)))
    }
}

fn parse_ip(target: &str) -> ProxyResult<IpAddr> {
    target
        .parse()
        .map_err(|_| ProxyError::RewriteConfig(format!("target address {target:?} is not an IP")))
}

/// A dialable address for a listener bound to `ip`.
fn reachable(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
