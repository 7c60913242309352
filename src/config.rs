use crate::auth::CredentialTable;
use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};
use http::Uri;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Authenticated forward proxy behind a decoy website",
    long_about = "decoy-proxy serves an ordinary reverse proxy to a decoy upstream.\n\nClients presenting a valid Proxy-Authorization credential get a full\nHTTP forward proxy with CONNECT tunneling instead.\n\nA GET to any path ending with auth_trigger_path answers 200 for a valid\ncredential and 407 otherwise.\n"
)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config-file", default_value = "./config.yaml")]
    pub config_file: PathBuf,

    /// Override the listen address from the configuration file
    #[arg(short = 'l', long = "listen-addr", value_name = "HOST:PORT")]
    pub listen_addr: Option<String>,
}

/// TLS certificate settings (PEM files)
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// On-disk layout of the configuration file
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    upstream_addr: String,
    listen_addr: String,
    auth_trigger_path: String,
    #[serde(default)]
    auth: HashMap<String, String>,
    #[serde(default)]
    auth_realm: Option<String>,
    #[serde(default)]
    proxy_protocol: Option<bool>,
    #[serde(default)]
    tls: Option<TlsSettings>,
}

/// Proxy server configuration, read-only once loaded
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Decoy upstream every unauthenticated request is forwarded to
    pub upstream_addr: Uri,
    /// `host:port` to bind; hostnames are resolved at bind time
    pub listen_addr: String,
    /// Path suffix that turns a GET into an authentication probe
    pub auth_trigger_path: String,
    pub auth: CredentialTable,
    pub auth_realm: String,
    /// Accept an optional PROXY protocol header in front of each connection
    pub proxy_protocol: bool,
    pub tls: Option<TlsSettings>,
}

impl ProxyConfig {
    pub const DEFAULT_REALM: &'static str = "proxy";

    /// Load and validate the configuration named on the command line
    pub fn from_cli(args: &Cli) -> Result<Self> {
        let mut config = Self::load(&args.config_file)?;
        if let Some(listen) = args.listen_addr.as_deref() {
            config.listen_addr = parse_listen_addr(listen)?;
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw)
            .wrap_err_with(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let file: FileConfig = serde_yaml::from_str(raw)?;

        let upstream_addr = parse_upstream_addr(&file.upstream_addr)?;
        let listen_addr = parse_listen_addr(&file.listen_addr)?;

        if file.auth_trigger_path.is_empty() {
            // An empty suffix would turn every GET into a probe
            return Err(eyre!("auth_trigger_path must not be empty"));
        }

        if file.auth.keys().any(|identity| identity.contains(':')) {
            return Err(eyre!("auth identities must not contain ':'"));
        }

        let auth_realm = file
            .auth_realm
            .unwrap_or_else(|| Self::DEFAULT_REALM.to_string());
        if auth_realm.contains('"') {
            return Err(eyre!("auth_realm must not contain '\"'"));
        }

        Ok(Self {
            upstream_addr,
            listen_addr,
            auth_trigger_path: file.auth_trigger_path,
            auth: CredentialTable::new(file.auth),
            auth_realm,
            proxy_protocol: file.proxy_protocol.unwrap_or(true),
            tls: file.tls,
        })
    }
}

fn parse_upstream_addr(raw: &str) -> Result<Uri> {
    let uri: Uri = raw
        .parse()
        .map_err(|e| eyre!("Failed to parse upstream_addr {:?}: {}", raw, e))?;

    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return Err(eyre!("upstream_addr must be an http:// or https:// URL, got {:?}", raw)),
    }
    if uri.authority().is_none() {
        return Err(eyre!("upstream_addr has no host: {:?}", raw));
    }
    Ok(uri)
}

/// Check `host:port`, turning `:port` into "all interfaces"
fn parse_listen_addr(raw: &str) -> Result<String> {
    if raw.parse::<SocketAddr>().is_ok() {
        return Ok(raw.to_string());
    }

    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| eyre!("Invalid listen_addr {:?}: expected host:port", raw))?;
    port.parse::<u16>()
        .map_err(|_| eyre!("Invalid listen_addr port in {:?}", raw))?;
    if host.contains(':') {
        return Err(eyre!("Invalid listen_addr {:?}: IPv6 hosts need brackets", raw));
    }

    if host.is_empty() {
        Ok(format!("0.0.0.0:{}", port))
    } else {
        Ok(raw.to_string())
    }
}
