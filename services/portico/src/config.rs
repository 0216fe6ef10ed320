//! Configuration.
//!
//! Two layers:
//! - [`Settings`]: process-level settings from the environment (home
//!   directory, config path, control API overrides, log format)
//! - [`Config`]: the YAML config file, parsed into raw serde structs and
//!   validated into a typed snapshot that the hub applies

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use portico_events::LogLevel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inbound::{InboundSpec, InboundType, Ports, WILDCARD_HOST};
use crate::listener::Network;
use crate::manager::TunnelSpec;
use crate::rules::Rule;

/// Config file name inside the home directory.
pub const CONFIG_FILE: &str = "config.yaml";

/// Written on first start when no config file exists.
pub const DEFAULT_CONFIG: &str = "mixed-port: 7890\n";

const DEFAULT_DNS_PORT: u16 = 53;
const DEFAULT_DNS_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration file {0} is empty")]
    Empty(PathBuf),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Log output format for the console layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub home_dir: PathBuf,
    pub config_path: PathBuf,
    pub external_controller: Option<String>,
    pub secret: Option<String>,
    pub log_format: LogFormat,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let home_dir = match std::env::var("PORTICO_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_home_dir()?,
        };

        let config_path = std::env::var("PORTICO_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir.join(CONFIG_FILE));

        let external_controller = std::env::var("PORTICO_EXTERNAL_CONTROLLER").ok();
        let secret = std::env::var("PORTICO_SECRET").ok();

        let log_format = match std::env::var("PORTICO_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            home_dir,
            config_path,
            external_controller,
            secret,
            log_format,
        })
    }
}

fn default_home_dir() -> anyhow::Result<PathBuf> {
    ProjectDirs::from("dev", "portico", "portico")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))
}

/// Proxy mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Rule,
    Global,
    Direct,
}

/// General settings, including the legacy single-port fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct General {
    #[serde(flatten)]
    pub ports: Ports,
    pub allow_lan: bool,
    pub bind_address: String,
    pub mode: Mode,
    pub log_level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_controller: Option<String>,
    #[serde(skip)]
    pub secret: String,
}

impl Default for General {
    fn default() -> Self {
        Self {
            ports: Ports::default(),
            allow_lan: false,
            bind_address: WILDCARD_HOST.to_string(),
            mode: Mode::default(),
            log_level: LogLevel::default(),
            external_controller: None,
            secret: String::new(),
        }
    }
}

/// Resolver settings. Disabled means no resolver is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsConfig {
    pub enable: bool,
    pub nameservers: Vec<SocketAddr>,
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            nameservers: Vec::new(),
            timeout: Duration::from_millis(DEFAULT_DNS_TIMEOUT_MS),
        }
    }
}

/// Validated configuration snapshot.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub general: General,
    pub inbounds: Vec<InboundSpec>,
    pub tunnels: Vec<TunnelSpec>,
    pub rules: Vec<Rule>,
    pub dns: DnsConfig,
}

impl Config {
    /// Read and validate the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if data.is_empty() {
            return Err(ConfigError::Empty(path.to_path_buf()));
        }
        Self::parse(&data)
    }

    /// Parse and validate YAML text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)?;
        raw.try_into()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct RawConfig {
    #[serde(flatten)]
    ports: Ports,
    allow_lan: bool,
    bind_address: String,
    mode: Mode,
    log_level: String,
    external_controller: Option<String>,
    secret: String,
    inbounds: Vec<RawInbound>,
    tunnels: Vec<RawTunnel>,
    rules: Vec<String>,
    dns: RawDns,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            ports: Ports::default(),
            allow_lan: false,
            bind_address: WILDCARD_HOST.to_string(),
            mode: Mode::default(),
            log_level: LogLevel::default().to_string(),
            external_controller: None,
            secret: String::new(),
            inbounds: Vec::new(),
            tunnels: Vec::new(),
            rules: Vec::new(),
            dns: RawDns::default(),
        }
    }
}

/// `socks://127.0.0.1:1080` or `{ type: socks, bind-address: ... }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInbound {
    Url(String),
    #[serde(rename_all = "kebab-case")]
    Table {
        #[serde(rename = "type")]
        inbound_type: String,
        bind_address: String,
    },
}

/// `tcp/udp,addr,target,proxy` or a table.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTunnel {
    Line(String),
    Table {
        network: Vec<String>,
        address: String,
        target: String,
        proxy: String,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct RawDns {
    enable: bool,
    nameserver: Vec<String>,
    timeout_ms: Option<u64>,
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let log_level: LogLevel = raw
            .log_level
            .parse()
            .map_err(|e| ConfigError::invalid(format!("log-level: {e}")))?;

        let general = General {
            ports: raw.ports,
            allow_lan: raw.allow_lan,
            bind_address: raw.bind_address,
            mode: raw.mode,
            log_level,
            external_controller: raw.external_controller.filter(|s| !s.is_empty()),
            secret: raw.secret,
        };

        let inbounds = raw
            .inbounds
            .into_iter()
            .map(parse_inbound)
            .collect::<Result<Vec<_>, _>>()?;

        let tunnels = raw
            .tunnels
            .into_iter()
            .map(parse_tunnel)
            .collect::<Result<Vec<_>, _>>()?;

        let rules = raw
            .rules
            .iter()
            .map(|line| Rule::from_str(line).map_err(|e| ConfigError::invalid(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        let dns = parse_dns(raw.dns)?;

        Ok(Self {
            general,
            inbounds,
            tunnels,
            rules,
            dns,
        })
    }
}

fn parse_inbound(raw: RawInbound) -> Result<InboundSpec, ConfigError> {
    let (scheme, address) = match &raw {
        RawInbound::Url(url) => url
            .split_once("://")
            .ok_or_else(|| ConfigError::invalid(format!("inbound `{url}` is not of the form type://address")))?,
        RawInbound::Table {
            inbound_type,
            bind_address,
        } => (inbound_type.as_str(), bind_address.as_str()),
    };
    let inbound_type: InboundType = scheme
        .parse()
        .map_err(|e| ConfigError::invalid(format!("inbound: {e}")))?;
    Ok(InboundSpec::new(inbound_type, address))
}

fn parse_tunnel(raw: RawTunnel) -> Result<TunnelSpec, ConfigError> {
    let (networks, address, target, proxy) = match raw {
        RawTunnel::Line(line) => {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [networks, address, target, proxy] = fields.as_slice() else {
                return Err(ConfigError::invalid(format!("tunnel `{line}` needs network,address,target,proxy")));
            };
            (
                networks.split('/').map(str::to_string).collect::<Vec<_>>(),
                address.to_string(),
                target.to_string(),
                proxy.to_string(),
            )
        }
        RawTunnel::Table {
            network,
            address,
            target,
            proxy,
        } => (network, address, target, proxy),
    };

    let networks = networks
        .iter()
        .map(|n| Network::from_str(n).map_err(|_| ConfigError::invalid(format!("tunnel network `{n}`"))))
        .collect::<Result<Vec<_>, _>>()?;
    if networks.is_empty() {
        return Err(ConfigError::invalid(format!("tunnel {address} has no network")));
    }
    if address.is_empty() || target.is_empty() || proxy.is_empty() {
        return Err(ConfigError::invalid("tunnel fields must not be empty"));
    }

    Ok(TunnelSpec {
        networks,
        address,
        target,
        proxy,
    })
}

fn parse_dns(raw: RawDns) -> Result<DnsConfig, ConfigError> {
    let nameservers = raw
        .nameserver
        .iter()
        .map(|s| parse_nameserver(s))
        .collect::<Result<Vec<_>, _>>()?;
    if raw.enable && nameservers.is_empty() {
        return Err(ConfigError::invalid("dns is enabled but no nameserver is set"));
    }
    Ok(DnsConfig {
        enable: raw.enable,
        nameservers,
        timeout: Duration::from_millis(raw.timeout_ms.unwrap_or(DEFAULT_DNS_TIMEOUT_MS)),
    })
}

/// `8.8.8.8`, `8.8.8.8:53`, `udp://8.8.8.8[:53]` or a bracketed IPv6 form.
fn parse_nameserver(s: &str) -> Result<SocketAddr, ConfigError> {
    let addr = s.strip_prefix("udp://").unwrap_or(s);
    if addr.contains("://") {
        return Err(ConfigError::invalid(format!("nameserver `{s}`: only plain UDP is supported")));
    }
    if let Ok(ip) = IpAddr::from_str(addr) {
        return Ok(SocketAddr::new(ip, DEFAULT_DNS_PORT));
    }
    SocketAddr::from_str(addr).map_err(|_| ConfigError::invalid(format!("nameserver `{s}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const FULL: &str = r#"
port: 7890
socks-port: 7891
allow-lan: true
bind-address: "192.168.1.2"
mode: global
log-level: debug
external-controller: 127.0.0.1:9090
secret: hunter2
inbounds:
  - socks://127.0.0.1:1080
  - type: http
    bind-address: ":8080"
tunnels:
  - tcp/udp,127.0.0.1:6553,114.114.114.114:53,DIRECT
  - network: [tcp]
    address: 127.0.0.1:7777
    target: example.com:443
    proxy: proxyA
rules:
  - DOMAIN-SUFFIX,google.com,DIRECT
  - MATCH,DIRECT
dns:
  enable: true
  nameserver:
    - 1.1.1.1
    - udp://8.8.8.8:5353
  timeout-ms: 800
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(FULL).unwrap();

        assert_eq!(config.general.ports.port, 7890);
        assert_eq!(config.general.ports.socks_port, 7891);
        assert!(config.general.allow_lan);
        assert_eq!(config.general.bind_address, "192.168.1.2");
        assert_eq!(config.general.mode, Mode::Global);
        assert_eq!(config.general.log_level, LogLevel::Debug);
        assert_eq!(config.general.external_controller.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(config.general.secret, "hunter2");

        assert_eq!(
            config.inbounds,
            vec![
                InboundSpec::new(InboundType::Socks, "127.0.0.1:1080"),
                InboundSpec::new(InboundType::Http, ":8080"),
            ]
        );

        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.tunnels[0].networks, vec![Network::Tcp, Network::Udp]);
        assert_eq!(config.tunnels[0].target, "114.114.114.114:53");
        assert_eq!(config.tunnels[1].proxy, "proxyA");

        assert_eq!(config.rules.len(), 2);

        assert!(config.dns.enable);
        assert_eq!(
            config.dns.nameservers,
            vec!["1.1.1.1:53".parse().unwrap(), "8.8.8.8:5353".parse().unwrap()]
        );
        assert_eq!(config.dns.timeout, Duration::from_millis(800));
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.general.ports.mixed_port, 7890);
        assert_eq!(config.general.bind_address, WILDCARD_HOST);
        assert!(!config.general.allow_lan);
        assert_eq!(config.general.log_level, LogLevel::Info);
        assert!(config.general.external_controller.is_none());
        assert!(!config.dns.enable);
    }

    #[rstest]
    #[case("inbounds: [\"tun://:1\"]")]
    #[case("inbounds: [\":1080\"]")]
    #[case("tunnels: [\"tcp,:1,example.com:1\"]")]
    #[case("tunnels: [\"sctp,:1,example.com:1,DIRECT\"]")]
    #[case("rules: [\"FOO,bar,DIRECT\"]")]
    #[case("log-level: loud")]
    #[case("dns: { enable: true }")]
    #[case("dns: { nameserver: [\"tls://1.1.1.1\"] }")]
    fn test_invalid_config(#[case] text: &str) {
        assert!(matches!(Config::parse(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_general_wire_shape() {
        let config = Config::parse(FULL).unwrap();
        let json = serde_json::to_value(&config.general).unwrap();
        assert_eq!(json["port"], 7890);
        assert_eq!(json["mixed-port"], 0);
        assert_eq!(json["allow-lan"], true);
        assert_eq!(json["log-level"], "debug");
        assert!(json.get("secret").is_none());
    }

    #[test]
    fn test_load_rejects_empty_file() {
        let dir = std::env::temp_dir().join(format!("portico-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, "").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Empty(_))));
        assert!(matches!(Config::load(&dir.join("missing.yaml")), Err(ConfigError::Read { .. })));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
