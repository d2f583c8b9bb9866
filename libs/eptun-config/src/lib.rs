//! Typed, validated configuration surface for the session engine.
//!
//! Parsing tolerates the JSON5 grammar (trailing commas, `//` comments)
//! and case-insensitive property names; [`SessionConfig::load`] is the
//! single entry point a binary should call.

mod raw;

pub use raw::RawConfig;

use eptun_cidr::CidrRoute;
use raw::lowercase_keys;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("failed to interpret parsed config: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Socks5,
    Http,
}

impl ProxyScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyScheme::Socks5 => "socks5",
            ProxyScheme::Http => "http",
        }
    }
}

#[derive(Debug, Clone)]
pub struct V2rayaConfig {
    pub enabled: bool,
    pub base_url: Url,
    pub authorization: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_id: Option<String>,
    pub timeout_ms: u64,
    pub resolve_hostnames: bool,
    pub auto_detect_proxy_port: bool,
    pub prefer_pac_port: bool,
    pub proxy_host_override: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub window_level: String,
    pub file_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            window_level: "INFO".to_string(),
            file_level: "INFO".to_string(),
        }
    }
}

/// The fully validated configuration the session engine consumes.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub proxy_scheme: ProxyScheme,
    pub proxy_host: String,
    pub proxy_port: u16,

    pub executable_path: PathBuf,
    pub wintun_dll_path: Option<PathBuf>,
    pub arguments_template: String,

    pub interface_name: String,
    pub tun_address: Ipv4Addr,
    pub tun_gateway: Ipv4Addr,
    pub tun_mask: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub include_cidrs: Vec<CidrRoute>,
    pub exclude_cidrs: Vec<CidrRoute>,
    pub cn_dat_path: Option<PathBuf>,
    pub apnic_fallback_path: Option<PathBuf>,
    pub bypass_cn: bool,
    pub route_metric: u32,
    pub startup_delay_ms: u64,
    pub default_gateway_override: Option<Ipv4Addr>,
    pub add_bypass_route_for_proxy_host: bool,

    pub v2raya: Option<V2rayaConfig>,
    pub logging: LoggingConfig,
}

impl SessionConfig {
    /// Parses, interprets and validates a configuration document in one
    /// call.
    pub fn load(text: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = json5::from_str(text)?;
        let lowered = lowercase_keys(value);
        let raw: RawConfig = serde_json::from_value(lowered)?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let proxy = raw.proxy.unwrap_or_default();
        let tun2socks = raw.tun2socks.unwrap_or_default();
        let vpn = raw.vpn.unwrap_or_default();

        let proxy_scheme = match proxy.scheme.as_deref().unwrap_or("socks5").to_ascii_lowercase().as_str() {
            "socks5" => ProxyScheme::Socks5,
            "http" => ProxyScheme::Http,
            other => {
                return Err(invalid("proxy.scheme", format!("unsupported scheme {other:?}")))
            }
        };
        let proxy_host = proxy.host.unwrap_or_else(|| "127.0.0.1".to_string());
        let proxy_port = proxy
            .port
            .filter(|p| *p >= 1)
            .ok_or_else(|| invalid("proxy.port", "must be in 1..65535"))?;

        let executable_path = tun2socks
            .executable_path
            .map(PathBuf::from)
            .ok_or_else(|| invalid("tun2socks.executablepath", "must be set"))?;
        let wintun_dll_path = tun2socks.wintun_dll_path.map(PathBuf::from);
        let arguments_template = tun2socks
            .arguments_template
            .unwrap_or_else(|| "-proxy {proxyUri} -device {interfaceName}".to_string());

        let interface_name = vpn.interface_name.unwrap_or_else(|| "EpTUN".to_string());
        let tun_address = parse_v4(&vpn.tun_address, "vpn.tunaddress")?;
        let tun_gateway = parse_v4(&vpn.tun_gateway, "vpn.tungateway")?;
        let tun_mask = parse_v4(&vpn.tun_mask, "vpn.tunmask")?;

        let dns_servers = vpn
            .dns_servers
            .iter()
            .map(|s| {
                s.parse::<Ipv4Addr>()
                    .map_err(|_| invalid("vpn.dnsservers", format!("invalid IPv4 address {s:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let include_cidrs = parse_cidrs(&vpn.include_cidrs, "vpn.includecidrs")?;
        let exclude_cidrs = parse_cidrs(&vpn.exclude_cidrs, "vpn.excludecidrs")?;

        let cn_dat_path = vpn.cn_dat_path.map(PathBuf::from);
        let apnic_fallback_path = vpn.apnic_fallback_path.map(PathBuf::from);
        let bypass_cn = vpn.bypass_cn.unwrap_or(false);
        let route_metric = vpn.route_metric.unwrap_or(50);
        if route_metric < 1 {
            return Err(invalid("vpn.routemetric", "must be >= 1"));
        }
        let startup_delay_ms = vpn.startup_delay_ms.unwrap_or(0);
        let default_gateway_override = vpn
            .default_gateway_override
            .map(|s| {
                s.parse::<Ipv4Addr>()
                    .map_err(|_| invalid("vpn.defaultgatewayoverride", format!("invalid IPv4 address {s:?}")))
            })
            .transpose()?;
        let add_bypass_route_for_proxy_host = vpn.add_bypass_route_for_proxy_host.unwrap_or(true);

        let v2raya = raw.v2raya.map(|r| -> Result<V2rayaConfig, ConfigError> {
            let enabled = r.enabled.unwrap_or(false);
            let base_url_str = r.base_url.unwrap_or_else(|| "http://127.0.0.1:2017/".to_string());
            let mut base_url = Url::parse(&base_url_str)
                .map_err(|_| invalid("v2raya.baseurl", format!("invalid URL {base_url_str:?}")))?;
            if !matches!(base_url.scheme(), "http" | "https") {
                return Err(invalid("v2raya.baseurl", "must be http or https"));
            }
            if !base_url.path().ends_with('/') {
                let path = format!("{}/", base_url.path());
                base_url.set_path(&path);
            }

            let authorization = r.authorization.unwrap_or_default();
            let username = r.username.filter(|s| !s.is_empty());
            let password = r.password.filter(|s| !s.is_empty());
            if enabled && authorization.is_empty() && (username.is_none() || password.is_none()) {
                return Err(invalid(
                    "v2raya",
                    "either authorization or both username and password must be set when enabled",
                ));
            }

            let timeout_ms = r.timeout_ms.unwrap_or(5_000);
            if !(100..=120_000).contains(&timeout_ms) {
                return Err(invalid("v2raya.timeoutms", "must be in 100..120000"));
            }

            Ok(V2rayaConfig {
                enabled,
                base_url,
                authorization,
                username,
                password,
                request_id: r.request_id.filter(|s| !s.is_empty()),
                timeout_ms,
                resolve_hostnames: r.resolve_hostnames.unwrap_or(false),
                auto_detect_proxy_port: r.auto_detect_proxy_port.unwrap_or(true),
                prefer_pac_port: r.prefer_pac_port.unwrap_or(false),
                proxy_host_override: r.proxy_host_override.filter(|s| !s.is_empty()),
            })
        }).transpose()?;

        let logging_raw = raw.logging.unwrap_or_default();
        let logging = LoggingConfig {
            window_level: logging_raw.window_level.unwrap_or_else(|| "INFO".to_string()),
            file_level: logging_raw.file_level.unwrap_or_else(|| "INFO".to_string()),
        };

        Ok(Self {
            proxy_scheme,
            proxy_host,
            proxy_port,
            executable_path,
            wintun_dll_path,
            arguments_template,
            interface_name,
            tun_address,
            tun_gateway,
            tun_mask,
            dns_servers,
            include_cidrs,
            exclude_cidrs,
            cn_dat_path,
            apnic_fallback_path,
            bypass_cn,
            route_metric,
            startup_delay_ms,
            default_gateway_override,
            add_bypass_route_for_proxy_host,
            v2raya,
            logging,
        })
    }
}

fn parse_v4(value: &Option<String>, field: &'static str) -> Result<Ipv4Addr, ConfigError> {
    let s = value.as_deref().ok_or_else(|| invalid(field, "must be set"))?;
    s.parse().map_err(|_| invalid(field, format!("invalid IPv4 address {s:?}")))
}

fn parse_cidrs(values: &[String], field: &'static str) -> Result<Vec<CidrRoute>, ConfigError> {
    values
        .iter()
        .map(|s| CidrRoute::parse(s).map_err(|e| invalid(field, format!("{s:?}: {e}"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "proxy": { "scheme": "socks5", "host": "127.0.0.1", "port": 10808 },
        "tun2Socks": { "executablePath": "tun2socks.exe" },
        "vpn": {
            "interfaceName": "EpTUN",
            "tunAddress": "10.10.0.2",
            "tunGateway": "10.10.0.1",
            "tunMask": "255.255.255.0",
            "dnsServers": ["1.1.1.1"],
            "includeCidrs": ["0.0.0.0/0"],
            "excludeCidrs": ["10.0.0.0/8"],
        },
    }"#;

    #[test]
    fn loads_minimal_config_with_json5_tolerance() {
        let cfg = SessionConfig::load(MINIMAL).unwrap();
        assert_eq!(cfg.proxy_port, 10808);
        assert_eq!(cfg.interface_name, "EpTUN");
        assert_eq!(cfg.include_cidrs.len(), 1);
    }

    #[test]
    fn is_case_insensitive_on_keys() {
        let text = MINIMAL.replace("proxy", "Proxy").replace("scheme", "Scheme");
        let cfg = SessionConfig::load(&text).unwrap();
        assert_eq!(cfg.proxy_port, 10808);
    }

    #[test]
    fn rejects_bad_scheme() {
        let text = MINIMAL.replace("socks5", "ftp");
        let err = SessionConfig::load(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "proxy.scheme", .. }));
    }

    #[test]
    fn rejects_missing_executable_path() {
        let text = MINIMAL.replace(r#""executablePath": "tun2socks.exe""#, "");
        let err = SessionConfig::load(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "tun2socks.executablepath", .. }));
    }

    #[test]
    fn normalizes_base_url_trailing_slash() {
        let with_v2raya = MINIMAL.replacen(
            "\"vpn\":",
            "\"v2raya\": { \"enabled\": true, \"baseUrl\": \"http://127.0.0.1:2017\", \"authorization\": \"Bearer x\" },\n\"vpn\":",
            1,
        );
        let cfg = SessionConfig::load(&with_v2raya).unwrap();
        let v2raya = cfg.v2raya.unwrap();
        assert_eq!(v2raya.base_url.as_str(), "http://127.0.0.1:2017/");
    }

    #[test]
    fn rejects_v2raya_enabled_without_credentials() {
        let with_v2raya = MINIMAL.replacen(
            "\"vpn\":",
            "\"v2raya\": { \"enabled\": true, \"baseUrl\": \"http://127.0.0.1:2017\" },\n\"vpn\":",
            1,
        );
        let err = SessionConfig::load(&with_v2raya).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "v2raya", .. }));
    }
}
