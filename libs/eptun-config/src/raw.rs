//! The as-parsed, untyped shape of the configuration file.
//!
//! Field names are all-lowercase because [`lowercase_keys`] normalizes
//! every object key before this struct is deserialized from it — that's
//! how "case-insensitive property names" is realized concretely.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawConfig {
    pub proxy: Option<RawProxy>,
    pub tun2socks: Option<RawTun2Socks>,
    pub vpn: Option<RawVpn>,
    pub v2raya: Option<RawV2raya>,
    pub logging: Option<RawLogging>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawProxy {
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawTun2Socks {
    #[serde(rename = "executablepath")]
    pub executable_path: Option<String>,
    #[serde(rename = "wintundllpath")]
    pub wintun_dll_path: Option<String>,
    #[serde(rename = "argumentstemplate")]
    pub arguments_template: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawVpn {
    #[serde(rename = "interfacename")]
    pub interface_name: Option<String>,
    #[serde(rename = "tunaddress")]
    pub tun_address: Option<String>,
    #[serde(rename = "tungateway")]
    pub tun_gateway: Option<String>,
    #[serde(rename = "tunmask")]
    pub tun_mask: Option<String>,
    #[serde(rename = "dnsservers")]
    pub dns_servers: Vec<String>,
    #[serde(rename = "includecidrs")]
    pub include_cidrs: Vec<String>,
    #[serde(rename = "excludecidrs")]
    pub exclude_cidrs: Vec<String>,
    #[serde(rename = "cndatpath")]
    pub cn_dat_path: Option<String>,
    #[serde(rename = "apnicfallbackpath")]
    pub apnic_fallback_path: Option<String>,
    #[serde(rename = "bypasscn")]
    pub bypass_cn: Option<bool>,
    #[serde(rename = "routemetric")]
    pub route_metric: Option<u32>,
    #[serde(rename = "startupdelayms")]
    pub startup_delay_ms: Option<u64>,
    #[serde(rename = "defaultgatewayoverride")]
    pub default_gateway_override: Option<String>,
    #[serde(rename = "addbypassrouteforproxyhost")]
    pub add_bypass_route_for_proxy_host: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawV2raya {
    pub enabled: Option<bool>,
    #[serde(rename = "baseurl")]
    pub base_url: Option<String>,
    pub authorization: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(rename = "requestid")]
    pub request_id: Option<String>,
    #[serde(rename = "timeoutms")]
    pub timeout_ms: Option<u64>,
    #[serde(rename = "resolvehostnames")]
    pub resolve_hostnames: Option<bool>,
    #[serde(rename = "autodetectproxyport")]
    pub auto_detect_proxy_port: Option<bool>,
    #[serde(rename = "preferpacport")]
    pub prefer_pac_port: Option<bool>,
    #[serde(rename = "proxyhostoverride")]
    pub proxy_host_override: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawLogging {
    #[serde(rename = "windowlevel")]
    pub window_level: Option<String>,
    #[serde(rename = "filelevel")]
    pub file_level: Option<String>,
}

/// Recursively lowercases every object key in a parsed JSON value.
pub fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.to_ascii_lowercase(), lowercase_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lowercases_nested_keys() {
        let v = json!({"Vpn": {"InterfaceName": "EpTUN", "DnsServers": ["1.1.1.1"]}});
        let lowered = lowercase_keys(v);
        assert_eq!(lowered["vpn"]["interfacename"], json!("EpTUN"));
        assert_eq!(lowered["vpn"]["dnsservers"][0], json!("1.1.1.1"));
    }
}
