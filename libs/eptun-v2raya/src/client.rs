use crate::error::V2rayaError;
use crate::session_store::{SessionKey, SessionStateStore};
use base64::Engine;
use eptun_cidr::CidrRoute;
use eptun_config::V2rayaConfig;
use rand::RngCore;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, warn};
use url::Url;

pub struct V2rayaClient {
    config: V2rayaConfig,
    store: Arc<SessionStateStore>,
}

impl V2rayaClient {
    pub fn new(config: V2rayaConfig, store: Arc<SessionStateStore>) -> Self {
        Self { config, store }
    }

    fn session_key(&self) -> SessionKey {
        SessionKey::new(
            self.config.base_url.as_str(),
            &self.config.authorization,
            self.config.username.as_deref().unwrap_or(""),
            self.config.password.as_deref().unwrap_or(""),
        )
    }

    fn request_id(&self) -> String {
        if let Some(id) = &self.config.request_id {
            return id.clone();
        }
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn common_headers(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Accept", "application/json, text/plain, */*")
            .header(
                "Accept-Language",
                "zh-CN,zh;q=0.9,en;q=0.8,ja;q=0.7",
            )
            .header("Origin", self.config.base_url.as_str().trim_end_matches('/'))
            .header("Referer", self.config.base_url.as_str())
            .header("User-Agent", "Mozilla/5.0 EpTUN")
            .header("X-V2raya-Request-Id", self.request_id())
    }

    /// Ensures the session is authenticated, reusing a cookie login from
    /// within the last ten minutes when possible.
    async fn ensure_session(&self) -> Result<(), V2rayaError> {
        let entry = self.store.entry(self.session_key());
        let mut state = entry.lock().await;

        if !self.config.authorization.is_empty() && self.config.username.is_none() {
            state.authorization = Some(self.config.authorization.clone());
            return Ok(());
        }

        if state.login_is_fresh() {
            return Ok(());
        }

        let (Some(username), Some(password)) = (&self.config.username, &self.config.password) else {
            // No credentials configured at all; nothing further to do.
            return Ok(());
        };

        let url = self
            .config
            .base_url
            .join("api/login")
            .map_err(|_| V2rayaError::Shape { path: "baseUrl" })?;

        let body = serde_json::json!({ "username": username, "password": password });
        let req = self.common_headers(state.client.post(url.clone()).json(&body));
        let resp = req
            .timeout(self.timeout())
            .send()
            .await
            .map_err(|e| V2rayaError::Http {
                url: url.to_string(),
                source: e,
            })?;

        let status = resp.status();
        let auth_header = resp
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(V2rayaError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
                body_preview: body_text.chars().take(200).collect(),
            });
        }

        let parsed: Value = serde_json::from_str(&body_text).unwrap_or(Value::Null);
        if let Some(code) = parsed.get("code").and_then(Value::as_str) {
            if code != "SUCCESS" {
                let message = parsed
                    .get("message")
                    .or_else(|| parsed.get("msg"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                return Err(V2rayaError::LoginFailed {
                    code: Some(code.to_string()),
                    message,
                });
            }
        }

        let token = auth_header.or_else(|| find_token_field(&parsed));
        if let Some(token) = token {
            state.authorization = Some(token);
        }
        state.mark_logged_in();

        Ok(())
    }

    async fn get_json(&self, path: &str) -> Result<Value, V2rayaError> {
        let entry = self.store.entry(self.session_key());
        let url = self
            .config
            .base_url
            .join(path)
            .map_err(|_| V2rayaError::Shape { path: "baseUrl" })?;

        let (client, authorization) = {
            let state = entry.lock().await;
            (state.client.clone(), state.authorization.clone())
        };

        let mut req = self.common_headers(client.get(url.clone())).timeout(self.timeout());
        if let Some(token) = authorization {
            req = req.header("Authorization", token);
        }

        let resp = req.send().await.map_err(|e| V2rayaError::Http {
            url: url.to_string(),
            source: e,
        })?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(V2rayaError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
                body_preview: text.chars().take(200).collect(),
            });
        }

        serde_json::from_str(&text).map_err(|_| V2rayaError::Shape { path })
    }

    /// Resolves a usable proxy URI, preferring the configured (scheme,
    /// prefer-PAC) port, with a host override if present, and probing
    /// reachability of each candidate in order. Falls back to the primary
    /// candidate with a warning if none answered the probe.
    pub async fn resolve_proxy_uri(&self, fallback_host: &str, fallback_port: u16, scheme: &str) -> Result<Url, V2rayaError> {
        self.ensure_session().await?;
        let ports = self.get_json("api/ports").await?;
        let (host, candidates) = self.proxy_candidates(fallback_host, fallback_port, scheme, &ports);

        let probe_timeout = clamp(self.timeout() / 2, Duration::from_millis(300), Duration::from_secs(3));
        for port in &candidates {
            if probe_reachable(&host, *port, probe_timeout).await {
                return build_uri(scheme, &host, *port);
            }
        }

        warn!(host, candidates = ?candidates, "no v2rayA proxy port was reachable, falling back to primary candidate");
        build_uri(scheme, &host, candidates[0])
    }

    /// Like `resolve_proxy_uri`, but surfaces `NoReachablePort` instead of
    /// falling back when nothing answered the probe. Used by
    /// `test_connection`, where a silent fallback would defeat the point
    /// of the diagnostic.
    async fn probe_reachable_uri(&self, fallback_host: &str, fallback_port: u16, scheme: &str) -> Result<Url, V2rayaError> {
        self.ensure_session().await?;
        let ports = self.get_json("api/ports").await?;
        let (host, candidates) = self.proxy_candidates(fallback_host, fallback_port, scheme, &ports);

        let probe_timeout = clamp(self.timeout() / 2, Duration::from_millis(300), Duration::from_secs(3));
        for port in &candidates {
            if probe_reachable(&host, *port, probe_timeout).await {
                return build_uri(scheme, &host, *port);
            }
        }

        Err(V2rayaError::NoReachablePort)
    }

    fn proxy_candidates(&self, fallback_host: &str, fallback_port: u16, scheme: &str, ports: &Value) -> (String, Vec<u16>) {
        let (primary_key, secondary_key) = port_keys(scheme, self.config.prefer_pac_port);
        let host = self
            .config
            .proxy_host_override
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| {
                self.config
                    .base_url
                    .host_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| fallback_host.to_string())
            });

        let mut candidates = Vec::new();
        for key in [primary_key, secondary_key] {
            if let Some(port) = ports.get(key).and_then(Value::as_u64) {
                if port > 0 {
                    candidates.push(port as u16);
                }
            }
        }
        if candidates.is_empty() {
            candidates.push(fallback_port);
        }

        (host, candidates)
    }

    /// Resolves the set of connected outbound node addresses into
    /// `/32`/`/128` bypass routes.
    pub async fn resolve_exclude_cidrs(&self) -> Result<Vec<CidrRoute>, V2rayaError> {
        self.ensure_session().await?;
        let touch = self.get_json("api/touch").await?;

        let connected = touch
            .pointer("/data/touch/connectedServer")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for conn in connected {
            let Some(id) = conn.get("id").and_then(Value::as_str) else {
                continue;
            };
            let sub = conn.get("sub").and_then(Value::as_str).unwrap_or("");

            let address = find_server_address(&touch, id, sub);
            let Some(address) = address else {
                continue;
            };

            if let Some(cidr) = host_literal_to_cidr(&address) {
                out.push(cidr);
                continue;
            }

            if self.config.resolve_hostnames {
                if let Some(host) = extract_host(&address) {
                    if let Ok(addrs) = lookup_host((host.as_str(), 0)).await {
                        for addr in addrs {
                            if let Some(cidr) = ip_to_cidr(addr.ip()) {
                                out.push(cidr);
                            }
                        }
                    }
                }
            }
        }

        Ok(out)
    }

    /// Composes proxy-URI resolution and exclude-CIDR resolution into one
    /// read-only connectivity check for external tooling. Mutates nothing
    /// beyond the shared login-cookie cache either call already uses.
    pub async fn test_connection(
        &self,
        fallback_host: &str,
        fallback_port: u16,
        scheme: &str,
    ) -> Result<(Url, Vec<CidrRoute>), V2rayaError> {
        let uri = self.probe_reachable_uri(fallback_host, fallback_port, scheme).await?;
        let excludes = self.resolve_exclude_cidrs().await?;
        Ok((uri, excludes))
    }
}

fn port_keys(scheme: &str, prefer_pac: bool) -> (&'static str, &'static str) {
    match (scheme, prefer_pac) {
        ("socks5", true) => ("socks5WithPac", "socks5"),
        ("socks5", false) => ("socks5", "socks5WithPac"),
        ("http", true) => ("httpWithPac", "http"),
        _ => ("http", "httpWithPac"),
    }
}

fn build_uri(scheme: &str, host: &str, port: u16) -> Result<Url, V2rayaError> {
    Url::parse(&format!("{scheme}://{host}:{port}")).map_err(|_| V2rayaError::Shape { path: "proxy uri" })
}

fn clamp(value: Duration, min: Duration, max: Duration) -> Duration {
    value.clamp(min, max)
}

async fn probe_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "v2rayA candidate port unreachable");
            false
        }
        Err(_) => false,
    }
}

fn find_token_field(value: &Value) -> Option<String> {
    const KEYS: &[&str] = &["authorization", "token", "accesstoken", "access_token", "auth"];
    let empty = Value::Null;
    let data = value.get("data").unwrap_or(&empty);
    for root in [value, data] {
        if let Value::Object(map) = root {
            for (k, v) in map {
                if KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                    if let Some(s) = v.as_str() {
                        return Some(s.to_string());
                    }
                }
            }
        }
    }
    None
}

fn find_server_address(touch: &Value, id: &str, sub: &str) -> Option<String> {
    let subs = touch.pointer("/data/subscriptions")?;

    if let Some(servers) = subs.get(sub).and_then(|s| s.get("servers")).and_then(Value::as_array) {
        if let Some(addr) = address_by_id(servers, id) {
            return Some(addr);
        }
    }

    if let Value::Object(all_subs) = subs {
        for (_, s) in all_subs {
            if let Some(servers) = s.get("servers").and_then(Value::as_array) {
                if let Some(addr) = address_by_id(servers, id) {
                    return Some(addr);
                }
            }
        }
    }

    if let Some(servers) = touch.pointer("/data/servers").and_then(Value::as_array) {
        if let Some(addr) = address_by_id(servers, id) {
            return Some(addr);
        }
    }

    None
}

fn address_by_id(servers: &[Value], id: &str) -> Option<String> {
    servers
        .iter()
        .find(|s| s.get("id").and_then(Value::as_str) == Some(id))
        .and_then(|s| s.get("address"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn extract_host(address: &str) -> Option<String> {
    if let Ok(url) = Url::parse(address) {
        return url.host_str().map(str::to_string);
    }
    if let Some((host, _port)) = address.rsplit_once(':') {
        if host.parse::<IpAddr>().is_ok() || !host.is_empty() {
            return Some(host.to_string());
        }
    }
    Some(address.to_string())
}

fn host_literal_to_cidr(address: &str) -> Option<CidrRoute> {
    let host = extract_host(address)?;
    let ip: IpAddr = host.parse().ok()?;
    ip_to_cidr(ip)
}

fn ip_to_cidr(ip: IpAddr) -> Option<CidrRoute> {
    let prefix = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    CidrRoute::new(ip, prefix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_key_order_prefers_pac_when_configured() {
        assert_eq!(port_keys("socks5", true), ("socks5WithPac", "socks5"));
        assert_eq!(port_keys("socks5", false), ("socks5", "socks5WithPac"));
        assert_eq!(port_keys("http", true), ("httpWithPac", "http"));
        assert_eq!(port_keys("http", false), ("http", "httpWithPac"));
    }

    #[test]
    fn finds_token_in_nested_data_object() {
        let v = serde_json::json!({ "data": { "accessToken": "abc123" } });
        assert_eq!(find_token_field(&v), Some("abc123".to_string()));
    }

    #[test]
    fn extracts_host_from_uri_and_host_port() {
        assert_eq!(extract_host("1.2.3.4:443").as_deref(), Some("1.2.3.4"));
        assert_eq!(extract_host("https://example.com:8443/x").as_deref(), Some("example.com"));
    }

    #[test]
    fn converts_ip_literal_to_single_host_cidr() {
        let c = host_literal_to_cidr("8.8.8.8:1234").unwrap();
        assert_eq!(c.to_string(), "8.8.8.8/32");
    }
}
