//! The `netsh`/`route` fallback path, used when the native IP Helper API
//! is unavailable or has been disabled for the session after an earlier
//! failure.

use crate::error::RoutingError;
use crate::model::{DefaultRouteV4, DefaultRouteV6};
use regex::Regex;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;
use tokio::process::Command;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Locale-tolerant substrings for "this route already exists". Data, not
/// code: an unmatched locale falls through to a hard failure on replace.
const ALREADY_EXISTS_PHRASES: &[&str] = &["already exists", "对象已存在"];

pub fn output_indicates_already_exists(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    ALREADY_EXISTS_PHRASES
        .iter()
        .any(|phrase| lower.contains(&phrase.to_ascii_lowercase()) || text.contains(phrase))
}

pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub async fn run(program: &str, args: &[&str]) -> Result<CommandOutput, RoutingError> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let output = cmd.output().await.map_err(|source| RoutingError::Spawn {
        command: format!("{program} {}", args.join(" ")),
        source,
    })?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn v4_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*(\d+\.\d+\.\d+\.\d+)\s+(\d+\.\d+\.\d+\.\d+)\s+(\d+\.\d+\.\d+\.\d+)\s+(\d+\.\d+\.\d+\.\d+)\s+(\d+)\s*$",
        )
        .expect("valid regex")
    })
}

/// Parses the output of `route print -4` and returns the `0.0.0.0/0` row
/// with the smallest metric.
pub fn parse_default_v4(route_print_output: &str) -> Option<DefaultRouteV4> {
    let mut best: Option<DefaultRouteV4> = None;

    for caps in v4_row_regex().captures_iter(route_print_output) {
        let dest = &caps[1];
        let mask = &caps[2];
        if dest != "0.0.0.0" || mask != "0.0.0.0" {
            continue;
        }
        let gateway: Ipv4Addr = caps[3].parse().ok()?;
        let iface_address: Ipv4Addr = caps[4].parse().ok()?;
        let metric: u32 = caps[5].parse().ok()?;

        if best.map(|b| metric < b.metric).unwrap_or(true) {
            best = Some(DefaultRouteV4 {
                gateway,
                iface_address,
                metric,
            });
        }
    }

    best
}

fn v6_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(\d+)\s+(\d+)\s+(\S+)\s+(\S+)\s*$").expect("valid regex")
    })
}

/// Parses the output of `route print -6` and returns the `::/0` row with
/// the smallest metric, skipping on-link gateways.
pub fn parse_default_v6(route_print_output: &str) -> Option<DefaultRouteV6> {
    let mut best: Option<DefaultRouteV6> = None;

    for caps in v6_row_regex().captures_iter(route_print_output) {
        let iface_index: u32 = caps[1].parse().ok()?;
        let metric: u32 = caps[2].parse().ok()?;
        let dest = &caps[3];
        let gateway_str = &caps[4];

        if dest != "::/0" {
            continue;
        }
        if gateway_str.eq_ignore_ascii_case("on-link") {
            continue;
        }
        let Ok(gateway) = gateway_str.parse::<Ipv6Addr>() else {
            continue;
        };

        if best.map(|b| metric < b.metric).unwrap_or(true) {
            best = Some(DefaultRouteV6 {
                gateway,
                iface_index,
                metric,
            });
        }
    }

    best
}

fn interface_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(\d+)\s+\d+\s+\d+\s+\S+\s+(.+?)\s*$").expect("valid regex"))
}

/// Parses `netsh interface ipv4 show interfaces` and finds the index of
/// the interface whose trailing name field matches `name`,
/// case-insensitively.
pub fn parse_interface_index(show_interfaces_output: &str, name: &str) -> Option<u32> {
    for caps in interface_row_regex().captures_iter(show_interfaces_output) {
        let idx: u32 = caps[1].parse().ok()?;
        let iface_name = caps[2].trim();
        if iface_name.eq_ignore_ascii_case(name) {
            return Some(idx);
        }
    }
    None
}

/// `netsh interface ipv4 set address name="IFACE" static ADDR MASK GATEWAY`
pub async fn set_ipv4_address(
    iface_name: &str,
    address: Ipv4Addr,
    mask: Ipv4Addr,
    gateway: Ipv4Addr,
) -> Result<(), RoutingError> {
    let args = [
        "interface",
        "ipv4",
        "set",
        "address",
        &format!("name=\"{iface_name}\""),
        "static",
        &address.to_string(),
        &mask.to_string(),
        &gateway.to_string(),
    ];
    run_checked("netsh", &args).await
}

/// `netsh interface ipv4 set/add dnsservers`, first server as `source=static`,
/// remaining appended as indexed entries.
pub async fn set_ipv4_dns(iface_name: &str, servers: &[Ipv4Addr]) -> Result<(), RoutingError> {
    let Some((first, rest)) = servers.split_first() else {
        return Ok(());
    };

    let args = [
        "interface",
        "ipv4",
        "set",
        "dnsservers",
        &format!("name=\"{iface_name}\""),
        "static",
        &first.to_string(),
        "primary",
    ];
    run_checked("netsh", &args).await?;

    for (i, server) in rest.iter().enumerate() {
        let index = (i + 2).to_string();
        let args = [
            "interface",
            "ipv4",
            "add",
            "dnsservers",
            &format!("name=\"{iface_name}\""),
            &server.to_string(),
            &format!("index={index}"),
        ];
        run_checked("netsh", &args).await?;
    }

    Ok(())
}

async fn run_checked(program: &str, args: &[&str]) -> Result<(), RoutingError> {
    let output = run(program, args).await?;
    if !output.success {
        return Err(RoutingError::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            status: None,
            stderr: output.stderr,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_lowest_metric_v4_default() {
        let text = "\
Network Destination        Netmask          Gateway       Interface  Metric
          0.0.0.0          0.0.0.0    192.168.1.1   192.168.1.10       35
          0.0.0.0          0.0.0.0       10.0.0.1       10.0.0.2       15
";
        let route = parse_default_v4(text).unwrap();
        assert_eq!(route.gateway, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(route.metric, 15);
    }

    #[test]
    fn skips_on_link_v6_default() {
        let text = "\
 12    281 ::/0                     On-link
  8    266 ::/0                     fe80::1
";
        let route = parse_default_v6(text).unwrap();
        assert_eq!(route.iface_index, 8);
        assert_eq!(route.metric, 266);
    }

    #[test]
    fn finds_interface_index_case_insensitively() {
        let text = "\
Idx     Met         MTU          State                Name
---  ----------  ----------  ------------  ---------------------------
 15          35        1500  connected     eptun
  1          75  4294967295  connected     Loopback Pseudo-Interface 1
";
        assert_eq!(parse_interface_index(text, "EPTUN"), Some(15));
        assert_eq!(parse_interface_index(text, "missing"), None);
    }

    #[test]
    fn detects_already_exists_in_english_and_chinese() {
        assert!(output_indicates_already_exists("The object already exists."));
        assert!(output_indicates_already_exists("错误: 对象已存在。"));
        assert!(!output_indicates_already_exists("some other error"));
    }
}
