//! Reader for APNIC-style pipe-delimited delegation files, used as a
//! fallback CN-CIDR source when no GeoIP catalogue is available.
//!
//! A qualifying line looks like:
//!
//! ```text
//! apnic|CN|ipv4|1.0.1.0|256|20110414|allocated
//! apnic|CN|ipv6|2400:3800::|32|20110412|allocated
//! ```

use eptun_cidr::{expand_range_v4, CidrRoute};
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, thiserror::Error)]
pub enum ApnicParseError {
    #[error(transparent)]
    Cidr(#[from] eptun_cidr::CidrError),
}

/// Parses the whole file and returns every qualifying CIDR for `country_code`
/// (matched case-insensitively). Lines that don't match the APNIC delegated
/// format (comments, headers, other registries, other statuses) are skipped
/// silently.
pub fn read_country(text: &str, country_code: &str) -> Result<Vec<CidrRoute>, ApnicParseError> {
    let wanted = country_code.to_ascii_uppercase();
    let mut out = Vec::new();

    for line in text.lines() {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 7 {
            continue;
        }
        if !fields[0].eq_ignore_ascii_case("apnic") {
            continue;
        }
        if !fields[1].eq_ignore_ascii_case(&wanted) {
            continue;
        }
        let status = fields[6];
        if !status.eq_ignore_ascii_case("allocated") && !status.eq_ignore_ascii_case("assigned") {
            continue;
        }

        match fields[2].to_ascii_lowercase().as_str() {
            "ipv4" => {
                let Ok(start) = fields[3].parse::<Ipv4Addr>() else {
                    continue;
                };
                let Ok(count) = fields[4].parse::<u64>() else {
                    continue;
                };
                if count == 0 {
                    continue;
                }
                out.extend(expand_range_v4(start, count)?);
            }
            "ipv6" => {
                let Ok(network) = fields[3].parse::<IpAddr>() else {
                    continue;
                };
                let Ok(prefix) = fields[4].parse::<u8>() else {
                    continue;
                };
                out.push(CidrRoute::new(network, prefix)?);
            }
            _ => continue,
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_range_line() {
        let text = "apnic|CN|ipv4|1.0.1.0|256|20110414|allocated\n";
        let cidrs = read_country(text, "cn").unwrap();
        assert_eq!(cidrs.len(), 1);
        assert_eq!(cidrs[0].to_string(), "1.0.1.0/24");
    }

    #[test]
    fn parses_v6_line() {
        let text = "apnic|CN|ipv6|2400:3800::|32|20110412|allocated\n";
        let cidrs = read_country(text, "CN").unwrap();
        assert_eq!(cidrs.len(), 1);
        assert_eq!(cidrs[0].to_string(), "2400:3800::/32");
    }

    #[test]
    fn skips_non_apnic_and_other_countries() {
        let text = concat!(
            "2.0|apnic|20110414|...|...\n",
            "ripencc|CN|ipv4|1.0.1.0|256|20110414|allocated\n",
            "apnic|JP|ipv4|1.0.2.0|256|20110414|allocated\n",
            "apnic|CN|ipv4|1.0.3.0|256|20110414|assigned\n",
        );
        let cidrs = read_country(text, "cn").unwrap();
        assert_eq!(cidrs.len(), 1);
        assert_eq!(cidrs[0].to_string(), "1.0.3.0/24");
    }

    #[test]
    fn skips_reserved_status() {
        let text = "apnic|CN|ipv4|1.0.1.0|256|20110414|reserved\n";
        let cidrs = read_country(text, "cn").unwrap();
        assert!(cidrs.is_empty());
    }

    #[test]
    fn ignores_short_lines() {
        let text = "# a comment\napnic|CN|ipv4\n";
        let cidrs = read_country(text, "cn").unwrap();
        assert!(cidrs.is_empty());
    }
}
