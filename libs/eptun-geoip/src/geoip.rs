//! Reader for length-delimited, protobuf-shaped GeoIP catalogues (the
//! `cn.dat` family of files shipped by v2fly/v2ray).
//!
//! The wire shape mirrors (without depending on) the v2fly `GeoIPList`
//! message:
//!
//! ```text
//! message CIDR     { bytes ip = 1; uint32 prefix = 2; }
//! message GeoIP    { string country_code = 1; repeated CIDR cidr = 2; }
//! message GeoIPList{ repeated GeoIP entry = 1; }
//! ```
//!
//! We don't pull in a full protobuf/prost dependency for this: the reader
//! below decodes just enough of the wire format (varints, length-delimited
//! fields) and skips anything it doesn't recognize by wire type, which is
//! what genuinely malformed-but-extended catalogues need.

use bytes::Buf;
use eptun_cidr::CidrRoute;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, thiserror::Error)]
pub enum GeoIpParseError {
    #[error("unexpected end of input while reading {0}")]
    Truncated(&'static str),
    #[error("address length {0} is not 4 or 16 bytes")]
    BadAddressLength(usize),
    #[error("wire type {0} is not supported")]
    UnsupportedWireType(u64),
    #[error("CIDR prefix {0} not present")]
    MissingPrefix,
    #[error(transparent)]
    Cidr(#[from] eptun_cidr::CidrError),
}

type Result<T> = std::result::Result<T, GeoIpParseError>;

/// Reads the entire catalogue and returns every CIDR tagged with `country_code`
/// (matched case-insensitively).
pub fn read_country(data: &[u8], country_code: &str) -> Result<Vec<CidrRoute>> {
    let wanted = country_code.to_ascii_uppercase();
    let mut buf = data;
    let mut out = Vec::new();

    while buf.has_remaining() {
        let (field, wire_type) = read_tag(&mut buf)?;
        match (field, wire_type) {
            (1, 2) => {
                let msg = read_bytes_field(&mut buf)?;
                let entry = parse_geoip_entry(msg)?;
                if entry.country_code.eq_ignore_ascii_case(&wanted) {
                    out.extend(entry.cidrs);
                }
            }
            (_, wt) => skip_field(&mut buf, wt)?,
        }
    }

    Ok(out)
}

/// Lists every distinct country code present in the catalogue, in file order
/// with duplicates removed.
pub fn list_country_codes(data: &[u8]) -> Result<Vec<String>> {
    let mut buf = data;
    let mut out = Vec::new();

    while buf.has_remaining() {
        let (field, wire_type) = read_tag(&mut buf)?;
        match (field, wire_type) {
            (1, 2) => {
                let msg = read_bytes_field(&mut buf)?;
                let entry = parse_geoip_entry(msg)?;
                if !out.contains(&entry.country_code) {
                    out.push(entry.country_code);
                }
            }
            (_, wt) => skip_field(&mut buf, wt)?,
        }
    }

    Ok(out)
}

struct GeoIpEntry {
    country_code: String,
    cidrs: Vec<CidrRoute>,
}

fn parse_geoip_entry(mut buf: &[u8]) -> Result<GeoIpEntry> {
    let mut country_code = String::new();
    let mut cidrs = Vec::new();

    while buf.has_remaining() {
        let (field, wire_type) = read_tag(&mut buf)?;
        match (field, wire_type) {
            (1, 2) => {
                let bytes = read_bytes_field(&mut buf)?;
                country_code = String::from_utf8_lossy(bytes).into_owned();
            }
            (2, 2) => {
                let bytes = read_bytes_field(&mut buf)?;
                cidrs.push(parse_cidr(bytes)?);
            }
            (_, wt) => skip_field(&mut buf, wt)?,
        }
    }

    Ok(GeoIpEntry { country_code, cidrs })
}

fn parse_cidr(mut buf: &[u8]) -> Result<CidrRoute> {
    let mut ip_bytes: Option<Vec<u8>> = None;
    let mut prefix: Option<u32> = None;

    while buf.has_remaining() {
        let (field, wire_type) = read_tag(&mut buf)?;
        match (field, wire_type) {
            (1, 2) => {
                let bytes = read_bytes_field(&mut buf)?;
                ip_bytes = Some(bytes.to_vec());
            }
            (2, 0) => {
                prefix = Some(read_varint(&mut buf)? as u32);
            }
            (_, wt) => skip_field(&mut buf, wt)?,
        }
    }

    let ip_bytes = ip_bytes.unwrap_or_default();
    let addr = match ip_bytes.len() {
        4 => {
            let arr: [u8; 4] = ip_bytes.try_into().unwrap();
            IpAddr::V4(Ipv4Addr::from(arr))
        }
        16 => {
            let arr: [u8; 16] = ip_bytes.try_into().unwrap();
            IpAddr::V6(Ipv6Addr::from(arr))
        }
        other => return Err(GeoIpParseError::BadAddressLength(other)),
    };
    let prefix = prefix.ok_or(GeoIpParseError::MissingPrefix)?;

    Ok(CidrRoute::new(addr, prefix as u8)?)
}

fn read_tag(buf: &mut &[u8]) -> Result<(u64, u64)> {
    let tag = read_varint(buf)?;
    Ok((tag >> 3, tag & 0x7))
}

fn read_varint(buf: &mut &[u8]) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() {
            return Err(GeoIpParseError::Truncated("varint"));
        }
        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(GeoIpParseError::Truncated("varint"));
        }
    }
    Ok(result)
}

fn read_bytes_field<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(GeoIpParseError::Truncated("length-delimited field"));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn skip_field(buf: &mut &[u8], wire_type: u64) -> Result<()> {
    match wire_type {
        0 => {
            read_varint(buf)?;
        }
        1 => {
            if buf.remaining() < 8 {
                return Err(GeoIpParseError::Truncated("64-bit field"));
            }
            buf.advance(8);
        }
        2 => {
            read_bytes_field(buf)?;
        }
        5 => {
            if buf.remaining() < 4 {
                return Err(GeoIpParseError::Truncated("32-bit field"));
            }
            buf.advance(4);
        }
        other => return Err(GeoIpParseError::UnsupportedWireType(other)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let mut byte = (v & 0x7F) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if v == 0 {
                break;
            }
        }
    }

    fn tag(field: u64, wire_type: u64, out: &mut Vec<u8>) {
        varint((field << 3) | wire_type, out);
    }

    fn cidr_msg(ip: &[u8], prefix: u32) -> Vec<u8> {
        let mut out = Vec::new();
        tag(1, 2, &mut out);
        varint(ip.len() as u64, &mut out);
        out.extend_from_slice(ip);
        tag(2, 0, &mut out);
        varint(prefix as u64, &mut out);
        out
    }

    fn geoip_msg(country: &str, cidrs: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        tag(1, 2, &mut out);
        varint(country.len() as u64, &mut out);
        out.extend_from_slice(country.as_bytes());
        for c in cidrs {
            tag(2, 2, &mut out);
            varint(c.len() as u64, &mut out);
            out.extend_from_slice(c);
        }
        out
    }

    fn entry(country: &str, cidrs: &[Vec<u8>]) -> Vec<u8> {
        let msg = geoip_msg(country, cidrs);
        let mut out = Vec::new();
        tag(1, 2, &mut out);
        varint(msg.len() as u64, &mut out);
        out.extend_from_slice(&msg);
        out
    }

    #[test]
    fn reads_country_cidrs() {
        let cn_cidr = cidr_msg(&[1, 0, 0, 0], 8);
        let us_cidr = cidr_msg(&[8, 8, 8, 8], 32);
        let mut data = Vec::new();
        data.extend(entry("CN", &[cn_cidr]));
        data.extend(entry("US", &[us_cidr]));

        let cn = read_country(&data, "cn").unwrap();
        assert_eq!(cn.len(), 1);
        assert_eq!(cn[0].to_string(), "1.0.0.0/8");
    }

    #[test]
    fn is_case_insensitive_on_lookup() {
        let data = entry("CN", &[cidr_msg(&[1, 0, 0, 0], 8)]);
        let cn = read_country(&data, "Cn").unwrap();
        assert_eq!(cn.len(), 1);
    }

    #[test]
    fn skips_unknown_fields_by_wire_type() {
        let mut data = Vec::new();
        // unknown varint field at the top level
        tag(99, 0, &mut data);
        data.push(5);
        data.extend(entry("CN", &[cidr_msg(&[1, 0, 0, 0], 8)]));

        let cn = read_country(&data, "cn").unwrap();
        assert_eq!(cn.len(), 1);
    }

    #[test]
    fn rejects_bad_address_length() {
        let bad_cidr = {
            let mut out = Vec::new();
            tag(1, 2, &mut out);
            varint(3, &mut out);
            out.extend_from_slice(&[1, 2, 3]);
            tag(2, 0, &mut out);
            varint(24, &mut out);
            out
        };
        let data = entry("CN", &[bad_cidr]);
        let err = read_country(&data, "cn").unwrap_err();
        assert!(matches!(err, GeoIpParseError::BadAddressLength(3)));
    }

    #[test]
    fn lists_country_codes_in_order_without_duplicates() {
        let mut data = Vec::new();
        data.extend(entry("CN", &[cidr_msg(&[1, 0, 0, 0], 8)]));
        data.extend(entry("US", &[cidr_msg(&[8, 8, 8, 8], 32)]));
        data.extend(entry("CN", &[cidr_msg(&[2, 0, 0, 0], 8)]));

        let codes = list_country_codes(&data).unwrap();
        assert_eq!(codes, vec!["CN".to_string(), "US".to_string()]);
    }
}
