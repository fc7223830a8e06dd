//! # IP Address Validation
//!
//! Security-critical validation for allow-list entries. An entry pointing at
//! a non-routable or shared range would silently defeat the allow-list's
//! purpose, so beyond syntactic correctness this module rejects:
//!
//! - IPv4 with leading-zero octets (parsed inconsistently across libraries)
//! - incomplete IPv4 (anything other than exactly four octets)
//! - private ranges (10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16, fc00::/7)
//! - loopback (127.0.0.0/8, ::1)
//! - unspecified (0.0.0.0/8, ::)
//! - link-local (169.254.0.0/16, fe80::/10)
//! - multicast (224.0.0.0/4, ff00::/8)
//! - reserved (240.0.0.0/4), except the literal broadcast 255.255.255.255
//!
//! IPv4-mapped IPv6 input is normalized to IPv4 before range checks, so
//! `::ffff:127.0.0.1` is rejected as loopback rather than slipping through
//! as an "IPv6" address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::core::error::{SecurityError, SecurityResult};

/// Validate a textual IP address for allow-list use
///
/// Returns the parsed, normalized address; the store persists its canonical
/// string form.
pub fn validate_ip_address(raw: &str) -> SecurityResult<IpAddr> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SecurityError::invalid_address("address is empty"));
    }

    let addr = if trimmed.contains(':') {
        let v6: Ipv6Addr = trimmed
            .parse()
            .map_err(|_| SecurityError::invalid_address(format!("malformed address: {}", raw)))?;
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    } else {
        IpAddr::V4(parse_strict_ipv4(trimmed)?)
    };

    match addr {
        IpAddr::V4(v4) => check_ipv4_ranges(v4)?,
        IpAddr::V6(v6) => check_ipv6_ranges(v6)?,
    }

    Ok(addr)
}

/// Parse IPv4 strictly: exactly four octets, decimal, no leading zeros
fn parse_strict_ipv4(text: &str) -> SecurityResult<Ipv4Addr> {
    let parts: Vec<&str> = text.split('.').collect();
    if parts.len() != 4 {
        return Err(SecurityError::invalid_address(format!(
            "IPv4 address must have exactly 4 octets: {}",
            text
        )));
    }

    let mut octets = [0u8; 4];
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SecurityError::invalid_address(format!(
                "malformed octet in {}",
                text
            )));
        }
        if part.len() > 1 && part.starts_with('0') {
            return Err(SecurityError::invalid_address(format!(
                "leading-zero octet is ambiguous: {}",
                text
            )));
        }
        octets[i] = part.parse::<u8>().map_err(|_| {
            SecurityError::invalid_address(format!("octet out of range in {}", text))
        })?;
    }

    Ok(Ipv4Addr::from(octets))
}

fn check_ipv4_ranges(addr: Ipv4Addr) -> SecurityResult<()> {
    let octets = addr.octets();

    if addr.is_loopback() {
        return Err(SecurityError::invalid_address(
            "loopback addresses are not allowed",
        ));
    }
    if octets[0] == 0 {
        return Err(SecurityError::invalid_address(
            "unspecified-range addresses are not allowed",
        ));
    }
    if addr.is_private() {
        return Err(SecurityError::invalid_address(
            "private-range addresses are not allowed",
        ));
    }
    if addr.is_link_local() {
        return Err(SecurityError::invalid_address(
            "link-local addresses are not allowed",
        ));
    }
    if addr.is_multicast() {
        return Err(SecurityError::invalid_address(
            "multicast addresses are not allowed",
        ));
    }
    if octets[0] >= 240 && !addr.is_broadcast() {
        return Err(SecurityError::invalid_address(
            "reserved-range addresses are not allowed",
        ));
    }

    Ok(())
}

fn check_ipv6_ranges(addr: Ipv6Addr) -> SecurityResult<()> {
    if addr.is_loopback() {
        return Err(SecurityError::invalid_address(
            "loopback addresses are not allowed",
        ));
    }
    if addr.is_unspecified() {
        return Err(SecurityError::invalid_address(
            "the unspecified address is not allowed",
        ));
    }
    // fc00::/7 unique local
    if addr.segments()[0] & 0xfe00 == 0xfc00 {
        return Err(SecurityError::invalid_address(
            "private-range addresses are not allowed",
        ));
    }
    // fe80::/10
    if addr.segments()[0] & 0xffc0 == 0xfe80 {
        return Err(SecurityError::invalid_address(
            "link-local addresses are not allowed",
        ));
    }
    if addr.is_multicast() {
        return Err(SecurityError::invalid_address(
            "multicast addresses are not allowed",
        ));
    }

    Ok(())
}
