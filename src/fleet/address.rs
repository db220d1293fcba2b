//! IPv4 address notation.
//!
//! Accepted forms, combinable with commas:
//!
//! - `10.0.0.5` - single address
//! - `10.0.0.1-50` - range over the last octet
//! - `10.0.0.250-10.0.1.10` - full range across octets

use std::net::Ipv4Addr;

use super::error::FleetError;

/// Upper bound on the number of addresses one notation may expand to.
pub const MAX_EXPANSION: usize = 65_536;

fn parse_addr(text: &str) -> Result<Ipv4Addr, FleetError> {
    text.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| FleetError::Address(format!("'{}' is not an IPv4 address", text.trim())))
}

fn expand_range(start: Ipv4Addr, end: Ipv4Addr, part: &str) -> Result<Vec<u32>, FleetError> {
    let (start, end) = (u32::from(start), u32::from(end));
    if end < start {
        return Err(FleetError::Address(format!(
            "range '{}' ends before it starts",
            part
        )));
    }
    if (end - start) as usize >= MAX_EXPANSION {
        return Err(FleetError::Address(format!(
            "range '{}' exceeds {} addresses",
            part, MAX_EXPANSION
        )));
    }
    Ok((start..=end).collect())
}

fn expand_part(part: &str) -> Result<Vec<u32>, FleetError> {
    let Some((left, right)) = part.split_once('-') else {
        return Ok(vec![u32::from(parse_addr(part)?)]);
    };

    let start = parse_addr(left)?;
    let right = right.trim();

    if right.contains('.') {
        return expand_range(start, parse_addr(right)?, part);
    }

    let last = right
        .parse::<u8>()
        .map_err(|_| FleetError::Address(format!("'{}' is not a valid last octet", right)))?;
    let [a, b, c, _] = start.octets();
    expand_range(start, Ipv4Addr::new(a, b, c, last), part)
}

/// Expand `notation` into a list of addresses, in the order given, without
/// duplicates.
pub fn expand(notation: &str) -> Result<Vec<String>, FleetError> {
    let mut seen = std::collections::HashSet::new();
    let mut addresses = Vec::new();

    for part in notation.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        for value in expand_part(part)? {
            if seen.insert(value) {
                addresses.push(value);
                if addresses.len() > MAX_EXPANSION {
                    return Err(FleetError::Address(format!(
                        "'{}' exceeds {} addresses",
                        notation, MAX_EXPANSION
                    )));
                }
            }
        }
    }

    if addresses.is_empty() {
        return Err(FleetError::Address("no addresses given".to_string()));
    }

    Ok(addresses
        .into_iter()
        .map(|v| Ipv4Addr::from(v).to_string())
        .collect())
}

/// Compress `addresses` into the shortest range notation.
///
/// Addresses are sorted and deduplicated; consecutive runs become ranges,
/// written in the short `a.b.c.x-y` form when the run stays in one /24.
pub fn compress(addresses: &[String]) -> Result<String, FleetError> {
    let mut values = addresses
        .iter()
        .map(|a| parse_addr(a).map(u32::from))
        .collect::<Result<Vec<_>, _>>()?;
    values.sort_unstable();
    values.dedup();

    let mut runs: Vec<(u32, u32)> = Vec::new();
    for value in values {
        match runs.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(value) => *end = value,
            _ => runs.push((value, value)),
        }
    }

    let parts: Vec<String> = runs
        .into_iter()
        .map(|(start, end)| {
            let (first, last) = (Ipv4Addr::from(start), Ipv4Addr::from(end));
            if start == end {
                first.to_string()
            } else if first.octets()[..3] == last.octets()[..3] {
                format!("{}-{}", first, last.octets()[3])
            } else {
                format!("{}-{}", first, last)
            }
        })
        .collect();

    Ok(parts.join(","))
}

/// Sort key for display: numeric for IPv4 addresses, after them otherwise.
pub(crate) fn sort_key(address: &str) -> (u8, u32, String) {
    match address.parse::<Ipv4Addr>() {
        Ok(ip) => (0, u32::from(ip), String::new()),
        Err(_) => (1, 0, address.to_string()),
    }
}
