//! Default-gateway discovery.
//!
//! Reads the kernel routing table and returns every gateway address a route
//! points at. Only Linux is supported; elsewhere discovery reports
//! [`DiscoveryError::Unsupported`] and callers fall back to configured targets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use log::{debug, trace};

use crate::error_handling::types::DiscoveryError;

#[cfg(target_os = "linux")]
const ROUTE_TABLE: &str = "/proc/net/route";

/// Route uses a gateway (`RTF_GATEWAY`).
const RTF_GATEWAY: u32 = 0x0002;

/// Parses `/proc/net/route` content into gateway addresses, first-seen order,
/// without duplicates.
///
/// Columns are whitespace separated; `Gateway` and `Flags` are hex, the
/// gateway in host (little-endian) byte order.
pub fn parse_route_table(content: &str) -> Result<Vec<Ipv4Addr>, DiscoveryError> {
    let mut gateways = Vec::new();
    for line in content.lines().skip(1) {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.is_empty() {
            continue;
        }
        if columns.len() < 4 {
            return Err(DiscoveryError::MalformedRoute(line.to_string()));
        }
        let gateway = u32::from_str_radix(columns[2], 16)
            .map_err(|_| DiscoveryError::MalformedRoute(line.to_string()))?;
        let flags = u32::from_str_radix(columns[3], 16)
            .map_err(|_| DiscoveryError::MalformedRoute(line.to_string()))?;

        let address = Ipv4Addr::from(gateway.to_le_bytes());
        trace!("route via {} on {} (flags {:#x})", address, columns[0], flags);
        if flags & RTF_GATEWAY == 0 || address.is_unspecified() {
            continue;
        }
        if !gateways.contains(&address) {
            gateways.push(address);
        }
    }
    Ok(gateways)
}

/// Gateways of the running host.
#[cfg(target_os = "linux")]
pub fn discover_gateways() -> Result<Vec<IpAddr>, DiscoveryError> {
    let content = std::fs::read_to_string(ROUTE_TABLE)?;
    let gateways: Vec<IpAddr> = parse_route_table(&content)?
        .into_iter()
        .map(IpAddr::V4)
        .collect();
    debug!("Discovered {} gateway(s): {:?}", gateways.len(), gateways);
    Ok(gateways)
}

#[cfg(not(target_os = "linux"))]
pub fn discover_gateways() -> Result<Vec<IpAddr>, DiscoveryError> {
    debug!("Gateway discovery requested on an unsupported platform");
    Err(DiscoveryError::Unsupported)
}

/// One endpoint per gateway and port.
pub fn expand_targets(gateways: &[IpAddr], ports: &[u16]) -> Vec<SocketAddr> {
    gateways
        .iter()
        .flat_map(|&ip| ports.iter().map(move |&port| SocketAddr::new(ip, port)))
        .collect()
}
