use std::net::{IpAddr, SocketAddr};

use serde::Deserialize;

/// Ports the capture service listens on at each gateway.
pub const DEFAULT_PORTS: [u16; 4] = [9800, 9801, 9802, 9803];

/// A host to capture from and the ports to open on it, one pipeline per port.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct TargetConfig {
    pub address: IpAddr,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
}

impl TargetConfig {
    pub fn socket_addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.ports
            .iter()
            .map(move |&port| SocketAddr::new(self.address, port))
    }
}

pub fn default_ports() -> Vec<u16> {
    DEFAULT_PORTS.to_vec()
}
