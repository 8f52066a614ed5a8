//! Host address detection

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// First non-loopback IPv4 address of this host.
///
/// Connecting a UDP socket only selects a route, no packet is sent.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Address to advertise when none is configured
pub fn advertise_host() -> String {
    local_ipv4()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertise_host_is_ipv4() {
        let host = advertise_host();
        let ip: Ipv4Addr = host.parse().unwrap();
        assert!(!ip.is_unspecified());
    }
}
