//! Outbound address discovery.

use std::net::{IpAddr, Ipv4Addr};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Well-known public address used only to pick a local interface.
/// Connecting a UDP socket sends nothing.
const PROBE_ADDR: &str = "8.8.8.8:80";

/// Returns the local IP used for outbound traffic, or loopback if it
/// cannot be determined.
pub async fn outbound_ip() -> IpAddr {
    match probe().await {
        Ok(ip) => {
            debug!(%ip, "Discovered outbound address");
            ip
        }
        Err(e) => {
            warn!(error = %e, "Failed to discover outbound address, advertising loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

async fn probe() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(PROBE_ADDR).await?;
    Ok(socket.local_addr()?.ip())
}
