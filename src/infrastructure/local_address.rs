//! Local address discovery
//!
//! Injected script tags must point at an address the client device can
//! reach, so the loopback address is only a last resort.

use crate::infrastructure::log_messages::application;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// Public address used only to pick a route; no packet is sent
const ROUTE_PROBE: &str = "8.8.8.8:80";

/// Address of the interface that routes to the outside world
pub async fn discover() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(ROUTE_PROBE).await?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no routable interface",
        ));
    }
    Ok(ip)
}

/// Configured override, else the discovered address, else loopback
pub async fn resolve(configured: Option<IpAddr>) -> IpAddr {
    let ip = match configured {
        Some(ip) => ip,
        None => match discover().await {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, "{}", application::LOCAL_IP_FALLBACK);
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
        },
    };
    info!(%ip, "{}", application::LOCAL_IP_DISCOVERED);
    ip
}
