/*!
 * UDP broadcast discovery.
 *
 * Sends the INFO probe to the broadcast address on the discovery port and
 * collects the distinct source addresses that reply within a bounded window.
 */
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::codec::Frame;
use crate::discovery::DiscoverySource;
use crate::error::Result;

/// Number of probe datagrams sent per pass
const PROBE_REPEATS: u32 = 3;

/// Gap between probe datagrams
const PROBE_GAP: Duration = Duration::from_millis(30);

/// Discovers devices on the local broadcast domain
#[derive(Debug, Clone)]
pub struct BroadcastDiscoverer {
    target: SocketAddr,
    window: Duration,
}

impl BroadcastDiscoverer {
    /// Create a discoverer probing `255.255.255.255:port`
    pub fn new(port: u16, window: Duration) -> Self {
        Self {
            target: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port),
            window,
        }
    }

    /// Override the probe target (e.g. a directed broadcast address)
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }
}

#[async_trait]
impl DiscoverySource for BroadcastDiscoverer {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn discover(&self) -> Result<HashSet<IpAddr>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;

        // UDP probes carry the bare JSON document, no frame delimiter
        let probe = Frame::info(Utc::now().timestamp_millis() as u64);
        let probe_bytes = serde_json::to_vec(&probe).unwrap_or_default();

        for _ in 0..PROBE_REPEATS {
            if let Err(e) = socket.send_to(&probe_bytes, self.target).await {
                warn!(target = %self.target, error = %e, "Broadcast probe send failed");
                break;
            }
            sleep(PROBE_GAP).await;
        }

        let mut found = HashSet::new();
        let deadline = Instant::now() + self.window;
        let mut buf = [0u8; 1024];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    warn!(error = %e, "Broadcast receive failed");
                    break;
                }
                Ok(Ok((_, addr))) => {
                    if found.insert(addr.ip()) {
                        debug!(ip = %addr.ip(), "Broadcast reply");
                    }
                }
            }
        }

        debug!(count = found.len(), "Broadcast discovery pass complete");
        Ok(found)
    }
}
