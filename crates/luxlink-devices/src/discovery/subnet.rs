/*!
 * Active subnet scanning.
 *
 * Finds devices outside the broadcast domain by attempting short TCP
 * connects to the protocol port across a CIDR block or address range.
 * This is presence detection only; no handshake is performed and accepted
 * connections are closed immediately.
 */
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use luxlink_core::config::SubnetSpec;

use crate::discovery::DiscoverySource;
use crate::error::Result;

/// Scans one subnet for devices accepting connections on the protocol port
#[derive(Debug, Clone)]
pub struct SubnetScanner {
    spec: SubnetSpec,
    port: u16,
    probe_timeout: Duration,
    concurrency: usize,
}

impl SubnetScanner {
    /// Create a scanner for one subnet.
    ///
    /// `concurrency` bounds the number of in-flight probes; unbounded
    /// fan-out against a large range would exhaust file descriptors.
    pub fn new(spec: SubnetSpec, port: u16, probe_timeout: Duration, concurrency: usize) -> Self {
        Self {
            spec,
            port,
            probe_timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// The subnet this scanner covers
    pub fn spec(&self) -> &SubnetSpec {
        &self.spec
    }

    async fn probe(ip: IpAddr, port: u16, probe_timeout: Duration) -> Option<IpAddr> {
        match timeout(probe_timeout, TcpStream::connect((ip, port))).await {
            // Presence confirmed; drop the stream right away
            Ok(Ok(_stream)) => Some(ip),
            _ => None,
        }
    }
}

#[async_trait]
impl DiscoverySource for SubnetScanner {
    fn name(&self) -> &'static str {
        "subnet-scan"
    }

    async fn discover(&self) -> Result<HashSet<IpAddr>> {
        let hosts = self.spec.hosts();
        debug!(subnet = %self.spec, hosts = hosts.len(), "Scanning subnet");

        let port = self.port;
        let probe_timeout = self.probe_timeout;

        let found: HashSet<IpAddr> = stream::iter(
            hosts
                .into_iter()
                .map(|host| Self::probe(IpAddr::V4(host), port, probe_timeout)),
        )
        .buffer_unordered(self.concurrency)
        .filter_map(|hit| async move { hit })
        .collect()
        .await;

        debug!(subnet = %self.spec, count = found.len(), "Subnet scan complete");
        Ok(found)
    }
}
