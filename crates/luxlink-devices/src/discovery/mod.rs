/*!
 * Device discovery for LuxLink.
 *
 * Discovery finds candidate device addresses; it never opens sessions
 * itself. Two sources are provided: a UDP broadcast probe for the local
 * broadcast domain and an active TCP subnet scanner for everything beyond
 * it. The discovery coordinator merges their results with manually
 * configured addresses.
 */
use std::collections::HashSet;
use std::fmt::Debug;
use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::Result;

pub mod broadcast;
pub mod subnet;

pub use broadcast::BroadcastDiscoverer;
pub use subnet::SubnetScanner;

/// A source of candidate device addresses.
///
/// A source returning an empty set is a valid outcome, not a failure; a
/// source returning an error contributes nothing to the cycle but never
/// aborts it.
#[async_trait]
pub trait DiscoverySource: Send + Sync + Debug {
    /// Name of the source, for logging
    fn name(&self) -> &'static str;

    /// Collect candidate addresses. Must not block beyond the source's own
    /// bounded window/timeouts.
    async fn discover(&self) -> Result<HashSet<IpAddr>>;
}
