/*!
 * LuxLink Devices
 *
 * This crate implements the device communication and discovery engine:
 * the framed JSON wire protocol, persistent device sessions, UDP broadcast
 * and TCP subnet discovery, and the coordinator that keeps the shared
 * device registry converged with the network.
 */

#![warn(missing_docs)]

// Re-export core types
pub use luxlink_core::prelude;

pub mod codec;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod session;

// Re-export the primary surface
pub use codec::{Command, Frame};
pub use coordinator::{snapshot_diff, CycleStats, DiscoveryCoordinator};
pub use discovery::{BroadcastDiscoverer, DiscoverySource, SubnetScanner};
pub use error::{DeviceError, Result};
pub use registry::{DeviceRegistry, RegistryEvent, SharedDeviceRegistry};
pub use session::{DeviceIdentity, DeviceSession};

/// LuxLink devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<()> {
    tracing::info!("LuxLink Devices {} initialized", VERSION);
    Ok(())
}
