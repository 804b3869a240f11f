/*!
 * LuxLink Core
 *
 * This crate provides the shared foundation for the LuxLink system:
 * error handling, the data-point value model, configuration and logging.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;

/// LuxLink core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("LuxLink Core {} initialized", VERSION);
    Ok(())
}
