// bwcontrol - bandwidth accounting, quota and tethering-stats controller

pub mod backends;
pub mod bandwidth;
pub mod command;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tether;

#[cfg(test)]
mod testing;

pub use bandwidth::BandwidthController;
pub use error::{BandwidthError, Result};
