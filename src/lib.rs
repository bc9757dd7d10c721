//! payoutd bridges a Redis JSON request/response API to a pair of ITL cash
//! peripherals (a SMART Hopper and a SMART Payout note validator) attached
//! over a serial line speaking the vendor's encrypted SSP protocol.
//!
//! The daemon subscribes to `hopper-request` and `validator-request`,
//! translates commands into encrypted SSP frames, publishes the replies on
//! the matching response topics and forwards device-originated poll events
//! to `hopper-event` / `validator-event`.

pub mod bus;
pub mod daemon;
pub mod device;
pub mod error;
pub mod events;
pub mod handler;
pub mod mock;
pub mod ssp;
pub mod transport;

pub use daemon::{Config, Daemon};
pub use error::{Error, Result};
