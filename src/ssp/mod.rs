//! The SSP protocol stack: framing, encryption, session exchange, the
//! command catalog and poll event parsing.

pub mod commands;
pub mod crc;
pub mod crypto;
pub mod frame;
pub mod link;
pub mod poll;
mod status;

pub use link::{ExchangeOptions, SessionState, SspLink};
pub use status::ResponseStatus;
