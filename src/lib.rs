//! tn3270r: an IBM 3270 terminal emulator core
//!
//! The Telnet/TN3270E protocol engine, the 3270 screen buffer and data
//! stream processor, and the keyboard-lock engine, tied together by a
//! single-threaded connection controller.

/// LIB3270: 3270 data stream, screen buffer and TN3270E definitions
pub mod lib3270;

pub mod ansi_processor;
pub mod config;
pub mod controller;
pub mod ebcdic;
pub mod error;
pub mod host;
pub mod keyboard;
pub mod network;
pub mod telnet_negotiation;

pub use controller::{Controller, StateTopic};
pub use error::{TN3270Error, TN3270Result};
