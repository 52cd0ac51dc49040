//! Rust implementation of the IBM 3270 data stream (TN3270 / TN3270E)
//!
//! This module holds everything that is specific to 3270 terminals and
//! independent of the telnet transport:
//!
//! - [`codes`] - command, order, WCC, AID and attribute constants
//! - [`field`] - field attribute predicates and extended attributes
//! - [`display`] - the screen buffer, its addressing and field model
//! - [`protocol`] - inbound data stream processing and inbound read replies
//! - [`tn3270e`] - TN3270E (RFC 2355) headers, functions and responses
//!
//! # Example Usage
//!
//! ```rust
//! use tn3270r::lib3270::{DataStreamProcessor, ScreenBuffer, ScreenSize};
//!
//! let mut screen = ScreenBuffer::new(ScreenSize::Model2);
//! let mut processor = DataStreamProcessor::new();
//!
//! // Erase/Write, WCC restore, then "HI" in EBCDIC
//! let result = processor.process_ds(&mut screen, &[0xF5, 0x02, 0xC8, 0xC9]);
//! assert!(!result.is_error());
//! assert_eq!(screen.row_text(0).trim_end(), "HI");
//! ```

pub mod codes;
pub mod display;
pub mod field;
pub mod protocol;
pub mod tn3270e;

pub use codes::{AidKey, CommandCode, OrderCode};
pub use display::{addressing, CharSet, DbcsState, InsertRoom, ReplyMode, ScreenBuffer, ScreenCell, ScreenSize};
pub use field::ExtendedAttributes;
pub use protocol::{read_buffer, read_modified, DataStreamProcessor, HostWrite, PdsResult};
pub use tn3270e::{Function, FunctionSet, LuCandidates, Submode, Tn3270eHeader, Tn3270eState};
