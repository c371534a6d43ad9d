//! Core domain types for the activity time ledger.
//!
//! This crate contains:
//! - Validated identifiers for users and activities
//! - The in-progress [`Session`] record
//! - The versioned on-disk encoding of accumulated durations

pub mod codec;
mod session;
mod types;

pub use codec::{DecodeError, decode_nanos, encode_nanos};
pub use session::Session;
pub use types::{ActivityName, UserId, ValidationError};
