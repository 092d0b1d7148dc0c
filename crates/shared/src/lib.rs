//! Shared types and wire-format handling for the supportdesk chat channel.
//!
//! Everything in this crate is pure: no I/O, no logging. The client crate
//! owns the connection and decides what to do with the errors returned here.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
