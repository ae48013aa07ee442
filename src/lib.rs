//! Remote control client for media player servers.
//!
//! The [`infrastructure::comm`] module holds the communication subsystem;
//! [`domain`] holds the values exchanged with the server and the persisted
//! settings.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod presentation;

pub use error::{Error, Result};
