//! `busimap-core`: configuration, errors and value types shared by every
//! BusiMap crate.

pub mod config;
pub mod error;
pub mod types;

pub use error::{BusimapError, Result};
