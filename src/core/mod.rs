//! Shared primitives: error taxonomy, value codec, clock and configuration.

pub mod codec;
pub mod config;
pub mod error;
pub mod time;
