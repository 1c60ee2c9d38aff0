//! Embedded durable store backed by a single SQLite file.

mod config;
mod key_value_store;

pub use config::*;
pub use key_value_store::*;
