mod config;
mod reporter;

pub use config::*;
pub use reporter::*;
