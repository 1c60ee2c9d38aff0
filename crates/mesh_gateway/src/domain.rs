mod gateway_stats;
mod identity_cache;
mod identity_resolver;
mod mesh_message_handler;
mod message_router;

pub use gateway_stats::*;
pub use identity_cache::*;
pub use identity_resolver::*;
pub use mesh_message_handler::*;
pub use message_router::*;
