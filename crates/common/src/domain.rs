mod key_value_store;
mod mesh_message;
mod node;
mod position_report;
mod result;
mod sanitize;

pub use key_value_store::*;
pub use mesh_message::*;
pub use node::*;
pub use position_report::*;
pub use result::*;
pub use sanitize::*;
