mod caltopo;
mod domain;
mod mesh_gateway;
mod mqtt;

pub use caltopo::*;
pub use domain::*;
pub use mesh_gateway::*;
pub use mqtt::*;
