pub mod domain;
pub mod sqlite;
pub mod telemetry;
pub mod validation;

pub use domain::*;
pub use sqlite::*;
pub use telemetry::*;
pub use validation::*;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockKeyValueStore;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockPositionReporter;
