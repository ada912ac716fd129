pub mod api;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod retry;
pub mod telemetry;
pub mod tracing;

pub use api::*;
pub use config::*;
pub use errors::*;
pub use metrics::*;
pub use retry::*;
pub use telemetry::*;
