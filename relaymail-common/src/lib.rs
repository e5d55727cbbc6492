pub mod address;
pub mod config;
pub mod logging;

pub use tracing;
