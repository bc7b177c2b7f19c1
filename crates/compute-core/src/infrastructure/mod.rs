pub mod artifacts;
pub mod logging;
pub mod metrics;
