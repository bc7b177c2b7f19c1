pub mod app;
pub mod config;
mod domain;
mod infrastructure;

// Re-export main modules
pub use domain::clock;
pub use domain::devices;
pub use domain::error;
pub use domain::memory;
pub use domain::models;
pub use domain::scheduler;
pub use infrastructure::artifacts;
pub use infrastructure::logging;
pub use infrastructure::metrics;
