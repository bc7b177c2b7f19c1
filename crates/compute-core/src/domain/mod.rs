pub mod clock;
pub mod devices;
pub mod error;
pub mod memory;
pub mod models;
pub mod scheduler;
