pub mod cli;
pub mod daemon;
pub mod devices;
pub mod registry;
pub mod scheduling;

pub use cli::*;
pub use daemon::*;
pub use devices::*;
pub use registry::*;
pub use scheduling::*;
