use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::registry::ShowRegistryArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the compute daemon
    Daemon(Box<DaemonArgs>),
    /// Print the model registry
    #[command(name = "show-registry")]
    ShowRegistry(ShowRegistryArgs),
}
