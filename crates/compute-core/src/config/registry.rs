use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct ShowRegistryArgs {
    #[arg(
        long,
        help = "Path of the model registry JSON file",
        env = "COMPUTE_MODEL_REGISTRY",
        value_hint = clap::ValueHint::FilePath,
        default_value = "models/registry.json"
    )]
    pub registry_file: PathBuf,

    #[arg(long, help = "Only list models supporting this operation")]
    pub operation: Option<String>,

    #[arg(long, help = "Print the raw JSON document instead of a table")]
    pub json: bool,
}
