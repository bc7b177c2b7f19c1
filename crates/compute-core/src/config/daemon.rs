use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "COMPUTE_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/logs/metrics.log",
        help = "Path for line-protocol metrics, e.g. /logs/metrics.log"
    )]
    pub metrics_file: Option<PathBuf>,

    #[arg(
        long,
        env = "COMPUTE_DEVICES_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML device inventory (id, name, memoryMb); a single simulated 8 GB device when omitted"
    )]
    pub devices_file: Option<PathBuf>,

    #[arg(
        long,
        env = "COMPUTE_SCHEDULING_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML scheduling configuration (scheduler, memory, models, telemetry sections)"
    )]
    pub scheduling_config: Option<PathBuf>,

    #[arg(
        long,
        env = "COMPUTE_MODEL_REGISTRY",
        value_hint = clap::ValueHint::FilePath,
        default_value = "models/registry.json",
        help = "Model registry JSON file, rewritten on every registration"
    )]
    pub registry_file: PathBuf,

    #[arg(
        long,
        env = "COMPUTE_MODELS_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "models",
        help = "Directory holding model artifacts and staged downloads"
    )]
    pub models_dir: PathBuf,

    #[arg(
        long,
        env = "COMPUTE_NODE_NAME",
        default_value = "local",
        help = "Node name, only used in metrics output"
    )]
    pub node_name: String,

    #[arg(
        long,
        help = "Enable metrics collection",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_metrics: bool,

    #[arg(
        long,
        default_value = "10",
        help = "Seconds between metrics reports"
    )]
    pub metrics_interval_secs: u64,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds between memory monitor samples"
    )]
    pub memory_monitor_interval_secs: u64,

    #[arg(
        long,
        help = "Relieve memory pressure automatically from the memory monitor",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub auto_pressure_relief: bool,

    #[arg(long, help = "Override the model cache size from the scheduling config")]
    pub max_cache_size: Option<usize>,

    #[arg(
        long,
        help = "Override whether missing artifacts may be downloaded",
        action = clap::ArgAction::Set
    )]
    pub enable_download: Option<bool>,

    #[arg(
        long,
        help = "Override whether models may fall back to the CPU",
        action = clap::ArgAction::Set
    )]
    pub enable_cpu_fallback: Option<bool>,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Model ids to load at startup, comma separated"
    )]
    pub preload: Vec<String>,
}
