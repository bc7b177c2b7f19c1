use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use compute_core::app::ApplicationBuilder;
use compute_core::config::Cli;
use compute_core::config::Commands;
use compute_core::config::DaemonArgs;
use compute_core::config::ShowRegistryArgs;
use compute_core::logging;
use compute_core::models::ModelRegistry;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ShowRegistry(show_registry_args) => run_show_registry(show_registry_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.metrics_file.as_ref())?;

    tracing::info!("Starting compute daemon {}", &**version::VERSION);

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}

fn run_show_registry(args: ShowRegistryArgs) -> Result<()> {
    let registry = ModelRegistry::load(&args.registry_file)
        .with_context(|| format!("load registry {}", args.registry_file.display()))?;

    let models = match &args.operation {
        Some(operation) => registry.by_operation(operation),
        None => registry.list(),
    };

    if args.json {
        let by_id: std::collections::BTreeMap<_, _> =
            models.iter().map(|info| (&info.model_id, *info)).collect();
        println!("{}", serde_json::to_string_pretty(&by_id)?);
        return Ok(());
    }

    println!(
        "{:<24} {:<20} {:<10} {:>10} {:>12}  OPERATIONS",
        "MODEL", "TYPE", "VERSION", "SIZE MB", "GPU MEM MB"
    );
    for info in models {
        println!(
            "{:<24} {:<20} {:<10} {:>10.1} {:>12}  {}",
            info.model_id,
            format!("{:?}", info.model_type),
            info.version,
            info.size_mb,
            info.gpu_memory_required,
            info.supported_operations.join(",")
        );
    }
    Ok(())
}
