use capture_service::{load_config, setup_logging, Cli, CliRunner, Commands, Config};
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting capture-service v{}", env!("CARGO_PKG_VERSION"));

    let command = args
        .command
        .take()
        .unwrap_or(Commands::Serve { bind: None, port: None });

    // `validate` checks its own file and must not fail on a bad --config
    let config = match &command {
        Commands::Validate { .. } => Config::default(),
        _ => load_config(&args).await?,
    };

    let result = CliRunner::new(config).run(command).await;

    if let Err(e) = &result {
        error!("Application error: {:#}", e);
    }

    info!("capture-service stopped");
    result
}
