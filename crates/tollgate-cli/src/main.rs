//! Tollgate CLI entrypoint.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::{Commands, ConfigCommands, LogFormat};
use config::{CliConfig, OutputFormat};

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(author, version, about = "Tollgate pipeline orchestrator", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Local credentials for the env secret provider
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config = CliConfig::load().unwrap_or_default();

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Plan { path, event } => handlers::plan(&path, &event)?,
        Commands::Run {
            path,
            event,
            approve,
            registry_dir,
            registry_url,
            secrets_file,
            max_parallel,
            workspace,
            json,
        } => {
            let (registry_url, registry_dir) = match (registry_url, registry_dir) {
                (None, None) => (config.registry_url.clone(), config.registry_dir.clone()),
                flags => flags,
            };
            let options = handlers::RunOptions {
                approve,
                registry_dir,
                registry_url,
                secrets_file: secrets_file.or(config.secrets_file.clone()),
                max_parallel: max_parallel.or(config.max_parallel),
                workspace,
                json: json || config.output_format == OutputFormat::Json,
            };
            return handlers::run(&config, &path, &event, options).await;
        }
        Commands::Stamp { base, at } => handlers::stamp(&base, at.as_deref())?,
        Commands::Schema => handlers::schema()?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(ExitCode::SUCCESS)
}
