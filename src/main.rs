//! phantom-host - run functions inside a supervised interpreter process.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use phantom_host::bridge::{BridgeError, Launcher};
use phantom_host::config::{BridgeConfig, ConfigError, ConfigLoader};

#[derive(Parser)]
#[command(
    name = "phantom-host",
    about = "Run functions inside a supervised interpreter process",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file to use instead of the default search paths.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a function and print its JSON result.
    Run {
        /// Function source, e.g. `function(){ return 2 + 2; }`.
        function: String,
        /// Code evaluated in the global context before the run (repeatable).
        #[arg(short, long)]
        load: Vec<String>,
        /// Interpreter binary (overrides config).
        #[arg(long)]
        binary: Option<String>,
        /// Companion script (overrides config).
        #[arg(long)]
        script: Option<PathBuf>,
        /// Working directory of the interpreter (overrides config).
        #[arg(long)]
        working_dir: Option<PathBuf>,
        /// Kill the interpreter after the force timeout instead of waiting.
        #[arg(long)]
        force: bool,
        /// Extra launch flags passed to the interpreter.
        #[arg(last = true)]
        args: Vec<String>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("Failed to encode result: {0}")]
    Output(#[from] serde_json::Error),
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<BridgeConfig, ConfigError> {
    match path {
        Some(path) => ConfigLoader::with_path(path).load(),
        None => ConfigLoader::new().load(),
    }
}

async fn run_function(
    mut config: BridgeConfig,
    function: &str,
    loads: &[String],
    force: bool,
    args: Vec<String>,
) -> Result<serde_json::Value, CliError> {
    config.args.extend(args);
    let launcher = Launcher::from_config(&config).map_err(BridgeError::from)?;
    let interpreter = launcher.start(Vec::<String>::new())?;

    let outcome = async {
        for code in loads {
            interpreter.load(code).await?;
        }
        interpreter.run::<serde_json::Value>(function).await
    }
    .await;

    let shutdown = if force {
        interpreter.force_shutdown().await
    } else {
        interpreter.exit().await
    };
    if let Err(e) = shutdown {
        tracing::warn!(error = %e, "Interpreter shutdown failed");
    }

    Ok(outcome?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Run {
            function,
            load,
            binary,
            script,
            working_dir,
            force,
            args,
        } => {
            let mut config = config;
            if let Some(binary) = binary {
                config.binary = binary;
            }
            if script.is_some() {
                config.script = script;
            }
            if working_dir.is_some() {
                config.working_dir = working_dir;
            }
            tracing::info!(binary = %config.binary, force, "Running function");

            let result = run_function(config, &function, &load, force, args)
                .await
                .and_then(|value| Ok(serde_json::to_string_pretty(&value)?));
            match result {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    tracing::error!(error = %e, "Run failed");
                    eprintln!("error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
