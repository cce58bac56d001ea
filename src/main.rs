use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use procbatch::batch::{DirectorySink, WriterSink};
use procbatch::config::decode_escapes;
use procbatch::{CommandSpec, Gateway, GatewayConfig, LoopExit, TriggerLoop};
use std::path::PathBuf;
use tracing::{debug, error, info, trace};
use tracing_subscriber::EnvFilter;

/// Batch the output of a long-running subprocess
#[derive(Parser)]
#[command(name = "procbatch", version)]
#[command(about = "Frame a subprocess's stdout into messages and emit them in batches", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the subprocess and emit batches until it exits or Ctrl-C
    Run {
        #[command(flatten)]
        settings: SettingsArgs,

        /// Write each unit to its own file in this directory instead of stdout
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Written after each unit on stdout (escapes decoded)
        #[arg(long, default_value = "\\n")]
        record_separator: String,
    },
    /// Validate the configuration and print it with defaults filled in
    Config {
        #[command(flatten)]
        settings: SettingsArgs,

        /// Print as JSON instead of YAML
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct SettingsArgs {
    /// Path to a YAML or TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Command line to run, split on whitespace
    #[arg(long)]
    command: Option<String>,

    /// Messages per output unit
    #[arg(short = 'b', long)]
    batch_size: Option<usize>,

    /// Maximum number of queued messages
    #[arg(short = 'q', long)]
    queue_size: Option<usize>,

    /// Delimiter placed between messages of a unit (escapes decoded)
    #[arg(short = 'd', long)]
    delimiter: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match &cli.command {
        Commands::Run { settings, .. } | Commands::Config { settings, .. } => settings,
    };
    let config = match resolve_config(settings) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(2);
        }
    };

    init_tracing(cli.verbose, &config.log_level);
    debug!("procbatch started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match cli.command {
        Commands::Run {
            output_dir,
            record_separator,
            ..
        } => run(config, output_dir, record_separator).await,
        Commands::Config { json, .. } => print_config(&config, json),
    };

    if let Err(e) = result {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8, configured_level: &str) {
    let level = match verbose {
        0 => configured_level,
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Stdout carries output units
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .with_line_number(verbose >= 2)
        .init();
}

fn resolve_config(settings: &SettingsArgs) -> anyhow::Result<GatewayConfig> {
    let mut config = match &settings.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            let command = settings
                .command
                .clone()
                .or_else(|| std::env::var("PROCBATCH_COMMAND").ok())
                .context("No command given; pass --command, --config or set PROCBATCH_COMMAND")?;
            let mut config = GatewayConfig::new(command);
            config.apply_env_overrides()?;
            config
        }
    };

    if let Some(command) = &settings.command {
        config.command = CommandSpec::Line(command.clone());
    }
    if let Some(batch_size) = settings.batch_size {
        config.max_batch_size = batch_size;
    }
    if let Some(queue_size) = settings.queue_size {
        config.max_queue_size = queue_size;
    }
    if let Some(delimiter) = &settings.delimiter {
        config.message_delimiter = delimiter.clone();
    }

    config.validate()?;
    Ok(config)
}

fn print_config(config: &GatewayConfig, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        print!("{}", config.to_yaml()?);
    }
    Ok(())
}

async fn run(
    config: GatewayConfig,
    output_dir: Option<PathBuf>,
    record_separator: String,
) -> anyhow::Result<()> {
    let gateway = Gateway::start(&config)
        .with_context(|| format!("Failed to start gateway for `{}`", config.command))?;
    let trigger_loop = TriggerLoop::new(&gateway, config.scheduler.clone());
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let (exit, summary) = match output_dir {
        Some(dir) => {
            let mut sink = DirectorySink::new(&dir)
                .await
                .with_context(|| format!("Failed to prepare output directory {}", dir.display()))?;
            trigger_loop.run(&mut sink, ctrl_c).await
        }
        None => {
            let separator = decode_escapes(&record_separator).into_bytes();
            let mut sink = WriterSink::with_separator(tokio::io::stdout(), separator);
            trigger_loop.run(&mut sink, ctrl_c).await
        }
    };

    let outcome = gateway.shutdown().await;
    info!(
        ?exit,
        ticks = summary.ticks,
        units = summary.units_emitted,
        failures = summary.failures,
        dropped = gateway.dropped_messages(),
        stop = ?outcome,
        "Finished"
    );

    if exit == LoopExit::Shutdown {
        debug!("Stopped by Ctrl-C");
    }
    Ok(())
}
