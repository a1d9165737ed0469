//! FerroLift - transfer orchestration from the command line
//!
//! Runs an in-process dispatcher and worker pool against the local filesystem, submits one
//! transfer and follows it to a terminal status.

mod display;
mod progress;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use ferrolift_config::{Config, ConfigLoader, LoggingConfig};
use ferrolift_engine::{EngineBuilder, TransferEngine, TransferRequest};
use ferrolift_io::LocalFsAdapter;
use ferrolift_types::{TaskStatus, TopTask};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use crate::progress::TransferProgress;

/// Storage system id served by the local filesystem adapter
const LOCAL_SYSTEM: &str = "file";

/// FerroLift - multi-tenant transfer orchestration
#[derive(Parser)]
#[command(
    name = "ferrolift",
    version = env!("CARGO_PKG_VERSION"),
    about = "Orchestrate file transfers with retries, cancellation and progress",
    long_about = "FerroLift splits a transfer into per-element and per-file tasks, dispatches\n\
                  them fairly to a pool of workers and follows them to completion."
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Quiet mode - minimal output
    #[arg(short, long)]
    quiet: bool,

    /// Verbose mode - detailed output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy files and directories
    Copy {
        /// Source paths or file:// URIs
        #[arg(required = true)]
        sources: Vec<String>,
        /// Destination path or file:// URI
        #[arg(long = "to")]
        destination: String,
        /// A missing or failing source does not fail the transfer
        #[arg(long)]
        optional: bool,
        /// Tenant submitting the transfer
        #[arg(long, default_value = "default")]
        tenant: String,
        /// Owning user
        #[arg(long, default_value = "ferrolift")]
        user: String,
        /// Free-form label
        #[arg(long)]
        tag: Option<String>,
        /// Number of workers
        #[arg(short, long, default_value = "2")]
        workers: usize,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
        /// Write the configuration to this file instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Output format when printing
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum ConfigFormat {
    Yaml,
    Toml,
    Json,
}

impl ConfigFormat {
    fn extension(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Toml => "toml",
            Self::Json => "json",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let _guard = init_logging(&config.logging, cli.debug, cli.quiet, cli.verbose)?;
    info!("FerroLift v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Copy {
            sources,
            destination,
            optional,
            tenant,
            user,
            tag,
            workers,
            json,
        } => {
            let request = build_request(&sources, &destination, optional, tenant, user, tag)?;
            copy_command(config, request, workers, cli.quiet || json, json).await
        }
        Commands::Config {
            default,
            output,
            format,
        } => {
            let config = if default { Config::default() } else { config };
            config_command(&config, output, format)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => ConfigLoader::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConfigLoader::load_default()?,
    };
    Ok(config)
}

fn init_logging(
    logging: &LoggingConfig,
    debug: bool,
    quiet: bool,
    verbose: bool,
) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else if quiet {
        "error"
    } else {
        logging.level.as_str()
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow!("Invalid log filter '{}': {}", level, e))?;

    let (writer, guard) = match &logging.log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow!("Log file path {} has no file name", path.display()))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer);
    let installed = if logging.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to initialise logging: {}", e))?;

    Ok(guard)
}

/// Accept `file://` URIs as given; turn plain paths into absolute `file://` URIs
fn to_uri(input: &str) -> Result<String> {
    if input.contains("://") {
        return Ok(input.to_string());
    }
    let path = Path::new(input);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to read the current directory")?
            .join(path)
    };
    url::Url::from_file_path(&absolute)
        .map(|url| url.to_string())
        .map_err(|()| anyhow!("Cannot express {} as a file URI", absolute.display()))
}

/// Last path segment of a source, used to place it below a shared destination
fn base_name(uri: &str) -> Result<String> {
    let url = url::Url::parse(uri).with_context(|| format!("Invalid URI '{}'", uri))?;
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Source '{}' has no file name", uri))
}

fn build_request(
    sources: &[String],
    destination: &str,
    optional: bool,
    tenant: String,
    user: String,
    tag: Option<String>,
) -> Result<TransferRequest> {
    let destination = to_uri(destination)?;
    let mut request = TransferRequest::new(tenant, user);
    if let Some(tag) = tag {
        request = request.with_tag(tag);
    }

    for source in sources {
        let source = to_uri(source)?;
        let target = if sources.len() == 1 {
            destination.clone()
        } else {
            format!("{}/{}", destination.trim_end_matches('/'), base_name(&source)?)
        };
        request = if optional {
            request.with_optional_element(source, target)
        } else {
            request.with_element(source, target)
        };
    }

    request.validate()?;
    Ok(request)
}

async fn copy_command(
    config: Config,
    request: TransferRequest,
    workers: usize,
    quiet: bool,
    json: bool,
) -> Result<()> {
    if workers == 0 {
        bail!("--workers must be at least 1");
    }
    if !quiet {
        for element in &request.elements {
            println!(
                "{} Copying {} to {}",
                style("→").green().bold(),
                style(&element.source).cyan(),
                style(&element.destination).cyan()
            );
        }
    }

    let engine = EngineBuilder::new()
        .with_config(config)
        .with_workers(workers)
        .build()
        .await?;
    engine
        .registry()
        .register(LOCAL_SYSTEM, Arc::new(LocalFsAdapter::new()))
        .await;
    engine.start().await?;

    let top = engine.submit(request).await?;
    info!("Submitted transfer {}", top.id);

    let followed = follow(&engine, &top, quiet).await;
    let shutdown = engine.shutdown().await;
    let top = followed?;
    shutdown?;

    let parents = engine.parents_of(top.id).await?;
    let stats = engine.statistics().await;
    if json {
        let summary = display::summary_json(&top, &parents, &stats);
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if !quiet {
        display::print_summary(&top, &parents, &stats);
    }

    if top.status != TaskStatus::Completed {
        bail!(
            "Transfer {} finished as {}{}",
            top.id,
            top.status,
            top.error
                .as_deref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        );
    }
    info!("Transfer {} completed", top.id);
    Ok(())
}

/// Poll the transfer until it is terminal; Ctrl-C requests cancellation
async fn follow(engine: &TransferEngine, top: &TopTask, quiet: bool) -> Result<TopTask> {
    let progress = TransferProgress::new(quiet);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            interrupted = tokio::signal::ctrl_c(), if !cancel_sent => {
                interrupted.context("Failed to listen for Ctrl-C")?;
                progress.cancelling();
                engine.cancel(top.id).await?;
                cancel_sent = true;
            }
            _ = ticker.tick() => {
                let current = engine.get_top(top.id).await?;
                let parents = engine.parents_of(top.id).await?;
                progress.update(&current, &parents);
                if current.status.is_terminal() {
                    progress.finish(&current);
                    return Ok(current);
                }
            }
        }
    }
}

fn config_command(config: &Config, output: Option<PathBuf>, format: ConfigFormat) -> Result<()> {
    match output {
        Some(path) => {
            ConfigLoader::save_to_file(config, &path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "{} Configuration written to {}",
                style("⚙").blue().bold(),
                style(path.display()).cyan()
            );
        }
        None => {
            print!("{}", ConfigLoader::render(config, Some(format.extension()))?);
        }
    }
    Ok(())
}
