//! Courier CLI - Command-line front end for the courier client
//!
//! Provides subcommands for dry-running messages, reading HyperBEAM compute
//! paths, querying the GraphQL gateways and managing the config file.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use courier::client::config::{load_or_default, write_config};
use courier::client::{
    ClientConfig, ComputeQuery, Courier, Request, ResponseEnvelope, StaticIdentity, Tag,
    TransactionQuery, ValidationPolicy, WalletInfo,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Resilient request dispatch for AO processes", long_about = None)]
struct Cli {
    /// Config file (or directory containing courier.json)
    #[arg(short, long, default_value = "courier.json")]
    config: PathBuf,

    /// Give up after this many attempts
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ComputeArgs {
    /// Process id
    #[arg(long)]
    pid: String,

    /// Evaluate live instead of reading the cache
    #[arg(long)]
    now: bool,

    /// Slot to evaluate at
    #[arg(long)]
    slot: Option<u64>,

    /// Request the raw body instead of structured JSON
    #[arg(long)]
    raw: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a message against a process without committing it
    DryRun {
        /// Process id
        #[arg(long)]
        pid: String,

        /// Tags as Name=Value (repeatable)
        #[arg(short, long = "tag", value_parser = parse_pair)]
        tags: Vec<(String, String)>,

        /// Message data
        #[arg(long)]
        data: Option<String>,

        /// Owner address reported to the process
        #[arg(long, default_value = "courier-cli")]
        owner: String,
    },

    /// Read a cached compute path
    Compute {
        #[command(flatten)]
        target: ComputeArgs,

        /// Path under the process, e.g. `info`
        path: String,

        /// Omit the /cache segment
        #[arg(long)]
        no_cache_prefix: bool,
    },

    /// Call a module method through the compute path
    Call {
        #[command(flatten)]
        target: ComputeArgs,

        /// Method name
        method: String,

        /// Parameters as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_pair)]
        params: Vec<(String, String)>,

        /// Module id
        #[arg(long)]
        module: Option<String>,
    },

    /// Find transactions through the GraphQL gateways
    Graphql {
        /// Recipient process id (repeatable)
        #[arg(long)]
        recipient: Vec<String>,

        /// Tag filter as Name=Value (repeatable)
        #[arg(short, long = "tag", value_parser = parse_pair)]
        tags: Vec<(String, String)>,

        /// Page size
        #[arg(long, default_value = "10")]
        first: u32,
    },

    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default config
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective config
    Show,
}

fn parse_pair(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected Name=Value, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let attempts = cli.max_attempts;

    match cli.command {
        Commands::DryRun {
            pid,
            tags,
            data,
            owner,
        } => {
            let courier = connect(&cli.config, attempts, &owner)?;
            let mut request =
                Request::dry_run(pid).tags(tags.into_iter().map(|(n, v)| Tag::new(n, v)));
            if let Some(data) = data {
                request = request.data(data);
            }
            print_completion(courier.send(request).await, Shape::Envelope)?;
        }

        Commands::Compute {
            target,
            path,
            no_cache_prefix,
        } => {
            let courier = connect(&cli.config, attempts, "courier-cli")?;
            let query = ComputeQuery::Static {
                cache_path: path,
                add_cache_prefix: !no_cache_prefix,
                now: target.now,
                slot: target.slot,
                serialize: !target.raw,
            };
            let request =
                Request::compute_path(target.pid, query).validation(ValidationPolicy::lenient());
            print_completion(courier.send(request).await, Shape::Payload)?;
        }

        Commands::Call {
            target,
            method,
            params,
            module,
        } => {
            let courier = connect(&cli.config, attempts, "courier-cli")?;
            let query = ComputeQuery::Dynamic {
                method,
                params,
                module_id: module,
                now: target.now,
                slot: target.slot,
                serialize: !target.raw,
            };
            let request =
                Request::compute_path(target.pid, query).validation(ValidationPolicy::lenient());
            print_completion(courier.send(request).await, Shape::Payload)?;
        }

        Commands::Graphql {
            recipient,
            tags,
            first,
        } => {
            let courier = connect(&cli.config, attempts, "courier-cli")?;
            let mut query = TransactionQuery::new().first(first);
            for id in recipient {
                query = query.recipient(id);
            }
            for (name, value) in tags {
                query = query.tag(name, [value]);
            }
            let nodes = courier.graphql().transactions(&query, None).await?;
            println!("{}", serde_json::to_string_pretty(&nodes)?);
        }

        Commands::Config { action } => run_config(&cli.config, &action)?,
    }

    Ok(())
}

fn connect(path: &Path, max_attempts: u32, owner: &str) -> Result<Courier> {
    let mut config = load_or_default(path)?.with_env_overrides();
    config.handler.max_attempts = Some(max_attempts.max(1));
    let identity = Arc::new(StaticIdentity::with_default(WalletInfo::new(owner)));
    Courier::connect(config, identity).context("Failed to build client")
}

fn run_config(path: &Path, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!("{:?} already exists (use --force to overwrite)", path);
            }
            write_config(path, &ClientConfig::default())?;
            println!("Wrote default config to {:?}", path);
        }
        ConfigAction::Show => {
            let config = load_or_default(path)?.with_env_overrides();
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

/// What to print for a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    /// The parsed AO envelope (dry runs and messages)
    Envelope,
    /// The unwrapped compute body, which rarely has envelope keys
    Payload,
}

fn render(envelope: &ResponseEnvelope, shape: Shape) -> Result<String> {
    let text = match shape {
        Shape::Envelope => serde_json::to_string_pretty(envelope)?,
        Shape::Payload => serde_json::to_string_pretty(envelope.payload())?,
    };
    Ok(text)
}

fn print_completion(completion: courier::Completion, shape: Shape) -> Result<()> {
    match completion {
        Ok(envelope) => {
            println!("{}", render(&envelope, shape)?);
            Ok(())
        }
        Err(failure) => {
            if let Some(envelope) = &failure.envelope {
                eprintln!("{}", render(envelope, shape)?);
            }
            Err(failure.into())
        }
    }
}
