mod config;
mod error;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gateway::{McpRegistry, MetaServer, Operation, ToolCatalog};
use mcp::CallToolResult;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use config::Config;
use error::{Error, Result};

const CONFIG_FILE: &str = "switchboard.toml";

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "One tool surface over many tool servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: ./switchboard.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available tools
    Discover {
        /// Page size (1-100)
        #[arg(short, long, default_value_t = gateway::DEFAULT_LIMIT as i64, allow_negative_numbers = true)]
        limit: i64,
        /// Number of tools to skip
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        offset: i64,
    },
    /// Show how to call a tool
    Inspect {
        /// Tool name or id
        name: String,
    },
    /// Call a tool
    Invoke {
        /// Tool name or id
        name: String,
        /// Tool arguments as a JSON object
        #[arg(short, long)]
        params: Option<String>,
    },
    /// Run an orchestration script
    Orchestrate {
        /// Script file, or - for stdin
        file: PathBuf,
        /// Script deadline in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(result) => {
            for text in result.content.iter().filter_map(|c| c.as_text()) {
                println!("{text}");
            }
            if result.is_error {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<CallToolResult> {
    let config = load_config(cli.config.as_deref())?;
    let operation = operation(cli.command)?;

    let registry = Arc::new(McpRegistry::new());
    let configured = config.providers.len();
    let connected = registry.connect_all(config.provider_configs()).await;
    tracing::info!(connected, configured, "providers started");

    let catalog = Arc::new(ToolCatalog::with_ttl(registry.clone(), config.catalog_ttl()));
    let server = MetaServer::with_options(catalog, config.meta_options());
    let result = server.execute(operation).await;

    registry.shutdown().await;
    Ok(result)
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) if !path.exists() => Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        }),
        Some(path) => Ok(Config::load(path)?),
        None if Path::new(CONFIG_FILE).exists() => Ok(Config::load(CONFIG_FILE)?),
        None => Ok(Config::default_config()),
    }
}

/// Map a sub-command onto a meta operation, with the same argument
/// handling a protocol caller gets.
fn operation(command: Commands) -> Result<Operation> {
    let args = match &command {
        Commands::Discover { limit, offset } => serde_json::json!({
            "limit": limit,
            "offset": offset,
        }),
        Commands::Inspect { name } => serde_json::json!({ "name": name }),
        Commands::Invoke { name, params } => {
            let params: Value = match params {
                Some(raw) => serde_json::from_str(raw)?,
                None => Value::Null,
            };
            serde_json::json!({ "name": name, "params": params })
        }
        Commands::Orchestrate { file, timeout_ms } => serde_json::json!({
            "code": read_script(file)?,
            "timeoutMs": timeout_ms,
        }),
    };
    let name = match command {
        Commands::Discover { .. } => "discover",
        Commands::Inspect { .. } => "inspect",
        Commands::Invoke { .. } => "invoke",
        Commands::Orchestrate { .. } => "orchestrate",
    };
    Ok(Operation::parse(name, &args)?)
}

fn read_script(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut code = String::new();
        std::io::stdin().read_to_string(&mut code)?;
        Ok(code)
    } else {
        Ok(std::fs::read_to_string(file)?)
    }
}
