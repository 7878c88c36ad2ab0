use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_mcp_runtime::{McpCommands, run as run_mcp};

#[derive(Parser)]
#[command(
    name = "tether-mcp",
    version,
    about = "Tether MCP server: drives a game agent session over stdio"
)]
struct Cli {
    /// Address of the simulation bridge sidecar
    #[arg(long, env = "TETHER_BRIDGE_ADDR", default_value = "127.0.0.1:25580")]
    bridge_addr: String,

    /// Per-request deadline for bridge calls, in milliseconds
    #[arg(long, env = "TETHER_BRIDGE_TIMEOUT_MS", default_value_t = 10_000)]
    bridge_timeout_ms: u64,

    #[command(subcommand)]
    command: McpCommands,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    // stdout carries the protocol, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_core=info,tether_mcp_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_millis(cli.bridge_timeout_ms.max(1));
    let code = run_mcp(&cli.bridge_addr, timeout, cli.command).await;
    std::process::exit(code);
}
