use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rosie::config::AppConfig;
use rosie::context::AppContext;
use rosie::core::{
    BoardRunner, JobQueue, NodeAgent, NodeStatus, ReportAssembler, create_controller, create_sink,
};
use rosie::logging::{self, LogConfig};
use rosie::web::WebServer;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rosie")]
#[command(about = "Hardware-in-the-loop test dispatch node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ./rosie.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the dispatch API
    Serve(NodeArgs),
    /// Run the agent that executes queued jobs on this node's boards
    Agent(NodeArgs),
    /// Serve the API and run the agent in one process
    Node(NodeArgs),
    /// Print this node's status as JSON
    Status(NodeArgs),
    /// Test a commit on every board right away, bypassing the queue
    Run(RunArgs),
}

#[derive(Args, Serialize)]
struct NodeArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    node_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    http_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    /// Shared queue database file
    #[serde(skip)]
    #[arg(long)]
    queue_path: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    /// Firmware commit to test
    commit: String,

    #[command(flatten)]
    node: NodeArgs,
}

/// CLI flags in the shape of `AppConfig`, for the top configuration layer.
#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(flatten)]
    args: &'a NodeArgs,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue: Option<QueueOverride<'a>>,
}

#[derive(Serialize)]
struct QueueOverride<'a> {
    path: &'a Path,
}

impl Commands {
    fn node_args(&self) -> &NodeArgs {
        match self {
            Commands::Serve(args)
            | Commands::Agent(args)
            | Commands::Node(args)
            | Commands::Status(args) => args,
            Commands::Run(args) => &args.node,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = cli.command.node_args();
    let overrides = Overrides {
        args,
        queue: args.queue_path.as_deref().map(|path| QueueOverride { path }),
    };
    let config = AppConfig::new(cli.config.as_deref(), Some(&overrides))?;

    logging::init(LogConfig::from(&config))?;

    match &cli.command {
        Commands::Serve(_) => run_serve(config).await.context("Dispatch API failed")?,
        Commands::Agent(_) => run_agent(config).await.context("Node agent failed")?,
        Commands::Node(_) => run_node(config).await.context("Node failed")?,
        Commands::Status(_) => run_status(config).await?,
        Commands::Run(args) => run_once(config, &args.commit).await?,
    }

    Ok(())
}

async fn run_serve(config: AppConfig) -> Result<()> {
    let bind = config.http_bind;
    let ctx = AppContext::connect(config).await?;
    let server = Arc::new(WebServer::new(ctx, bind));

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    tokio::spawn({
        let server = server.clone();
        async move {
            shutdown.cancelled().await;
            server.shutdown();
        }
    });

    server.start().await
}

async fn run_agent(config: AppConfig) -> Result<()> {
    let agent = build_agent(config).await?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    agent.start(shutdown).await
}

async fn run_node(config: AppConfig) -> Result<()> {
    let bind = config.http_bind;
    // The API and the agent each hold their own queue connection.
    let api_ctx = AppContext::connect(config.clone()).await?;
    let agent = build_agent(config).await?;
    let server = WebServer::new(api_ctx, bind);

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let serve = async {
        let served = server.start().await;
        shutdown.cancel();
        served
    };
    let work = async {
        let worked = agent.start(shutdown.clone()).await;
        server.shutdown();
        worked
    };

    let (served, worked) = tokio::join!(serve, work);
    served?;
    worked
}

async fn run_status(config: AppConfig) -> Result<()> {
    let node_name = config.node_name().to_string();

    let status = match JobQueue::connect(&config.queue, node_name.clone()).await {
        Ok(queue) => rosie::core::node_status(&queue, &node_name).await,
        Err(e) => {
            warn!(error = %e, "Queue unreachable");
            NodeStatus::unknown(node_name)
        }
    };

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_once(config: AppConfig, commit: &str) -> Result<()> {
    let controller = create_controller(&config)?;
    let runner = BoardRunner::new(
        config.boards.clone(),
        controller,
        ReportAssembler::new(config.commit_url_base.clone()),
    );

    let result = runner.run_tests(commit).await;
    println!("{}", serde_json::to_string_pretty(&result.outcome)?);

    std::process::exit(result.exit_status);
}

async fn build_agent(config: AppConfig) -> Result<NodeAgent> {
    let controller = create_controller(&config)?;
    let sink = create_sink(&config);
    if sink.is_none() {
        info!("No report webhook configured, reports will only be logged");
    }

    let ctx = AppContext::connect(config).await?;
    Ok(NodeAgent::new(ctx, controller, sink))
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for ctrl-c");
            return;
        }
        info!("Shutdown requested");
        token.cancel();
    });
}
