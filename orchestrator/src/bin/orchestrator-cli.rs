//! Command-line client for a running `orchestrator-server`.
//!
//! Submits a task or graph JSON file over HTTP and can stream the viewport
//! WebSocket to stdout, one JSON event per line.

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "orchestrator-cli")]
#[command(about = "Submit work to an orchestrator server and watch its viewport")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Base HTTP URL of the orchestrator server
    #[arg(long, env = "ORCHESTRATOR_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a single task from a JSON file
    Task {
        /// Path to a JSON file matching the `/api/v1/tasks` request body
        path: String,
    },
    /// Submit a task graph from a JSON file
    Graph {
        /// Path to a JSON file matching the `/api/v1/graphs` request body
        path: String,
    },
    /// Spawn a worker from a JSON file
    SpawnWorker {
        /// Path to a JSON file matching the `/api/v1/workers` request body
        path: String,
    },
    /// Poll the status of one graph
    GraphStatus {
        /// Graph id
        id: String,
    },
    /// Stream viewport events to stdout until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Task { path } => submit_file(&client, &cli.url, "/api/v1/tasks", &path).await?,
        Commands::Graph { path } => submit_file(&client, &cli.url, "/api/v1/graphs", &path).await?,
        Commands::SpawnWorker { path } => submit_file(&client, &cli.url, "/api/v1/workers", &path).await?,
        Commands::GraphStatus { id } => graph_status(&client, &cli.url, &id).await?,
        Commands::Watch => watch(&cli.url).await?,
    }

    Ok(())
}

async fn submit_file(
    client: &reqwest::Client,
    base_url: &str,
    endpoint: &str,
    path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let body = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&body)?;
    let response = client.post(format!("{base_url}{endpoint}")).json(&value).send().await?;
    let status = response.status();
    let text = response.text().await?;
    println!("{status}: {text}");
    Ok(())
}

async fn graph_status(client: &reqwest::Client, base_url: &str, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.get(format!("{base_url}/api/v1/graphs/{id}")).send().await?;
    let status = response.status();
    let text = response.text().await?;
    println!("{status}: {text}");
    Ok(())
}

async fn watch(base_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let ws_url = base_url.replacen("http", "ws", 1) + "/ws/viewport";
    tracing::info!(%ws_url, "connecting to viewport stream");
    let (stream, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    let (_write, mut read) = stream.split();

    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => println!("{text}"),
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}
