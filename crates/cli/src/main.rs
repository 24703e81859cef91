use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config and data directory).
    Init {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway: HTTP event intake plus the queue consumer running the conversation workflow.
    #[command(alias = "serve")]
    Gateway {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP port (default from config or 8085)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Submit an event to a running gateway (POST /api/messages/send).
    Publish {
        /// Config file path, used to find the gateway address
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Event name, e.g. MESSAGE-RECEIVED
        #[arg(long, short)]
        event: String,

        /// Payload as inline JSON object
        #[arg(long, conflicts_with = "file")]
        payload: Option<String>,

        /// Payload read from a JSON file
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,

        /// Gateway base URL (default: http://<bind>:<port> from config)
        #[arg(long)]
        url: Option<String>,
    },

    /// Show the latest message entry recorded for a remote endpoint.
    Status {
        /// Config file path, used to find the gateway address
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Remote endpoint, e.g. 5511999@s.whatsapp.net
        endpoint: String,

        /// Gateway base URL (default: http://<bind>:<port> from config)
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Publish {
            config,
            event,
            payload,
            file,
            url,
        }) => {
            if let Err(e) = run_publish(config, event, payload, file, url).await {
                log::error!("publish failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Status { config, endpoint, url }) => {
            if let Err(e) = run_status(config, endpoint, url).await {
                log::error!("status failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(parley::config::default_config_path);
    let dir = parley::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = parley::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    parley::gateway::run_gateway(config, path).await
}

/// Base URL of the gateway: explicit `--url`, else bind and port from config.
fn gateway_url(config_path: Option<PathBuf>, url: Option<String>) -> anyhow::Result<String> {
    if let Some(url) = url {
        return Ok(url.trim_end_matches('/').to_string());
    }
    let (config, _) = parley::config::load_config(config_path)?;
    let host = match config.gateway.bind.trim() {
        "0.0.0.0" | "" => "127.0.0.1",
        other => other,
    };
    Ok(format!("http://{}:{}", host, config.gateway.port))
}

async fn run_publish(
    config_path: Option<PathBuf>,
    event: String,
    payload: Option<String>,
    file: Option<PathBuf>,
    url: Option<String>,
) -> anyhow::Result<()> {
    let raw = match (payload, file) {
        (Some(p), _) => p,
        (None, Some(f)) => std::fs::read_to_string(&f)
            .map_err(|e| anyhow::anyhow!("reading payload from {}: {}", f.display(), e))?,
        (None, None) => "{}".to_string(),
    };
    let payload: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("payload is not valid JSON: {}", e))?;
    if !payload.is_object() {
        anyhow::bail!("payload must be a JSON object");
    }
    let base = gateway_url(config_path, url)?;
    let res = reqwest::Client::new()
        .post(format!("{}/api/messages/send", base))
        .json(&serde_json::json!({ "eventName": event, "payload": payload }))
        .send()
        .await?;
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("gateway answered {}: {}", status, body);
    }
    println!("{} accepted", event);
    Ok(())
}

async fn run_status(config_path: Option<PathBuf>, endpoint: String, url: Option<String>) -> anyhow::Result<()> {
    let base = gateway_url(config_path, url)?;
    let url = reqwest::Url::parse(&format!("{}/api/conversations/", base))?.join(&endpoint)?;
    let res = reqwest::get(url).await?;
    let status = res.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        println!("no messages recorded for {}", endpoint);
        return Ok(());
    }
    if !status.is_success() {
        anyhow::bail!("gateway answered {}", status);
    }
    let entry: serde_json::Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}
