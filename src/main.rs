//! CLI for PubWire
//!
//! Subcommands:
//! - `broker`: run the broker until ctrl-c
//! - `subscribe`: print every message on a topic as a JSON line
//! - `publish`: send one message and exit

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};

use pubwire::broker::Broker;
use pubwire::client::{Publisher, Subscriber};
use pubwire::config::{Settings, load_config_from};
use pubwire::transport::{Message, Topic};
use pubwire::utils::{Result, logging};

#[derive(Parser)]
#[command(name = "pubwire", version, about = "Publish/subscribe over raw TCP")]
struct Cli {
    /// Configuration file (TOML, YAML, JSON, or key=value for `.conf`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Broker host; for `broker` this is the address to bind
    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(long, global = true)]
    port: Option<u16>,

    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker
    Broker,
    /// Subscribe to a topic (`0x`-prefixed hex or plain text)
    Subscribe { topic: String },
    /// Publish one message
    Publish {
        topic: String,
        payload: Option<String>,
        /// Read the payload from a file instead
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let mut settings = match load_config_from(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    logging::init(cli.log_level.as_deref().unwrap_or(&settings.log.level));
    logging::install_panic_hook();

    let result = match cli.command {
        Command::Broker => {
            if let Some(host) = cli.host {
                settings.broker.bind_host = host;
            }
            run_broker(&settings).await
        }
        Command::Subscribe { topic } => {
            if let Some(host) = cli.host {
                settings.server.host = host;
            }
            run_subscriber(&settings, &topic).await
        }
        Command::Publish {
            topic,
            payload,
            file,
        } => {
            if let Some(host) = cli.host {
                settings.server.host = host;
            }
            run_publisher(&settings, &topic, payload, file).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_broker(settings: &Settings) -> Result<()> {
    let broker = Broker::setup(settings).await?;
    let shutdown = broker.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received. Exiting gracefully.");
            shutdown.cancel();
        }
    });
    broker.run().await
}

async fn run_subscriber(settings: &Settings, topic: &str) -> Result<()> {
    let mut subscriber = Subscriber::new(settings.client.clone());
    subscriber
        .setup(&settings.server.host, settings.server.port)
        .await?;

    let subscriber = Arc::new(subscriber);
    let quitter = subscriber.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = quitter.quit().await {
                warn!("quit failed: {e}");
                quitter.exit();
            }
        }
    });

    subscriber.subscribe(Topic::parse(topic), print_message).await
}

fn print_message(message: &Message) {
    let line = json!({
        "topic": message.header.topic.to_string(),
        "status": message.status.as_str(),
        "content": String::from_utf8_lossy(&message.content),
        "received_at": Utc::now().to_rfc3339(),
    });
    println!("{line}");
}

async fn run_publisher(
    settings: &Settings,
    topic: &str,
    payload: Option<String>,
    file: Option<PathBuf>,
) -> Result<()> {
    let payload = match (file, payload) {
        (Some(path), _) => tokio::fs::read(&path).await?,
        (None, Some(text)) => text.into_bytes(),
        (None, None) => Vec::new(),
    };

    let mut publisher = Publisher::new(settings.client.clone());
    publisher
        .setup(&settings.server.host, settings.server.port)
        .await?;
    let written = publisher.publish(&Topic::parse(topic), &payload).await?;
    info!("sent {written} bytes");
    Ok(())
}
