//! natsbroker - publish and subscribe through the broker adapter

use clap::{Parser, Subcommand};
use nats_broker::broker::{handler_fn, Broker, BrokerOption, NatsBroker, PublishOptions, SubscribeOptions};
use nats_broker::codec::JsonCodec;
use nats_broker::config::BrokerConfig;
use nats_broker::observability::init_default_logging;
use nats_broker::{Context, Message};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "broker.toml";

/// Publish/subscribe over NATS
#[derive(Parser)]
#[command(name = "natsbroker")]
#[command(about = "Publish and subscribe through the NATS broker adapter")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "NATS_BROKER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message
    Pub {
        topic: String,
        body: String,
        /// Header as key=value; repeatable
        #[arg(long = "header", value_name = "KEY=VALUE", value_parser = parse_header)]
        headers: Vec<(String, String)>,
        /// Send the body only, without headers
        #[arg(long)]
        body_only: bool,
    },
    /// Print messages until interrupted
    Sub {
        topic: String,
        /// Queue group to join
        #[arg(short, long)]
        group: Option<String>,
        #[arg(long)]
        body_only: bool,
    },
    /// Validate configuration
    Config {
        /// Show the resolved options
        #[arg(long)]
        show: bool,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("invalid header '{raw}', expected KEY=VALUE"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let options = match load_options(cli.config.as_deref()) {
        Ok(options) => options,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Pub {
            topic,
            body,
            headers,
            body_only,
        } => publish(options, &topic, body, headers, body_only).await,
        Commands::Sub {
            topic,
            group,
            body_only,
        } => subscribe(options, &topic, group, body_only).await,
        Commands::Config { show } => check_config(options, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_options(path: Option<&Path>) -> Result<Vec<BrokerOption>, Box<dyn std::error::Error>> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    if path.exists() {
        info!("Loading configuration from: {}", path.display());
        return Ok(BrokerConfig::load_from_file(path)?.to_options()?);
    }

    warn!(
        "No configuration file at {}, using defaults",
        path.display()
    );
    Ok(vec![BrokerOption::Codec(Arc::new(JsonCodec))])
}

async fn connected_broker(
    options: Vec<BrokerOption>,
) -> Result<NatsBroker, Box<dyn std::error::Error>> {
    let broker = NatsBroker::new(options);
    broker.init(Vec::new())?;
    broker.connect(&Context::background()).await?;
    info!("Connected to {}", broker.address());
    Ok(broker)
}

async fn publish(
    options: Vec<BrokerOption>,
    topic: &str,
    body: String,
    headers: Vec<(String, String)>,
    body_only: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = connected_broker(options).await?;
    let ctx = Context::background();

    let message = headers
        .into_iter()
        .fold(Message::new(body), |message, (key, value)| {
            message.with_header(key, value)
        });
    broker
        .publish(&ctx, topic, message, PublishOptions::default().body_only(body_only))
        .await?;
    info!(topic, "Message published");

    broker.disconnect(&ctx).await?;
    Ok(())
}

async fn subscribe(
    options: Vec<BrokerOption>,
    topic: &str,
    group: Option<String>,
    body_only: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = connected_broker(options).await?;
    let ctx = Context::background();

    let handler = handler_fn(|publication| {
        let message = publication.message();
        println!(
            "[{}] {:?} {}",
            publication.topic(),
            message.header,
            String::from_utf8_lossy(&message.body)
        );
        Ok(())
    });

    let mut sub_options = SubscribeOptions::default().body_only(body_only);
    if let Some(group) = group {
        sub_options = sub_options.queue(group);
    }

    let subscription = broker.subscribe(&ctx, topic, handler, sub_options).await?;
    info!(topic, "Subscribed, press Ctrl-C to stop");

    signal::ctrl_c().await?;
    info!("Shutting down");

    subscription.unsubscribe(&ctx).await?;
    broker.disconnect(&ctx).await?;
    Ok(())
}

fn check_config(options: Vec<BrokerOption>, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    let broker = NatsBroker::new(options);
    broker.init(Vec::new())?;

    if show {
        println!("{:#?}", broker.options());
        println!("address: {}", broker.address());
    } else {
        info!("Configuration is valid");
    }
    Ok(())
}
