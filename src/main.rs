//! iotlink device client - Main Entry Point
//!
//! Connects a device to its broker, keeps the session alive and prints
//! whatever arrives on the requested topic filters.

use clap::{Parser, Subcommand};
use iotlink::auth::CredentialResolver;
use iotlink::config::SessionConfig;
use iotlink::observability::init_default_logging;
use iotlink::transport::mqtt::{subscriber_fn, MqttSession, QoS, SessionEvent, Subscriber};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Device-side MQTT session client
#[derive(Parser)]
#[command(name = "iotlink")]
#[command(about = "Device-side MQTT session client for cloud IoT brokers")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "IOTLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and keep the session running until interrupted
    Run {
        /// Topic filter to subscribe to; repeatable
        #[arg(short, long = "subscribe", value_name = "FILTER")]
        subscribe: Vec<String>,
        /// Publish once connected, as TOPIC=PAYLOAD; repeatable
        #[arg(short, long = "publish", value_name = "TOPIC=PAYLOAD")]
        publish: Vec<String>,
        /// Publish with QoS 1 instead of QoS 0
        #[arg(long)]
        qos1: bool,
        /// Seconds to wait for the first CONNACK
        #[arg(long, default_value_t = 30)]
        connect_wait: u64,
    },
    /// Validate the configuration
    Config {
        /// Print the configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
    /// Derive connect credentials and print the client id and username
    Credentials,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting iotlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            subscribe,
            publish,
            qos1,
            connect_wait,
        } => {
            let qos = if qos1 {
                QoS::AtLeastOnce
            } else {
                QoS::AtMostOnce
            };
            run_session(
                config,
                subscribe,
                publish,
                qos,
                Duration::from_secs(connect_wait),
            )
            .await
        }
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Credentials => handle_credentials_command(config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(SessionConfig::load_from_file(path)?);
    }

    for path_str in ["device.toml", "config/device.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(SessionConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create device.toml".into())
}

/// Split `TOPIC=PAYLOAD`
fn parse_publish_arg(arg: &str) -> Result<(&str, &str), String> {
    arg.split_once('=')
        .filter(|(topic, _)| !topic.is_empty())
        .ok_or_else(|| format!("invalid --publish '{arg}', expected TOPIC=PAYLOAD"))
}

/// Logs lifecycle events reported by the session
struct EventLogger;

impl Subscriber for EventLogger {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        info!(topic, bytes = payload.len(), "message on unsubscribed route");
    }

    fn on_event(&self, event: &SessionEvent) {
        if event.is_failure() {
            warn!(event = ?event, "session event");
        } else {
            info!(event = ?event, "session event");
        }
    }
}

async fn run_session(
    config: SessionConfig,
    filters: Vec<String>,
    publishes: Vec<String>,
    qos: QoS,
    connect_wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let publishes = publishes
        .iter()
        .map(|arg| parse_publish_arg(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let session = MqttSession::new(config)?;
    session.set_event_listener(Arc::new(EventLogger));

    let printer = subscriber_fn(|topic, payload| {
        println!("{topic} {}", String::from_utf8_lossy(payload));
    });
    for filter in &filters {
        session.subscribe(filter, QoS::AtLeastOnce, Arc::clone(&printer))?;
    }

    let driver = Arc::clone(&session);
    let event_loop = tokio::spawn(async move {
        while driver.run_once(Duration::from_millis(500)).await {}
    });

    session.connect().await?;
    session.wait_connected(connect_wait).await?;
    info!(subscriptions = filters.len(), "Device is online");

    for (topic, payload) in publishes {
        let packet_id = session.publish(topic, payload.to_string(), qos)?;
        info!(topic, packet_id = ?packet_id, "published");
    }

    signal::ctrl_c().await?;
    info!("Received interrupt, shutting down gracefully...");

    session.deinit().await;
    if let Err(e) = event_loop.await {
        warn!("Event loop ended abnormally: {}", e);
    }
    Ok(())
}

fn handle_config_command(
    config: &SessionConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!(broker = %config.endpoint().address(), "Configuration validation complete");
    Ok(())
}

async fn handle_credentials_command(
    config: SessionConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let resolver = CredentialResolver::new(config);
    let credentials = resolver.resolve().await?;
    println!("client_id = {}", credentials.client_id);
    println!("username  = {}", credentials.username);
    Ok(())
}
