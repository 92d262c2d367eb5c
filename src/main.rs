//! EmberQ - Embeddable MQTT v3.1/v3.1.1 broker
//!
//! Usage:
//!   emberq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -p, --port <PORT>      MQTT listener port (default: 1883)
//!   --loopback-port <PORT> Wake-up UDP port, 0 to disable
//!   --max-connections <N>  Maximum connections
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use emberq::broker::Broker;
use emberq::config::Config;
use emberq::transport::TcpTransport;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// EmberQ - Embeddable MQTT broker
#[derive(Parser, Debug)]
#[command(name = "emberq")]
#[command(author = "EmberQ Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Embeddable MQTT v3.1/v3.1.1 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT listener port
    #[arg(short, long)]
    port: Option<u16>,

    /// Wake-up UDP port (0 disables the wake-up channel)
    #[arg(long)]
    loopback_port: Option<u16>,

    /// Maximum connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum packet size in bytes (receive and transmit budget)
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let file_config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // Setup logging - CLI overrides config, config overrides default
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    let mut engine_config = file_config.engine_config();
    if let Some(port) = args.port {
        engine_config.listener_port = port;
    }
    if let Some(port) = args.loopback_port {
        engine_config.loopback_port = port;
    }
    if let Some(n) = args.max_connections {
        engine_config.max_connections = n;
    }
    if let Some(n) = args.max_packet_size {
        engine_config.rx_buffer = n;
        engine_config.tx_buffer = n;
    }

    info!("Starting EmberQ MQTT broker");
    info!("  Listener port: {}", engine_config.listener_port);
    if engine_config.loopback_port != 0 {
        info!("  Wake-up port: {}", engine_config.loopback_port);
    }
    info!("  Max connections: {}", engine_config.max_connections);
    info!("  Topic nodes: {}", engine_config.max_topic_nodes);
    info!("  Packet pool: {}", engine_config.max_packets);
    info!(
        "  Buffers: {} B rx / {} B tx",
        engine_config.rx_buffer, engine_config.tx_buffer
    );

    let transport = Arc::new(TcpTransport::new()?);
    let broker = Broker::new(engine_config, transport);

    // The run loop only returns on a library-fatal condition.
    broker.run()?;

    Ok(())
}
