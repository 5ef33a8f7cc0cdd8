//! velib demo - a simulated battery published on an in-process bus.
//!
//! `run` starts the bus, the settings service and the battery, and exposes
//! the bus over IPC. The other subcommands are IPC clients for a running
//! demo.

mod device;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use velib_core::{IpcClient, IpcServer, MemoryBus, SettingsService};

const DEFAULT_SERVICE: &str = "com.victronenergy.battery.demo";

#[derive(Parser, Debug)]
#[command(name = "velib-demo")]
#[command(about = "Simulated battery published with velib-core")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish the battery and serve the bus over IPC
    Run {
        /// Raw service name; the last segment is the device label
        #[arg(long, default_value = DEFAULT_SERVICE)]
        name: String,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Milliseconds between voltage updates
        #[arg(short, long, default_value = "1000")]
        interval: u64,
    },
    /// Read one path
    Get {
        #[command(flatten)]
        target: Target,
        path: String,
    },
    /// Write one path; the value is parsed as JSON, falling back to a string
    Set {
        #[command(flatten)]
        target: Target,
        path: String,
        value: String,
    },
    /// Dump every path of a service
    Items {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Host of the running demo
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// IPC port of the running demo
    #[arg(short, long)]
    port: u16,

    /// Service to talk to
    #[arg(long, default_value = DEFAULT_SERVICE)]
    service: String,
}

impl Target {
    async fn connect(&self) -> Result<IpcClient> {
        let addr = socket_addr(&self.host, self.port)?;
        IpcClient::connect(addr)
            .await
            .with_context(|| format!("cannot reach demo at {}", addr))
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid address {}:{}", host, port))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Run {
            name,
            host,
            port,
            interval,
        } => run(&name, socket_addr(&host, port)?, Duration::from_millis(interval)).await,
        Command::Get { target, path } => {
            let client = target.connect().await?;
            let value = client.call(&target.service, &path, "GetValue", vec![]).await?;
            let text = client.call(&target.service, &path, "GetText", vec![]).await?;
            println!("{} = {} ({})", path, value, text.as_str().unwrap_or_default());
            Ok(())
        }
        Command::Set {
            target,
            path,
            value,
        } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let client = target.connect().await?;
            client
                .call(&target.service, &path, "SetValue", vec![value])
                .await?;
            Ok(())
        }
        Command::Items { target } => {
            let client = target.connect().await?;
            let items = client.call(&target.service, "/", "GetItems", vec![]).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
            Ok(())
        }
    }
}

async fn run(name: &str, addr: SocketAddr, interval: Duration) -> Result<()> {
    info!("Starting velib demo");

    let bus = MemoryBus::new();
    let settings = SettingsService::start(bus.connect()?)?;
    let battery = device::Battery::publish(&bus, name)?;
    let mut server = IpcServer::bind(bus.clone(), addr).await?;

    // Intentional stdout so scripts can find the port.
    println!("IPC_PORT={}", server.port);
    info!("{} published, IPC on {}", battery.service.name(), server.addr());

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let volts: f64 = rand::rng().random_range(11.5..14.5);
                let volts = (volts * 100.0).round() / 100.0;
                if let Err(e) = battery.voltage.set_value(volts) {
                    warn!("Voltage update failed: {}", e);
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    server.shutdown();
    battery.service.close()?;
    settings.close()?;
    Ok(())
}
