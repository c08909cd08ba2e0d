//! Console entry point: talk to one device from the command line.
//!
//! ```text
//! RUST_LOG=debug miio --ip 192.168.8.171 --token 7238666c... call get_prop '["power"]'
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use miio_client::{Client, ClientConfig, UdpTransport, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "miio")]
#[command(about = "Send commands to Mi Home devices on the local network")]
struct Args {
    /// Device IP address
    #[arg(short, long)]
    ip: IpAddr,

    /// Device token, 32 hex characters
    #[arg(short, long)]
    token: String,

    /// Device UDP port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Handshake with the device and print its identity
    Hello,
    /// Call a raw method, e.g. `call get_prop '["power"]'`
    Call {
        method: String,
        /// Method parameters as a JSON value
        #[arg(default_value = "[]")]
        params: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set RUST_LOG to control verbosity.
    env_logger::init();
    let args = Args::parse();

    let config = ClientConfig {
        port: args.port,
        request_timeout: Duration::from_secs(args.timeout),
        ..ClientConfig::default()
    };
    let transport = Arc::new(UdpTransport::new());
    let client = Client::with_config(transport, &args.token, args.ip, config)
        .context("invalid client parameters")?;
    client.start();

    match args.command {
        Command::Hello => {
            let info = client.hello().await?;
            println!("device_id={} stamp={}", info.device_id, info.stamp);
        }
        Command::Call { method, params } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("params must be valid JSON")?;
            let reply = client.send(&method, params).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
    }

    client.close();
    Ok(())
}
