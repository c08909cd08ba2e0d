//! Client for the MiIO protocol, which controls Xiaomi smart-home devices
//! (vacuums, thermostats, humidifiers, ...) over WiFi/UDP.
//!
//! Some useful links:
//! * https://github.com/marcelrv/XiaomiRobotVacuumProtocol/blob/master/Protocol.md - Packet format
//! * https://github.com/marcelrv/XiaomiRobotVacuumProtocol - Xiaomi Vacuum cleaner JSON commands
//!
//! A [`Client`] owns one device session: it handshakes to learn the
//! device id and stamp, encrypts JSON-RPC method calls under the
//! pre-shared token, and matches the device's asynchronous UDP replies
//! back to concurrent callers by request id. The [`UdpTransport`] is
//! created once per process and shared among clients.
//!
//! # Example
//!
//! ```no_run
//! use std::net::IpAddr;
//! use std::sync::Arc;
//!
//! use miio_client::{Client, UdpTransport};
//!
//! # async fn demo() -> Result<(), miio_client::Error> {
//! let transport = Arc::new(UdpTransport::new());
//! let address: IpAddr = "192.168.8.171".parse().unwrap();
//! let client = Client::new(transport, "7238666c354e586f78576e345a57616c", address)?;
//! client.start();
//!
//! let reply = client.send("get_prop", ["power"]).await?;
//! println!("{:?}", reply.result);
//!
//! client.simple_send("set_power", ["off"]).await?;
//! client.close();
//! # Ok(())
//! # }
//! ```

pub mod bytes;
pub mod client;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod packet;
pub mod transport;

pub use client::{Client, ClientConfig, DeviceReply, HelloInfo, RemoteFault};
pub use codec::{Request, Response};
pub use crypto::Token;
pub use error::Error;
pub use packet::{Packet, PacketHeader, HEADER_SIZE, MAGIC};
pub use transport::{
    InboundHandler, Subscribers, Subscription, Transport, UdpTransport, DEFAULT_PORT,
};
