//! End-to-end smoke test over real localhost sockets: a scripted device
//! on a plain tokio socket answers a client running the full
//! `UdpTransport` path.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::UdpSocket;

use miio_client::codec::{deserialize_response, serialize_request, Request, Response};
use miio_client::{Client, ClientConfig, Packet, Token, UdpTransport};

const TOKEN_HEX: &str = "7238666c354e586f78576e345a57616c";
const DEVICE_ID: u32 = 51234;
const DEVICE_STAMP: u32 = 7700;

async fn run_device(socket: UdpSocket, token: Token) {
    let mut buf = vec![0u8; 65535];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await.expect("device recv");
        let packet = Packet::parse(&buf[..len]).expect("device got malformed frame");
        if packet.header.reserved == 0xffff_ffff {
            let hello = Packet {
                header: miio_client::PacketHeader {
                    magic: miio_client::MAGIC,
                    packet_length: miio_client::HEADER_SIZE as u16,
                    reserved: 0,
                    device_id: DEVICE_ID,
                    stamp: DEVICE_STAMP,
                    checksum: [0u8; 16],
                },
                payload: Vec::new(),
            };
            socket
                .send_to(&hello.to_bytes().unwrap(), from)
                .await
                .expect("device hello send");
            continue;
        }
        let body = match deserialize_response(&packet, &token).expect("device decrypt") {
            Response::Normal { body, .. } => body,
            Response::Handshake { .. } => continue,
        };
        let request: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let reply = json!({ "id": request["id"], "result": ["ok"], "exec_time": 12 }).to_string();
        let frame = serialize_request(
            &Request::Normal {
                device_id: DEVICE_ID,
                stamp: DEVICE_STAMP,
                body: &reply,
            },
            &token,
        )
        .unwrap()
        .to_bytes()
        .unwrap();
        socket.send_to(&frame, from).await.expect("device reply send");
    }
}

#[tokio::test]
async fn localhost_handshake_and_call() {
    let device_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let device_port = device_socket.local_addr().unwrap().port();
    let device = tokio::spawn(run_device(
        device_socket,
        Token::from_hex(TOKEN_HEX).unwrap(),
    ));

    let transport = Arc::new(UdpTransport::new());
    transport.ensure_ready().await.unwrap();
    let config = ClientConfig {
        port: device_port,
        request_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    };
    let client = Client::with_config(
        Arc::clone(&transport),
        TOKEN_HEX,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        config,
    )
    .unwrap();
    client.start();

    let info = client.hello().await.unwrap();
    assert_eq!(info.device_id, DEVICE_ID);
    assert_eq!(info.stamp, DEVICE_STAMP);

    let reply = client.send("get_prop", json!(["power"])).await.unwrap();
    assert_eq!(reply.result, Some(json!(["ok"])));
    assert_eq!(reply.exec_time, Some(12));

    client.close();
    transport.close().await;
    device.abort();
}
