#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use iotgw::codec::{CloseContext, Codec, MessageContext};
use iotgw::conf::{MqttNetwork, Network};
use iotgw::context::ServerContext;
use iotgw::device::{Device, Product};
use iotgw::mqtt::Broker;
use iotgw::mqtt_codec::{self as codec, Connect, ConnectAck, Packet, Protocol};
use iotgw::Result;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

pub fn context() -> ServerContext {
    ServerContext::new()
        .products(vec![Product::new("p1").config("username", "u").config("password", "pw")])
        .devices(vec![
            Device::new("dev1", "p1"),
            Device::new("dev2", "p1").config("password", "secret2"),
        ])
        .build()
}

pub fn mqtt_network(max_allowed_connection: usize) -> Network<MqttNetwork> {
    Network::new(MqttNetwork {
        name: "test/mqtt".into(),
        host: "127.0.0.1".parse().unwrap(),
        port: 0,
        product_id: "p1".into(),
        max_allowed_connection,
        ..Default::default()
    })
}

pub async fn start_broker(
    scx: &ServerContext,
    max_allowed_connection: usize,
    codec: Arc<dyn Codec>,
) -> Broker {
    Broker::start(scx.clone(), mqtt_network(max_allowed_connection), codec).await.unwrap()
}

pub fn connect_packet(client_id: &str, username: &str, password: &str) -> Connect {
    Connect {
        protocol: Protocol::default(),
        clean_session: true,
        keep_alive: 60,
        client_id: client_id.into(),
        username: Some(username.into()),
        password: Some(Bytes::copy_from_slice(password.as_bytes())),
        ..Default::default()
    }
}

/// Raw MQTT v3.1.1 peer.
pub struct TestClient {
    framed: Framed<TcpStream, codec::Codec>,
}

impl TestClient {
    pub async fn open(addr: SocketAddr) -> Self {
        let io = TcpStream::connect(addr).await.unwrap();
        Self { framed: Framed::new(io, codec::Codec::new(1024 * 1024)) }
    }

    pub async fn connect(addr: SocketAddr, connect: Connect) -> (Self, ConnectAck) {
        let mut client = Self::open(addr).await;
        client.send(connect.into()).await;
        match client.recv().await {
            Some(Packet::ConnectAck(ack)) => (client, ack),
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        self.framed.send(packet).await.unwrap();
    }

    /// Next packet, `None` once the broker closed the connection.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.recv_timeout(RECV_TIMEOUT).await.expect("no packet in time")
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> std::result::Result<Option<Packet>, ()> {
        match tokio::time::timeout(timeout, self.framed.next()).await {
            Ok(Some(Ok(packet))) => Ok(Some(packet)),
            Ok(Some(Err(_))) | Ok(None) => Ok(None),
            Err(_) => Err(()),
        }
    }

    pub async fn expect_closed(&mut self) {
        assert_eq!(self.recv().await, None);
    }
}

/// Records every codec call. `on_message` can be slowed down to observe ordering.
#[derive(Default)]
pub struct Recorder {
    pub delay: Duration,
    pub messages: Mutex<Vec<(Option<String>, String, Bytes)>>,
    pub closes: Mutex<Vec<(Option<String>, String)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay, ..Default::default() })
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.messages.lock().iter().map(|(_, _, p)| p.clone()).collect()
    }
}

#[async_trait]
impl Codec for Recorder {
    async fn on_message(&self, ctx: &MessageContext) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.messages.lock().push((ctx.device_id.clone(), ctx.topic.clone(), ctx.payload.clone()));
        Ok(())
    }

    async fn on_close(&self, ctx: &CloseContext) -> Result<()> {
        self.closes.lock().push((ctx.device_id.clone(), ctx.reason.clone()));
        Ok(())
    }
}

/// Polls `f` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, f: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    f()
}
