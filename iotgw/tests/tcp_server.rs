use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use iotgw::codec::{Codec, ConnectContext, InvokeContext, MessageContext};
use iotgw::conf::{Network, TcpNetwork};
use iotgw::tcp::TcpServer;
use iotgw::Result;

mod common;
use common::*;

fn tcp_network(extra: &str) -> Network<TcpNetwork> {
    let text = format!("name = \"test/tcp\"\nhost = \"127.0.0.1\"\nport = 0\nproduct_id = \"p1\"\n{}", extra);
    Network::new(toml::from_str::<TcpNetwork>(&text).unwrap())
}

const DELIMITED: &str = "[delimeter]\ntype = \"Delimited\"\ndelimited = \"|\"\n";

async fn read_some(io: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; 256];
    let n = tokio::time::timeout(RECV_TIMEOUT, io.read(&mut buf)).await.unwrap().unwrap();
    buf.truncate(n);
    buf
}

/// Binds every connection to `dev1` and writes commands as one JSON line.
struct LineCodec;

#[async_trait]
impl Codec for LineCodec {
    async fn on_connect(&self, ctx: &mut ConnectContext) -> Result<()> {
        ctx.device_online("dev1")
    }

    async fn on_message(&self, _ctx: &MessageContext) -> Result<()> {
        Ok(())
    }

    async fn on_invoke(&self, ctx: &InvokeContext) -> Result<()> {
        let mut line = serde_json::to_vec(&json!({"cmd": ctx.name, "args": ctx.args}))?;
        line.push(b'\n');
        ctx.session.send(&ctx.name, Bytes::from(line)).await
    }
}

#[tokio::test]
async fn test_delimited_frames() {
    let scx = context();
    let recorder = Recorder::new();
    let server = TcpServer::start(scx.clone(), tcp_network(DELIMITED), recorder.clone()).await.unwrap();

    let mut io = TcpStream::connect(server.local_addr()).await.unwrap();
    io.write_all(b"AAA|BB").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    io.write_all(b"B|CC").await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || recorder.messages.lock().len() == 2).await);
    assert_eq!(recorder.payloads(), vec![Bytes::from_static(b"AAA|"), Bytes::from_static(b"BBB|")]);
    let (device_id, topic, _) = recorder.messages.lock()[0].clone();
    assert_eq!(device_id, None);
    assert_eq!(topic, "");

    drop(io);
    assert!(wait_until(Duration::from_secs(2), || recorder.closes.lock().len() == 1).await);
    assert_eq!(recorder.messages.lock().len(), 2);
    server.stop().await;
}

#[tokio::test]
async fn test_fixed_length_frames() {
    let scx = context();
    let recorder = Recorder::new();
    let cfg = tcp_network("[delimeter]\ntype = \"FixLength\"\nlength = 4\n");
    let server = TcpServer::start(scx.clone(), cfg, recorder.clone()).await.unwrap();

    let mut io = TcpStream::connect(server.local_addr()).await.unwrap();
    io.write_all(b"abcdefgh12").await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || recorder.messages.lock().len() == 2).await);
    assert_eq!(recorder.payloads(), vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")]);
    server.stop().await;
}

#[tokio::test]
async fn test_bound_device_receives_commands() {
    let scx = context();
    let server = TcpServer::start(scx.clone(), tcp_network(DELIMITED), Arc::new(LineCodec)).await.unwrap();

    let mut io = TcpStream::connect(server.local_addr()).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || scx.sessions.get("dev1").is_some()).await);
    let info = scx.sessions.get("dev1").unwrap().info();
    assert!(info["id"].as_str().unwrap().starts_with("tcp-"));

    scx.invoke("dev1", "open", json!([1, 2])).await.unwrap();
    let line = read_some(&mut io).await;
    let value: serde_json::Value = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
    assert_eq!(value, json!({"cmd": "open", "args": [1, 2]}));

    drop(io);
    assert!(wait_until(Duration::from_secs(2), || scx.sessions.get("dev1").is_none()).await);
    assert!(wait_until(Duration::from_secs(1), || server.total_connection() == 0).await);
    server.stop().await;
}

#[tokio::test]
async fn test_connection_limit() {
    let scx = context();
    let cfg = tcp_network(&format!("max_allowed_connection = 1\n{}", DELIMITED));
    let recorder = Recorder::new();
    let server = TcpServer::start(scx.clone(), cfg, recorder.clone()).await.unwrap();

    let mut first = TcpStream::connect(server.local_addr()).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || server.total_connection() == 1).await);

    let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
    assert!(read_some(&mut second).await.is_empty());

    first.write_all(b"still|").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || recorder.messages.lock().len() == 1).await);
    assert_eq!(server.total_connection(), 1);
    server.stop().await;
}

#[tokio::test]
async fn test_keepalive_closes_idle_connection() {
    let scx = context();
    let cfg = tcp_network(&format!("keepalive = 1\n{}", DELIMITED));
    let recorder = Recorder::new();
    let server = TcpServer::start(scx.clone(), cfg, recorder.clone()).await.unwrap();

    let mut io = TcpStream::connect(server.local_addr()).await.unwrap();
    assert!(read_some(&mut io).await.is_empty());
    assert!(wait_until(Duration::from_secs(1), || recorder.closes.lock().len() == 1).await);
    server.stop().await;
}

#[tokio::test]
async fn test_invalid_setup_is_rejected() {
    let scx = context();
    let empty_delim = tcp_network("[delimeter]\ntype = \"Delimited\"\n");
    assert!(TcpServer::start(scx.clone(), empty_delim, Recorder::new()).await.is_err());

    #[cfg(feature = "tls")]
    {
        let bad_pem = tcp_network("use_tls = true\n[[certificate]]\ncert = \"bad\"\nkey = \"bad\"\n");
        assert!(TcpServer::start(scx.clone(), bad_pem, Recorder::new()).await.is_err());
    }
    assert!(scx.servers.is_empty());
}

#[tokio::test]
async fn test_duplicate_name_is_rejected() {
    let scx = context();
    let server = TcpServer::start(scx.clone(), tcp_network(DELIMITED), Recorder::new()).await.unwrap();
    assert!(TcpServer::start(scx.clone(), tcp_network(DELIMITED), Recorder::new()).await.is_err());
    assert_eq!(scx.servers.names(), vec!["test/tcp".to_owned()]);
    server.stop().await;
    assert!(scx.servers.is_empty());
}

/// Binds `dev1` after a pause, to stop the server while `on_connect` runs.
struct SlowBind(Duration);

#[async_trait]
impl Codec for SlowBind {
    async fn on_connect(&self, ctx: &mut ConnectContext) -> Result<()> {
        tokio::time::sleep(self.0).await;
        ctx.device_online("dev1")
    }

    async fn on_message(&self, _ctx: &MessageContext) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_stop_during_connect_closes() {
    let scx = context();
    let server =
        TcpServer::start(scx.clone(), tcp_network(DELIMITED), Arc::new(SlowBind(Duration::from_millis(500)))).await.unwrap();

    let mut io = TcpStream::connect(server.local_addr()).await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || server.total_connection() == 1).await);
    server.stop().await;
    assert_eq!(server.total_connection(), 0);

    assert!(read_some(&mut io).await.is_empty());
    assert!(scx.sessions.get("dev1").is_none());
    assert!(scx.servers.is_empty());
}
