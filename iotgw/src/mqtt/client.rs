use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use iotgw_codec::{LastWill, Packet, Protocol, Publish, QoS, SubscribeReturnCode};
use iotgw_net::v3::{PacketReader, PacketWriter};

use crate::mqtt::Session;
use crate::utils::Done;
use crate::{GatewayError, Result};

/// Identity snapshot taken from CONNECT.
pub struct ClientInfo {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub protocol: Protocol,
    pub remote_addr: SocketAddr,
    device_id: OnceCell<String>,
    will: Mutex<Option<LastWill>>,
}

impl ClientInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: String,
        username: Option<String>,
        password: Option<Bytes>,
        keep_alive: u16,
        clean_session: bool,
        protocol: Protocol,
        remote_addr: SocketAddr,
        will: Option<LastWill>,
    ) -> Self {
        Self {
            client_id,
            username,
            password,
            keep_alive,
            clean_session,
            protocol,
            remote_addr,
            device_id: OnceCell::new(),
            will: Mutex::new(will),
        }
    }

    #[inline]
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.get().map(|id| id.as_str())
    }

    /// Returns false if a device was already bound.
    #[inline]
    pub fn set_device_id(&self, id: String) -> bool {
        self.device_id.set(id).is_ok()
    }

    /// Read deadline, one and a half keepalive intervals.
    #[inline]
    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        if self.keep_alive > 0 {
            Some(Duration::from_millis(self.keep_alive as u64 * 1500))
        } else {
            None
        }
    }
}

impl fmt::Debug for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientInfo")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("protocol", &self.protocol)
            .field("remote_addr", &self.remote_addr)
            .field("device_id", &self.device_id.get())
            .finish()
    }
}

/// One physical MQTT connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    uid: String,
    info: ClientInfo,
    tx: mpsc::Sender<Packet>,
    done: Done,
}

impl Client {
    pub(crate) fn new(info: ClientInfo, outbound_queue: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(outbound_queue.max(1));
        let inner = ClientInner { uid: uuid::Uuid::new_v4().simple().to_string(), info, tx, done: Done::new() };
        (Self { inner: Arc::new(inner) }, rx)
    }

    /// Unique per connection, unlike the client id.
    #[inline]
    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.inner.info.client_id
    }

    #[inline]
    pub fn info(&self) -> &ClientInfo {
        &self.inner.info
    }

    #[inline]
    pub(crate) fn done(&self) -> &Done {
        &self.inner.done
    }

    /// Queues `packet` for the write loop, waiting for room.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        if self.inner.done.is_done() {
            return Err(GatewayError::SessionClosed.into());
        }
        tokio::select! {
            res = self.inner.tx.send(packet) => res.map_err(|_| anyhow::Error::from(GatewayError::SessionClosed)),
            _ = self.inner.done.wait() => Err(anyhow::Error::from(GatewayError::SessionClosed)),
        }
    }

    /// Queues `packet` without waiting, failing if the queue is full.
    pub fn try_send(&self, packet: Packet) -> Result<()> {
        if self.inner.done.is_done() {
            return Err(GatewayError::SessionClosed.into());
        }
        self.inner.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(p) => {
                anyhow::anyhow!("outbound queue of {} is full, drop {}", self.id(), p.name())
            }
            mpsc::error::TrySendError::Closed(_) => GatewayError::SessionClosed.into(),
        })
    }

    /// Returns true for the call that closed the connection.
    #[inline]
    pub fn close(&self) -> bool {
        self.inner.done.fire()
    }

    #[inline]
    pub fn is_disconnected(&self) -> bool {
        self.inner.done.is_done()
    }

    #[inline]
    pub(crate) fn clear_will(&self) {
        self.inner.info.will.lock().take();
    }

    #[inline]
    pub(crate) fn take_will(&self) -> Option<LastWill> {
        self.inner.info.will.lock().take()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Client {{ uid: {}, {:?}, disconnected: {} }}", self.uid(), self.info(), self.is_disconnected())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Publish,
    PubAck,
    Subscribe,
    Unsubscribe,
    PingReq,
    Disconnect,
    DoubleConnect,
    Violation,
}

/// Indexed by the packet type of the fixed header.
const ROUTES: [Route; 16] = [
    Route::Violation,     // reserved
    Route::DoubleConnect, // CONNECT
    Route::Violation,     // CONNACK
    Route::Publish,       // PUBLISH
    Route::PubAck,        // PUBACK
    Route::Violation,     // PUBREC
    Route::Violation,     // PUBREL
    Route::Violation,     // PUBCOMP
    Route::Subscribe,     // SUBSCRIBE
    Route::Violation,     // SUBACK
    Route::Unsubscribe,   // UNSUBSCRIBE
    Route::Violation,     // UNSUBACK
    Route::PingReq,       // PINGREQ
    Route::Violation,     // PINGRESP
    Route::Disconnect,    // DISCONNECT
    Route::Violation,     // reserved
];

#[inline]
fn route(packet: &Packet) -> Route {
    ROUTES[(packet.packet_type() & 0x0f) as usize]
}

enum Flow {
    Continue,
    Stop,
}

/// Reads and dispatches packets until the peer leaves or the client is closed.
/// Returns the reason of a regular exit.
pub(crate) async fn read_loop<Io>(
    client: &Client,
    session: &Session,
    reader: &mut PacketReader<Io>,
) -> Result<&'static str>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let keep_alive = client.info().keep_alive_timeout();
    loop {
        let packet = tokio::select! {
            _ = client.done().wait() => return Ok("closed"),
            packet = reader.recv(keep_alive) => packet?,
        };
        let packet = match packet {
            Some(packet) => packet,
            None => return Ok("peer closed"),
        };
        log::trace!("{} {} recv {:?}", client.info().remote_addr, client.id(), packet);
        if let Flow::Stop = dispatch(client, session, packet).await? {
            return Ok("disconnect");
        }
    }
}

async fn dispatch(client: &Client, session: &Session, packet: Packet) -> Result<Flow> {
    match (route(&packet), packet) {
        (Route::Publish, Packet::Publish(publish)) => on_publish(client, session, publish).await?,
        (Route::PubAck, Packet::PublishAck { packet_id }) => session.puback(packet_id.get()),
        (Route::Subscribe, Packet::Subscribe { packet_id, topic_filters }) => {
            let status = topic_filters.iter().map(|(_, qos)| SubscribeReturnCode::Success(*qos)).collect();
            session.subscribe(topic_filters.into_iter().map(|(topic, qos)| (topic.to_string(), qos)));
            client.send(Packet::SubscribeAck { packet_id, status }).await?;
        }
        (Route::Unsubscribe, Packet::Unsubscribe { packet_id, topic_filters }) => {
            session.unsubscribe(topic_filters.iter().map(|t| &**t));
            client.send(Packet::UnsubscribeAck { packet_id }).await?;
        }
        (Route::PingReq, _) => client.send(Packet::PingResponse).await?,
        (Route::Disconnect, _) => {
            client.clear_will();
            return Ok(Flow::Stop);
        }
        (Route::DoubleConnect, _) => return Err(GatewayError::DoubleConnect.into()),
        (_, packet) => return Err(GatewayError::UnexpectedPacket(packet.name()).into()),
    }
    Ok(Flow::Continue)
}

async fn on_publish(client: &Client, session: &Session, publish: Publish) -> Result<()> {
    match publish.qos {
        QoS::AtMostOnce => {}
        QoS::AtLeastOnce => {
            if let Some(packet_id) = publish.packet_id {
                client.send(Packet::PublishAck { packet_id }).await?;
            }
        }
        QoS::ExactlyOnce => return Err(GatewayError::QoS2Unsupported.into()),
    }
    session
        .on_message(publish.topic.to_string(), publish.packet_id.map(|id| id.get()), publish.payload)
        .await;
    Ok(())
}

/// Drains the outbound queue into the connection.
pub(crate) async fn write_loop<Io>(client: Client, mut rx: mpsc::Receiver<Packet>, mut writer: PacketWriter<Io>)
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            packet = rx.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = writer.send(packet).await {
                        log::debug!("{} {} write error, {}", client.info().remote_addr, client.id(), e);
                        break;
                    }
                }
                None => break,
            },
            _ = client.done().wait() => break,
        }
    }
    client.close();
    if let Err(e) = writer.close().await {
        log::debug!("{} {} close error, {}", client.info().remote_addr, client.id(), e);
    }
}
