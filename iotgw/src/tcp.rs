//! Raw TCP device server.
//!
//! Each connection is cut into frames by a [`Framer`] built from the
//! network's `delimeter` section, and every frame is handed to the codec's
//! `on_message` hook. Commands go back as raw bytes through [`TcpSession::send`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use iotgw_conf::{Network, TcpNetwork};
use iotgw_net::{Builder, Listener, ListenerType, MqttError, TlsCertificate};

use crate::codec::{CloseContext, Codec, ConnectContext, MessageContext};
use crate::context::ServerContext;
use crate::device::{DeviceSession, HashMap};
use crate::framer::Framer;
use crate::server::{Server, ServerKind};
use crate::utils::{catch_panic, Done};
use crate::{GatewayError, Result};

/// One raw TCP connection, as seen by the business layer.
#[derive(Clone)]
pub struct TcpSession {
    inner: Arc<TcpSessionInner>,
}

struct TcpSessionInner {
    id: String,
    remote_addr: SocketAddr,
    product_id: String,
    device_id: OnceCell<String>,
    tx: mpsc::Sender<Bytes>,
    done: Done,
    scx: ServerContext,
    codec: Arc<dyn Codec>,
}

impl TcpSession {
    fn new(
        scx: ServerContext,
        codec: Arc<dyn Codec>,
        product_id: String,
        remote_addr: SocketAddr,
        outbound_queue: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(outbound_queue.max(1));
        let inner = TcpSessionInner {
            id: format!("tcp-{}", uuid::Uuid::new_v4()),
            remote_addr,
            product_id,
            device_id: OnceCell::new(),
            tx,
            done: Done::new(),
            scx,
            codec,
        };
        (Self { inner: Arc::new(inner) }, rx)
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.done.is_done()
    }

    async fn on_message(&self, frame: Bytes) {
        let ctx = MessageContext {
            scx: self.inner.scx.clone(),
            product_id: self.inner.product_id.clone(),
            device_id: self.inner.device_id.get().cloned(),
            topic: String::new(),
            packet_id: None,
            payload: frame,
            session: Arc::new(self.clone()),
        };
        if let Err(e) = catch_panic(self.inner.codec.on_message(&ctx)).await {
            log::warn!("{} {} on_message failed, {}", self.inner.remote_addr, self.inner.id, e);
        }
    }
}

impl fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TcpSession {{ id: {}, remote_addr: {}, device_id: {:?} }}",
            self.inner.id,
            self.inner.remote_addr,
            self.inner.device_id.get()
        )
    }
}

#[async_trait]
impl DeviceSession for TcpSession {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn device_id(&self) -> Option<String> {
        self.inner.device_id.get().cloned()
    }

    /// Writes `payload` as is, the topic has no meaning on raw TCP.
    async fn send(&self, _topic: &str, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(GatewayError::SessionClosed.into());
        }
        tokio::select! {
            res = self.inner.tx.send(payload) => res.map_err(|_| anyhow::Error::from(GatewayError::SessionClosed)),
            _ = self.inner.done.wait() => Err(anyhow::Error::from(GatewayError::SessionClosed)),
        }
    }

    fn disconnect(&self) {
        self.inner.done.fire();
        if let Some(device_id) = self.inner.device_id.get() {
            self.inner.scx.sessions.remove_if_same(device_id, &self.inner.id);
        }
    }

    fn close(&self) {
        self.inner.done.fire();
    }

    fn info(&self) -> serde_json::Value {
        json!({ "id": self.inner.id, "remoteAddr": self.inner.remote_addr.to_string() })
    }

    fn codec(&self) -> Arc<dyn Codec> {
        self.inner.codec.clone()
    }
}

/// A running raw TCP network.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<TcpServerInner>,
}

struct TcpServerInner {
    scx: ServerContext,
    cfg: Network<TcpNetwork>,
    codec: Arc<dyn Codec>,
    local_addr: SocketAddr,
    sessions: Mutex<HashMap<String, TcpSession>>,
    done: Done,
    listener_closed: Done,
}

impl TcpServer {
    /// Binds the listener, registers the server into `scx.servers` and starts accepting.
    pub async fn start(scx: ServerContext, cfg: Network<TcpNetwork>, codec: Arc<dyn Codec>) -> Result<TcpServer> {
        // reject a bad framing setup before binding
        Framer::from_conf(&cfg.delimeter)?;
        let listener = listen(&cfg)?;
        let server = TcpServer {
            inner: Arc::new(TcpServerInner {
                scx: scx.clone(),
                local_addr: listener.local_addr,
                cfg,
                codec,
                sessions: Mutex::new(HashMap::default()),
                done: Done::new(),
                listener_closed: Done::new(),
            }),
        };
        scx.servers.register(Arc::new(server.clone()))?;
        tokio::spawn(server.clone().accept_loop(listener));
        Ok(server)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.cfg.name
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    #[inline]
    pub fn total_connection(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub async fn stop(&self) {
        if !self.inner.done.fire() {
            return;
        }
        self.inner.listener_closed.wait().await;
        let sessions = self.inner.sessions.lock().drain().map(|(_, s)| s).collect::<Vec<_>>();
        for session in sessions {
            DeviceSession::disconnect(&session);
        }
        self.inner.scx.servers.unregister(self.name());
        log::info!("{} stopped", self.name());
    }

    async fn accept_loop(self, listener: Listener) {
        loop {
            let acceptor = tokio::select! {
                _ = self.inner.done.wait() => break,
                acceptor = listener.accept() => match acceptor {
                    Ok(acceptor) => acceptor,
                    Err(e) => {
                        log::warn!("{} accept error, {:?}", self.name(), e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            let server = self.clone();
            tokio::spawn(async move {
                let remote_addr = acceptor.remote_addr;
                let res = match acceptor.typ {
                    ListenerType::TCP => match acceptor.tcp() {
                        Ok(d) => server.handle_conn(d.into_inner(), remote_addr).await,
                        Err(e) => Err(e),
                    },
                    #[cfg(feature = "tls")]
                    ListenerType::TLS => match acceptor.tls().await {
                        Ok(d) => server.handle_conn(d.into_inner(), remote_addr).await,
                        Err(e) => Err(e),
                    },
                };
                if let Err(e) = res {
                    log::debug!("{} {} connection closed, {}", server.name(), remote_addr, e);
                }
            });
        }
        drop(listener);
        self.inner.listener_closed.fire();
        log::info!("{} listener closed", self.name());
    }

    async fn handle_conn<Io>(&self, io: Io, remote_addr: SocketAddr) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let cfg = &self.inner.cfg;
        let framer = Framer::from_conf(&cfg.delimeter)?;
        let (session, rx) = TcpSession::new(
            self.inner.scx.clone(),
            self.inner.codec.clone(),
            cfg.product_id.clone(),
            remote_addr,
            cfg.outbound_queue,
        );

        {
            let mut sessions = self.inner.sessions.lock();
            // `stop` drains under this lock once `done` has fired
            if self.inner.done.is_done() {
                return Err(anyhow!("{} refused {}, stopping", self.name(), remote_addr));
            }
            let max = cfg.max_allowed_connection;
            if max > 0 && sessions.len() >= max {
                return Err(anyhow!("{} refused {}, too many connections", self.name(), remote_addr));
            }
            sessions.insert(session.id().to_owned(), session.clone());
        }
        let _registered = scopeguard::guard(session.id().to_owned(), |id| {
            self.inner.sessions.lock().remove(&id);
        });

        self.admit(&session, remote_addr).await?;
        if session.is_closed() {
            // ended while on_connect ran, drop any directory entry it left behind
            DeviceSession::disconnect(&session);
            return Err(GatewayError::SessionClosed.into());
        }
        log::info!("{} {} {} connected, device: {:?}", self.name(), remote_addr, session.id(), session.device_id());

        let (reader, writer) = tokio::io::split(io);
        tokio::spawn(write_loop(session.clone(), rx, writer));
        let res = self.read_loop(&session, reader, framer).await;

        DeviceSession::disconnect(&session);
        let reason = match res {
            Ok(reason) => reason.to_owned(),
            Err(e) => e.to_string(),
        };
        log::info!("{} {} {} disconnected, {}", self.name(), remote_addr, session.id(), reason);

        let ctx = CloseContext {
            scx: self.inner.scx.clone(),
            product_id: cfg.product_id.clone(),
            device_id: session.device_id(),
            session_id: session.id().to_owned(),
            reason,
        };
        match catch_panic(self.inner.codec.on_close(&ctx)).await {
            Err(e) if !GatewayError::is_not_implemented(&e) => {
                log::warn!("{} {} on_close failed, {}", self.name(), session.id(), e);
            }
            _ => {}
        }
        Ok(())
    }

    /// Runs `on_connect`. Without the hook the connection is accepted anonymously.
    async fn admit(&self, session: &TcpSession, remote_addr: SocketAddr) -> Result<()> {
        let mut ctx = ConnectContext::new(
            self.inner.scx.clone(),
            self.inner.cfg.product_id.clone(),
            session.id().to_owned(),
            remote_addr,
        );
        match catch_panic(self.inner.codec.on_connect(&mut ctx)).await {
            Err(e) if GatewayError::is_not_implemented(&e) => {}
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        if let Some(code) = ctx.rejected().filter(|code| !code.success()) {
            return Err(GatewayError::Refused(code).into());
        }

        if let Some(device_id) = ctx.device_id() {
            let _ = session.inner.device_id.set(device_id.to_owned());
            if let Some(prev) = self.inner.scx.sessions.put(device_id.to_owned(), Arc::new(session.clone())) {
                log::info!("device {} online again, disconnect session {}", device_id, prev.id());
                prev.disconnect();
            }
        }
        Ok(())
    }

    async fn read_loop<R>(&self, session: &TcpSession, reader: R, mut framer: Framer) -> Result<&'static str>
    where
        R: AsyncRead + Unpin,
    {
        framer.pause();
        let mut frames = FramedRead::new(reader, framer);
        let keepalive = self.inner.cfg.keepalive;
        loop {
            // one frame at a time, the next is parsed once on_message returned
            frames.decoder_mut().fetch(1);
            let next = tokio::select! {
                _ = session.inner.done.wait() => return Ok("closed"),
                next = next_frame(&mut frames, keepalive) => next?,
            };
            match next {
                Some(frame) => session.on_message(frame).await,
                None => return Ok("peer closed"),
            }
        }
    }
}

async fn next_frame<R>(frames: &mut FramedRead<R, Framer>, keepalive: Duration) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let next = if keepalive.is_zero() {
        frames.next().await
    } else {
        match tokio::time::timeout(keepalive, frames.next()).await {
            Ok(next) => next,
            Err(_) => return Err(MqttError::ReadTimeout.into()),
        }
    };
    next.transpose()
}

async fn write_loop<Io>(session: TcpSession, mut rx: mpsc::Receiver<Bytes>, mut writer: WriteHalf<Io>)
where
    Io: AsyncRead + AsyncWrite,
{
    loop {
        tokio::select! {
            biased;
            data = rx.recv() => match data {
                Some(data) => {
                    let res = async {
                        writer.write_all(&data).await?;
                        writer.flush().await
                    }
                    .await;
                    if let Err(e) = res {
                        log::debug!("{} {} write error, {}", session.inner.remote_addr, session.id(), e);
                        break;
                    }
                }
                None => break,
            },
            _ = session.inner.done.wait() => break,
        }
    }
    session.close();
    let _ = writer.shutdown().await;
}

fn listen(cfg: &TcpNetwork) -> Result<Listener> {
    let certs = cfg
        .certificate
        .iter()
        .map(|c| TlsCertificate { name: c.name.clone(), cert: c.cert.clone(), key: c.key.clone() })
        .collect();
    let listener = Builder::new()
        .name(cfg.name.as_str())
        .laddr(cfg.laddr())
        .backlog(cfg.backlog)
        .nodelay(true)
        .max_connections(cfg.max_allowed_connection)
        .tls_certs(certs)
        .bind()?;
    if cfg.use_tls {
        #[cfg(feature = "tls")]
        return listener.tls();
        #[cfg(not(feature = "tls"))]
        return Err(anyhow!("{} requires TLS, built without the tls feature", cfg.name));
    }
    listener.tcp()
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TcpServer {{ name: {}, local_addr: {}, sessions: {} }}", self.name(), self.local_addr(), self.total_connection())
    }
}

#[async_trait]
impl Server for TcpServer {
    fn name(&self) -> &str {
        TcpServer::name(self)
    }

    fn kind(&self) -> ServerKind {
        ServerKind::Tcp
    }

    fn total_connection(&self) -> usize {
        TcpServer::total_connection(self)
    }

    async fn stop(&self) {
        TcpServer::stop(self).await
    }
}
