use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use iotgw_codec::{Connect, ConnectAckReason, Packet};
use iotgw_conf::{MqttNetwork, Network};
use iotgw_net::{v3, Builder, Listener, ListenerType, TlsCertificate};

use crate::codec::{CloseContext, Codec, ConnectContext};
use crate::context::ServerContext;
use crate::device::HashMap;
use crate::mqtt::client::{read_loop, write_loop};
use crate::mqtt::{Client, ClientInfo, Session, SessionInfo};
use crate::server::{Server, ServerKind};
use crate::utils::{catch_panic, Done};
use crate::{Error, GatewayError, Result};

/// A running MQTT network.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    scx: ServerContext,
    cfg: Network<MqttNetwork>,
    codec: Arc<dyn Codec>,
    local_addr: SocketAddr,
    clients: Mutex<HashMap<String, Client>>,
    sessions: Mutex<HashMap<String, Session>>,
    done: Done,
    listener_closed: Done,
}

struct Admitted {
    client: Client,
    rx: mpsc::Receiver<Packet>,
    session: Session,
    session_present: bool,
}

impl Broker {
    /// Binds the listener, registers the broker into `scx.servers` and starts accepting.
    pub async fn start(scx: ServerContext, cfg: Network<MqttNetwork>, codec: Arc<dyn Codec>) -> Result<Broker> {
        let listener = listen(&cfg)?;
        let broker = Broker {
            inner: Arc::new(BrokerInner {
                scx: scx.clone(),
                local_addr: listener.local_addr,
                cfg,
                codec,
                clients: Mutex::new(HashMap::default()),
                sessions: Mutex::new(HashMap::default()),
                done: Done::new(),
                listener_closed: Done::new(),
            }),
        };
        scx.servers.register(Arc::new(broker.clone()))?;
        tokio::spawn(broker.clone().accept_loop(listener));
        Ok(broker)
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
        self.inner.clients.lock().len()
    }

    #[inline]
    pub fn client(&self, client_id: &str) -> Option<Client> {
        self.inner.clients.lock().get(client_id).cloned()
    }

    #[inline]
    pub fn session(&self, client_id: &str) -> Option<Session> {
        self.inner.sessions.lock().get(client_id).cloned()
    }

    /// Closes the listener and every client, tears down every session and unregisters.
    pub async fn stop(&self) {
        if !self.inner.done.fire() {
            return;
        }
        self.inner.listener_closed.wait().await;

        let clients = self.inner.clients.lock().drain().map(|(_, c)| c).collect::<Vec<_>>();
        for client in clients {
            client.close();
        }
        let sessions = self.inner.sessions.lock().drain().map(|(_, s)| s).collect::<Vec<_>>();
        for session in sessions {
            session.disconnect();
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
            let broker = self.clone();
            tokio::spawn(async move {
                let remote_addr = acceptor.remote_addr;
                let res = match acceptor.typ {
                    ListenerType::TCP => match acceptor.tcp() {
                        Ok(d) => broker.handle_conn(d.mqtt()).await,
                        Err(e) => Err(e),
                    },
                    #[cfg(feature = "tls")]
                    ListenerType::TLS => match acceptor.tls().await {
                        Ok(d) => broker.handle_conn(d.mqtt()).await,
                        Err(e) => Err(e),
                    },
                };
                if let Err(e) = res {
                    log::debug!("{} {} connection closed, {}", broker.name(), remote_addr, e);
                }
            });
        }
        drop(listener);
        self.inner.listener_closed.fire();
        log::info!("{} listener closed", self.name());
    }

    async fn handle_conn<Io>(&self, mut stream: v3::MqttStream<Io>) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connect = stream.recv_connect(self.inner.cfg.handshake_timeout).await?;
        let Admitted { client, rx, session, session_present } = match self.handshake(stream.remote_addr, *connect).await {
            Ok(admitted) => admitted,
            Err((code, e)) => {
                log::info!("{} {} refused, {}, {}", self.name(), stream.remote_addr, code.reason(), e);
                stream.send_connect_ack(code, false).await?;
                let _ = stream.close().await;
                return Err(e);
            }
        };

        log::info!(
            "{} {} {} connected, device: {:?}, session_present: {}",
            self.name(),
            stream.remote_addr,
            client.id(),
            client.info().device_id(),
            session_present
        );

        let res = match stream.send_connect_ack(ConnectAckReason::ConnectionAccepted, session_present).await {
            Ok(()) => {
                let (writer, mut reader) = stream.split();
                tokio::spawn(write_loop(client.clone(), rx, writer));
                read_loop(&client, &session, &mut reader).await
            }
            Err(e) => Err(e),
        };
        self.teardown(&client, &session, res).await;
        Ok(())
    }

    /// CONNECT validation, admission and session attachment.
    async fn handshake(
        &self,
        remote_addr: SocketAddr,
        connect: Connect,
    ) -> std::result::Result<Admitted, (ConnectAckReason, Error)> {
        let cfg = &self.inner.cfg;
        let refused = |code: ConnectAckReason| (code, Error::from(GatewayError::Refused(code)));

        if !connect.protocol.is_supported() {
            return Err(refused(ConnectAckReason::UnacceptableProtocolVersion));
        }
        if connect.password.is_some() && connect.username.is_none() {
            return Err(refused(ConnectAckReason::BadUserNameOrPassword));
        }
        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                return Err(refused(ConnectAckReason::IdentifierRejected));
            }
            uuid::Uuid::new_v4().to_string()
        } else {
            connect.client_id.to_string()
        };
        if self.is_full(&client_id) {
            return Err(refused(ConnectAckReason::ServiceUnavailable));
        }

        let username = connect.username.as_ref().map(|u| u.to_string());
        let info = ClientInfo::new(
            client_id.clone(),
            username.clone(),
            connect.password.clone(),
            connect.keep_alive,
            connect.clean_session,
            connect.protocol,
            remote_addr,
            connect.last_will,
        );

        let mut ctx =
            ConnectContext::new(self.inner.scx.clone(), cfg.product_id.clone(), client_id.clone(), remote_addr)
                .credentials(username.clone(), connect.password);
        let res = match catch_panic(self.inner.codec.on_connect(&mut ctx)).await {
            Err(e) if GatewayError::is_not_implemented(&e) => ctx.check_auth(),
            res => res,
        };
        match (ctx.rejected(), res) {
            (Some(code), res) if !code.success() => {
                let e = res.err().unwrap_or_else(|| GatewayError::Refused(code).into());
                return Err((code, e));
            }
            (_, Err(e)) => return Err((ConnectAckReason::NotAuthorized, e)),
            _ => {}
        }
        let device_id = ctx.device_id().map(ToOwned::to_owned);
        if let Some(id) = &device_id {
            info.set_device_id(id.clone());
        }

        let (client, rx) = Client::new(info, cfg.outbound_queue);

        // takeover, atomic with the capacity check. A stopping broker admits nobody,
        // `stop` drains under the same lock once `done` has fired.
        let old = {
            let mut clients = self.inner.clients.lock();
            let max = cfg.max_allowed_connection;
            if self.inner.done.is_done() || (max > 0 && !clients.contains_key(&client_id) && clients.len() >= max) {
                None
            } else {
                Some(clients.insert(client_id.clone(), client.clone()))
            }
        };
        match old {
            None => return Err(refused(ConnectAckReason::ServiceUnavailable)),
            Some(Some(old)) => {
                log::info!("{} {} takeover {}", self.name(), client_id, old.uid());
                old.close();
            }
            Some(None) => {}
        }

        let (session, session_present, replaced) = {
            let mut sessions = self.inner.sessions.lock();
            if self.inner.done.is_done() {
                return Err(refused(ConnectAckReason::ServiceUnavailable));
            }
            let reusable = sessions.get(&client_id).filter(|s| {
                !connect.clean_session && s.is_persistent() && !s.is_closed() && s.info().device_id == device_id
            });
            match reusable {
                Some(s) => (s.clone(), true, None),
                None => {
                    let info = SessionInfo {
                        client_id: client_id.clone(),
                        username,
                        clean_session: connect.clean_session,
                        protocol: connect.protocol,
                        product_id: cfg.product_id.clone(),
                        device_id: device_id.clone(),
                    };
                    let s = Session::new(self.inner.scx.clone(), self.inner.codec.clone(), info, cfg.resend_interval);
                    let replaced = sessions.insert(client_id.clone(), s.clone());
                    (s, false, replaced)
                }
            }
        };
        if let Some(replaced) = replaced {
            replaced.disconnect();
        }
        if !session_present {
            self.prune_on_close(&session);
        }
        session.attach(client.clone());

        if let Some(id) = &device_id {
            if let Some(prev) = self.inner.scx.sessions.put(id.clone(), Arc::new(session.clone())) {
                if prev.id() != session.id() {
                    log::info!("device {} online again, disconnect session {}", id, prev.id());
                    prev.disconnect();
                }
            }
        }
        // ended while attaching, e.g. by `stop`
        if session.is_closed() {
            if let Some(id) = &device_id {
                self.inner.scx.sessions.remove_if_same(id, session.id());
            }
            return Err(refused(ConnectAckReason::ServiceUnavailable));
        }

        Ok(Admitted { client, rx, session, session_present })
    }

    /// Drops `session` from the table once it ends, whoever ends it.
    fn prune_on_close(&self, session: &Session) {
        let inner = Arc::downgrade(&self.inner);
        let client_id = session.info().client_id.clone();
        let session_id = session.id().to_owned();
        session.on_closed(move || {
            if let Some(inner) = inner.upgrade() {
                let mut sessions = inner.sessions.lock();
                if sessions.get(&client_id).map(|s| s.id() == session_id).unwrap_or(false) {
                    sessions.remove(&client_id);
                }
            }
        });
    }

    #[inline]
    fn is_full(&self, client_id: &str) -> bool {
        let max = self.inner.cfg.max_allowed_connection;
        let clients = self.inner.clients.lock();
        max > 0 && !clients.contains_key(client_id) && clients.len() >= max
    }

    async fn teardown(&self, client: &Client, session: &Session, res: Result<&'static str>) {
        client.close();
        let reason = match res {
            Ok(reason) => reason.to_owned(),
            Err(e) => e.to_string(),
        };
        log::info!("{} {} {} disconnected, {}", self.name(), client.info().remote_addr, client.id(), reason);

        if let Some(will) = client.take_will() {
            session.on_message(will.topic.to_string(), None, will.message).await;
        }

        if session.is_persistent() {
            if session.detach_if(client.uid()) {
                if let Some(device_id) = &session.info().device_id {
                    self.inner.scx.sessions.remove_if_same(device_id, session.id());
                }
            }
        } else {
            session.disconnect();
        }

        {
            let mut clients = self.inner.clients.lock();
            if clients.get(client.id()).map(|c| c.uid() == client.uid()).unwrap_or(false) {
                clients.remove(client.id());
            }
        }

        let ctx = CloseContext {
            scx: self.inner.scx.clone(),
            product_id: self.inner.cfg.product_id.clone(),
            device_id: client.info().device_id().map(ToOwned::to_owned),
            session_id: session.id().to_owned(),
            reason,
        };
        match catch_panic(self.inner.codec.on_close(&ctx)).await {
            Err(e) if !GatewayError::is_not_implemented(&e) => {
                log::warn!("{} {} on_close failed, {}", self.name(), client.id(), e);
            }
            _ => {}
        }
    }
}

fn listen(cfg: &MqttNetwork) -> Result<Listener> {
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
        .max_packet_size(cfg.max_packet_size.as_u32())
        .handshake_timeout(cfg.handshake_timeout)
        .send_timeout(cfg.send_timeout)
        .tls_certs(certs)
        .bind()?;
    if cfg.use_tls {
        #[cfg(feature = "tls")]
        return listener.tls();
        #[cfg(not(feature = "tls"))]
        return Err(anyhow::anyhow!("{} requires TLS, built without the tls feature", cfg.name));
    }
    listener.tcp()
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Broker {{ name: {}, local_addr: {}, clients: {} }}", self.name(), self.local_addr(), self.total_connection())
    }
}

#[async_trait]
impl Server for Broker {
    fn name(&self) -> &str {
        Broker::name(self)
    }

    fn kind(&self) -> ServerKind {
        ServerKind::Mqtt
    }

    fn total_connection(&self) -> usize {
        Broker::total_connection(self)
    }

    async fn stop(&self) {
        Broker::stop(self).await
    }
}
