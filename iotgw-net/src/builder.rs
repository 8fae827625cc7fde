use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
#[cfg(not(target_os = "windows"))]
#[cfg(feature = "tls")]
use rustls::crypto::aws_lc_rs as provider;
#[cfg(feature = "tls")]
#[cfg(target_os = "windows")]
use rustls::crypto::ring as provider;
#[cfg(feature = "tls")]
use rustls::{
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    ServerConfig,
};
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(feature = "tls")]
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::error::MqttError;
use crate::stream::Dispatcher;
use crate::{Error, Result};

/// PEM encoded certificate chain and private key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsCertificate {
    pub name: String,
    pub cert: String,
    pub key: String,
}

/// Listener settings shared by the MQTT and raw TCP networks.
#[derive(Clone, Debug)]
pub struct Builder {
    /// Network name, used in logs
    pub name: String,
    pub laddr: SocketAddr,
    ///Pending connection queue passed to `listen(2)`
    pub backlog: i32,
    ///TCP_NODELAY on accepted sockets
    pub nodelay: bool,
    ///SO_REUSEADDR, left to the OS default when unset
    pub reuseaddr: Option<bool>,
    ///Connection cap of the network, 0 means unlimited
    pub max_connections: usize,
    ///Largest MQTT packet accepted, 0 means unlimited, default: 1M
    pub max_packet_size: u32,
    ///Bounds the TLS handshake and the wait for CONNECT
    pub handshake_timeout: Duration,
    ///Bounds every outbound MQTT packet write
    pub send_timeout: Duration,
    ///Tried in order, the first pair that loads is served
    pub tls_certs: Vec<TlsCertificate>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            name: Default::default(),
            laddr: SocketAddr::from(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 1883)),
            backlog: 512,
            nodelay: false,
            reuseaddr: None,
            max_connections: 0,
            max_packet_size: 1024 * 1024, //"1M"
            handshake_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            tls_certs: Vec::new(),
        }
    }

    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = name.into();
        self
    }

    pub fn laddr(mut self, laddr: SocketAddr) -> Self {
        self.laddr = laddr;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn reuseaddr(mut self, reuseaddr: Option<bool>) -> Self {
        self.reuseaddr = reuseaddr;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn tls_certs(mut self, tls_certs: Vec<TlsCertificate>) -> Self {
        self.tls_certs = tls_certs;
        self
    }

    pub fn bind(self) -> Result<Listener> {
        let builder = match self.laddr {
            SocketAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, None)?,
            SocketAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, None)?,
        };

        builder.set_linger(Some(Duration::from_secs(10)))?;

        builder.set_nonblocking(true)?;

        if let Some(reuseaddr) = self.reuseaddr {
            builder.set_reuse_address(reuseaddr)?;
        }

        builder.bind(&SockAddr::from(self.laddr))?;
        builder.listen(self.backlog)?;
        let tcp_listener = TcpListener::from_std(std::net::TcpListener::from(builder))?;
        let local_addr = tcp_listener.local_addr()?;
        log::info!("{} listening on {}", self.name, local_addr);
        Ok(Listener {
            typ: ListenerType::TCP,
            cfg: Arc::new(self),
            local_addr,
            tcp_listener,
            #[cfg(feature = "tls")]
            tls_acceptor: None,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ListenerType {
    TCP,
    #[cfg(feature = "tls")]
    TLS,
}

pub struct Listener {
    pub typ: ListenerType,
    pub cfg: Arc<Builder>,
    pub local_addr: SocketAddr,
    tcp_listener: TcpListener,
    #[cfg(feature = "tls")]
    tls_acceptor: Option<TlsAcceptor>,
}

impl Listener {
    pub fn tcp(mut self) -> Result<Self> {
        #[cfg(feature = "tls")]
        if matches!(self.typ, ListenerType::TLS) {
            return Err(anyhow!("{} is already a TLS listener", self.cfg.name));
        }
        self.typ = ListenerType::TCP;
        Ok(self)
    }

    #[cfg(feature = "tls")]
    pub fn tls(mut self) -> Result<Listener> {
        if matches!(self.typ, ListenerType::TLS) {
            return Ok(self);
        }

        let tls_config = self
            .cfg
            .tls_certs
            .iter()
            .find_map(|c| match server_config(c) {
                Ok(cfg) => Some(cfg),
                Err(e) => {
                    log::warn!("{} skip certificate {:?}, {}", self.cfg.name, c.name, e);
                    None
                }
            })
            .ok_or_else(|| MqttError::TlsConfig(format!("{} has no usable certificate", self.cfg.name)))?;

        self.tls_acceptor = Some(TlsAcceptor::from(Arc::new(tls_config)));
        self.typ = ListenerType::TLS;
        Ok(self)
    }

    pub async fn accept(&self) -> Result<Acceptor<TcpStream>> {
        let (socket, remote_addr) = self.tcp_listener.accept().await?;
        if let Err(e) = socket.set_nodelay(self.cfg.nodelay) {
            return Err(Error::from(e));
        }
        Ok(Acceptor {
            socket,
            remote_addr,
            #[cfg(feature = "tls")]
            acceptor: self.tls_acceptor.clone(),
            cfg: self.cfg.clone(),
            typ: self.typ,
        })
    }
}

#[cfg(feature = "tls")]
fn server_config(c: &TlsCertificate) -> Result<ServerConfig> {
    let cert_chain = CertificateDer::pem_slice_iter(c.cert.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MqttError::TlsConfig(e.to_string()))?;
    if cert_chain.is_empty() {
        return Err(MqttError::TlsConfig("no certificate in PEM".into()).into());
    }
    let key =
        PrivateKeyDer::from_pem_slice(c.key.as_bytes()).map_err(|e| MqttError::TlsConfig(e.to_string()))?;

    let provider = Arc::new(provider::default_provider());
    let tls_config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!(e))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| MqttError::TlsConfig(format!("bad certs/private key, {e}")))?;
    Ok(tls_config)
}

pub struct Acceptor<S> {
    pub(crate) socket: S,
    #[cfg(feature = "tls")]
    acceptor: Option<TlsAcceptor>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
    pub typ: ListenerType,
}

impl<S> Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    pub fn tcp(self) -> Result<Dispatcher<S>> {
        if matches!(self.typ, ListenerType::TCP) {
            Ok(Dispatcher::new(self.socket, self.remote_addr, self.cfg))
        } else {
            Err(anyhow!("{} accepted on a TLS listener", self.remote_addr))
        }
    }

    #[inline]
    #[cfg(feature = "tls")]
    pub async fn tls(self) -> Result<Dispatcher<TlsStream<S>>> {
        if !matches!(self.typ, ListenerType::TLS) {
            return Err(anyhow!("{} accepted on a plain TCP listener", self.remote_addr));
        }

        let acceptor = self.acceptor.ok_or(MqttError::ServiceUnavailable)?;
        let tls_s = match tokio::time::timeout(self.cfg.handshake_timeout, acceptor.accept(self.socket)).await
        {
            Ok(Ok(tls_s)) => tls_s,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(MqttError::ReadTimeout.into()),
        };
        Ok(Dispatcher::new(tls_s, self.remote_addr, self.cfg))
    }
}
