use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use iotgw_codec::{Codec, Packet};

use crate::error::MqttError;
use crate::{Builder, Result};

/// An accepted connection, after the optional TLS handshake.
pub struct Dispatcher<Io> {
    pub(crate) io: Io,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl<Io> Dispatcher<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: Io, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Self {
        Dispatcher { io, remote_addr, cfg }
    }

    #[inline]
    pub fn mqtt(self) -> v3::MqttStream<Io> {
        let codec = Codec::new(self.cfg.max_packet_size);
        v3::MqttStream { io: Framed::new(self.io, codec), remote_addr: self.remote_addr, cfg: self.cfg }
    }

    /// The raw byte stream, for transports that do their own framing.
    #[inline]
    pub fn into_inner(self) -> Io {
        self.io
    }
}

pub mod v3 {
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use futures::stream::{SplitSink, SplitStream};
    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_util::codec::Framed;

    use iotgw_codec::{Codec, Connect, ConnectAck, ConnectAckReason, Packet};

    use crate::error::MqttError;
    use crate::{Builder, Error, Result};

    pub struct MqttStream<Io> {
        pub io: Framed<Io, Codec>,
        pub remote_addr: SocketAddr,
        pub cfg: Arc<Builder>,
    }

    impl<Io> MqttStream<Io>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        #[inline]
        pub async fn send_connect_ack(
            &mut self,
            return_code: ConnectAckReason,
            session_present: bool,
        ) -> Result<()> {
            self.send(Packet::ConnectAck(ConnectAck { session_present, return_code })).await
        }

        #[inline]
        pub async fn send(&mut self, packet: Packet) -> Result<()> {
            super::send(&mut self.io, packet, self.cfg.send_timeout).await
        }

        #[inline]
        pub async fn close(&mut self) -> Result<()> {
            if self.cfg.send_timeout.is_zero() {
                SinkExt::<Packet>::close(&mut self.io).await?;
                return Ok(());
            }
            match tokio::time::timeout(self.cfg.send_timeout, SinkExt::<Packet>::close(&mut self.io)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(MqttError::Encode(e).into()),
                Err(_) => Err(MqttError::CloseTimeout.into()),
            }
        }

        #[inline]
        pub async fn recv(&mut self, tm: Duration) -> Result<Option<Packet>> {
            match tokio::time::timeout(tm, self.next()).await {
                Ok(Some(Ok(msg))) => Ok(Some(msg)),
                Ok(Some(Err(e))) => Err(e),
                Ok(None) => Ok(None),
                Err(_) => Err(MqttError::ReadTimeout.into()),
            }
        }

        /// Waits for the leading CONNECT, anything else is a protocol error.
        #[inline]
        pub async fn recv_connect(&mut self, tm: Duration) -> Result<Box<Connect>> {
            match self.recv(tm).await? {
                Some(Packet::Connect(connect)) => Ok(connect),
                _ => Err(MqttError::InvalidProtocol.into()),
            }
        }

        /// Splits into independently owned read and write halves, keeping any bytes already buffered.
        pub fn split(self) -> (PacketWriter<Io>, PacketReader<Io>) {
            let (sink, stream) = self.io.split::<Packet>();
            (
                PacketWriter { sink, send_timeout: self.cfg.send_timeout },
                PacketReader { stream, remote_addr: self.remote_addr },
            )
        }
    }

    impl<Io> futures::Stream for MqttStream<Io>
    where
        Io: AsyncRead + Unpin,
    {
        type Item = Result<Packet>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let next = Pin::new(&mut self.io).poll_next(cx);
            Poll::Ready(match futures::ready!(next) {
                Some(Ok(packet)) => Some(Ok(packet)),
                Some(Err(e)) => Some(Err(Error::from(MqttError::Decode(e)))),
                None => None,
            })
        }
    }

    pub struct PacketReader<Io> {
        stream: SplitStream<Framed<Io, Codec>>,
        pub remote_addr: SocketAddr,
    }

    impl<Io> PacketReader<Io>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        /// `None` waits without a deadline. `Ok(None)` means the peer closed the stream.
        pub async fn recv(&mut self, tm: Option<Duration>) -> Result<Option<Packet>> {
            let next = match tm {
                Some(tm) => match tokio::time::timeout(tm, self.stream.next()).await {
                    Ok(next) => next,
                    Err(_) => return Err(MqttError::ReadTimeout.into()),
                },
                None => self.stream.next().await,
            };
            match next {
                Some(Ok(packet)) => Ok(Some(packet)),
                Some(Err(e)) => Err(MqttError::Decode(e).into()),
                None => Ok(None),
            }
        }
    }

    pub struct PacketWriter<Io> {
        sink: SplitSink<Framed<Io, Codec>, Packet>,
        send_timeout: Duration,
    }

    impl<Io> PacketWriter<Io>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        #[inline]
        pub async fn send(&mut self, packet: Packet) -> Result<()> {
            if self.send_timeout.is_zero() {
                self.sink.send(packet).await.map_err(MqttError::Encode)?;
                return Ok(());
            }
            match tokio::time::timeout(self.send_timeout, self.sink.send(packet)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(MqttError::Encode(e).into()),
                Err(_) => Err(MqttError::WriteTimeout.into()),
            }
        }

        #[inline]
        pub async fn close(&mut self) -> Result<()> {
            self.sink.close().await.map_err(MqttError::Encode)?;
            Ok(())
        }
    }
}

#[inline]
async fn send<Io>(io: &mut Framed<Io, Codec>, packet: Packet, send_timeout: Duration) -> Result<()>
where
    Io: AsyncWrite + Unpin,
{
    if send_timeout.is_zero() {
        io.send(packet).await.map_err(MqttError::Encode)?;
        Ok(())
    } else {
        match tokio::time::timeout(send_timeout, io.send(packet)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MqttError::Encode(e)),
            Err(_) => Err(MqttError::WriteTimeout),
        }?;
        Ok(())
    }
}
