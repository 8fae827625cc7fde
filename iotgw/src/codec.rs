//! Hooks through which the business layer sees device traffic.
//!
//! A [`Codec`] is attached to every server. The transports call it with one of
//! the context types below and never interpret payloads themselves. Hooks that
//! are not overridden return [`GatewayError::CodecNotImplemented`], which the
//! transports treat as "use the built-in behavior".

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use iotgw_codec::ConnectAckReason;

use crate::context::ServerContext;
use crate::device::{Device, DeviceSession, Product};
use crate::{GatewayError, Result};

#[async_trait]
pub trait Codec: Send + Sync {
    ///Called once per admitted connection, before it is acknowledged
    async fn on_connect(&self, _ctx: &mut ConnectContext) -> Result<()> {
        Err(GatewayError::CodecNotImplemented.into())
    }

    ///Called for every inbound message or frame
    async fn on_message(&self, _ctx: &MessageContext) -> Result<()> {
        Err(GatewayError::CodecNotImplemented.into())
    }

    ///Called for a command addressed to a connected device
    async fn on_invoke(&self, _ctx: &InvokeContext) -> Result<()> {
        Err(GatewayError::CodecNotImplemented.into())
    }

    ///Called after a connection terminated
    async fn on_close(&self, _ctx: &CloseContext) -> Result<()> {
        Err(GatewayError::CodecNotImplemented.into())
    }
}

/// Admission state of one connection attempt.
pub struct ConnectContext {
    pub scx: ServerContext,
    pub product_id: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub remote_addr: SocketAddr,
    device_id: Option<String>,
    rejected: Option<ConnectAckReason>,
}

impl ConnectContext {
    pub fn new(scx: ServerContext, product_id: String, client_id: String, remote_addr: SocketAddr) -> Self {
        Self {
            scx,
            product_id,
            client_id,
            username: None,
            password: None,
            remote_addr,
            device_id: None,
            rejected: None,
        }
    }

    pub fn credentials(mut self, username: Option<String>, password: Option<Bytes>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// Binds the connection to device `id`. The first successful call wins.
    pub fn device_online(&mut self, id: &str) -> Result<()> {
        let id = id.trim();
        if self.scx.devices.get_device(id).is_none() {
            self.reject(ConnectAckReason::IdentifierRejected);
            return Err(GatewayError::DeviceNotFound(id.into()).into());
        }
        match &self.device_id {
            Some(bound) if bound != id => {
                log::warn!("{} already bound to device {}, ignore {}", self.client_id, bound, id);
            }
            Some(_) => {}
            None => self.device_id = Some(id.to_owned()),
        }
        Ok(())
    }

    #[inline]
    pub fn auth_fail(&mut self) {
        self.reject(ConnectAckReason::NotAuthorized)
    }

    #[inline]
    pub fn reject(&mut self, code: ConnectAckReason) {
        self.rejected = Some(code);
    }

    #[inline]
    pub fn device(&self, id: &str) -> Option<Arc<Device>> {
        self.scx.devices.get_device(id)
    }

    #[inline]
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    #[inline]
    pub fn rejected(&self) -> Option<ConnectAckReason> {
        self.rejected
    }

    /// Username/password equality against the device, then the product, config.
    pub(crate) fn check_auth(&mut self) -> Result<()> {
        let device = match self.scx.devices.get_device(&self.client_id) {
            Some(d) => d,
            None => {
                self.reject(ConnectAckReason::IdentifierRejected);
                return Err(GatewayError::Refused(ConnectAckReason::IdentifierRejected).into());
            }
        };
        let expected_username = self.scx.devices.config(&device, "username").unwrap_or_default();
        let expected_password = self.scx.devices.config(&device, "password").unwrap_or_default();
        let username = self.username.as_deref().unwrap_or_default();
        let password = self.password.as_deref().unwrap_or_default();
        if expected_username != username || expected_password.as_bytes() != password {
            self.auth_fail();
            return Err(GatewayError::Refused(ConnectAckReason::NotAuthorized).into());
        }
        let id = self.client_id.clone();
        self.device_online(&id)
    }
}

impl fmt::Debug for ConnectContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectContext")
            .field("product_id", &self.product_id)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("remote_addr", &self.remote_addr)
            .field("device_id", &self.device_id)
            .field("rejected", &self.rejected)
            .finish()
    }
}

/// One inbound message: an MQTT publish or a raw TCP frame.
pub struct MessageContext {
    pub scx: ServerContext,
    pub product_id: String,
    pub device_id: Option<String>,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub session: Arc<dyn DeviceSession>,
}

impl MessageContext {
    #[inline]
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device_id.as_deref().and_then(|id| self.scx.devices.get_device(id))
    }

    pub fn product(&self) -> Option<Arc<Product>> {
        match self.device() {
            Some(d) => self.scx.devices.get_product(&d.product_id),
            None => self.scx.devices.get_product(&self.product_id),
        }
    }

    pub fn config(&self, key: &str) -> Option<String> {
        match self.device() {
            Some(d) => self.scx.devices.config(&d, key),
            None => self.product().and_then(|p| p.config.get(key).cloned()),
        }
    }
}

/// A named command for a connected device.
pub struct InvokeContext {
    pub scx: ServerContext,
    pub device_id: String,
    pub name: String,
    pub args: serde_json::Value,
    pub session: Arc<dyn DeviceSession>,
}

#[derive(Debug)]
pub struct CloseContext {
    pub scx: ServerContext,
    pub product_id: String,
    pub device_id: Option<String>,
    pub session_id: String,
    pub reason: String,
}

/// Logs traffic and forwards commands as JSON. Leaves `on_connect` to the built-in auth.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCodec;

#[async_trait]
impl Codec for LogCodec {
    async fn on_message(&self, ctx: &MessageContext) -> Result<()> {
        log::info!(
            "message from {:?}, session: {}, topic: {:?}, packet_id: {:?}, payload: {:?}",
            ctx.device_id,
            ctx.session.id(),
            ctx.topic,
            ctx.packet_id,
            ctx.payload
        );
        Ok(())
    }

    async fn on_invoke(&self, ctx: &InvokeContext) -> Result<()> {
        let payload = serde_json::to_vec(&ctx.args)?;
        ctx.session.send(&ctx.name, Bytes::from(payload)).await
    }

    async fn on_close(&self, ctx: &CloseContext) -> Result<()> {
        log::info!("session {} of device {:?} closed, {}", ctx.session_id, ctx.device_id, ctx.reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::device::tests::DummySession;
    use crate::device::Device;

    fn scx() -> ServerContext {
        ServerContext::new()
            .products(vec![Product::new("meter").config("username", "u").config("password", "p")])
            .devices(vec![
                Device::new("dev-1", "meter"),
                Device::new("dev-2", "meter").config("password", "secret"),
            ])
            .build()
    }

    fn ctx(client_id: &str, username: Option<&str>, password: Option<&'static str>) -> ConnectContext {
        ConnectContext::new(scx(), "meter".into(), client_id.into(), ([127, 0, 0, 1], 1).into())
            .credentials(username.map(Into::into), password.map(|p| Bytes::from_static(p.as_bytes())))
    }

    #[test]
    fn test_check_auth_product_fallback() {
        let mut c = ctx("dev-1", Some("u"), Some("p"));
        c.check_auth().unwrap();
        assert_eq!(c.device_id(), Some("dev-1"));
        assert_eq!(c.rejected(), None);
    }

    #[test]
    fn test_check_auth_device_overrides_product() {
        let mut c = ctx("dev-2", Some("u"), Some("p"));
        assert!(c.check_auth().is_err());
        assert_eq!(c.rejected(), Some(ConnectAckReason::NotAuthorized));

        let mut c = ctx("dev-2", Some("u"), Some("secret"));
        c.check_auth().unwrap();
    }

    #[test]
    fn test_check_auth_unknown_device() {
        let mut c = ctx("ghost", Some("u"), Some("p"));
        assert!(c.check_auth().is_err());
        assert_eq!(c.rejected(), Some(ConnectAckReason::IdentifierRejected));
        assert_eq!(c.device_id(), None);
    }

    #[test]
    fn test_device_online_trims_and_binds_once() {
        let mut c = ctx("any", None, None);
        c.device_online(" dev-1 ").unwrap();
        c.device_online("dev-2").unwrap();
        assert_eq!(c.device_id(), Some("dev-1"));

        let e = c.device_online("nope").unwrap_err();
        assert_eq!(e.downcast_ref::<GatewayError>(), Some(&GatewayError::DeviceNotFound("nope".into())));
        assert_eq!(c.rejected(), Some(ConnectAckReason::IdentifierRejected));
    }

    struct Recorder(Mutex<Vec<(String, Bytes)>>);

    #[async_trait]
    impl DeviceSession for Recorder {
        fn id(&self) -> &str {
            "rec"
        }
        fn device_id(&self) -> Option<String> {
            Some("dev-1".into())
        }
        async fn send(&self, topic: &str, payload: Bytes) -> Result<()> {
            self.0.lock().push((topic.into(), payload));
            Ok(())
        }
        fn disconnect(&self) {}
        fn close(&self) {}
        fn info(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
        fn codec(&self) -> Arc<dyn Codec> {
            Arc::new(LogCodec)
        }
    }

    #[tokio::test]
    async fn test_log_codec_invoke_sends_json() {
        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        let ctx = InvokeContext {
            scx: scx(),
            device_id: "dev-1".into(),
            name: "reboot".into(),
            args: serde_json::json!({ "delay": 5 }),
            session: rec.clone(),
        };
        LogCodec.on_invoke(&ctx).await.unwrap();
        let sent = rec.0.lock().clone();
        assert_eq!(sent, vec![("reboot".to_string(), Bytes::from_static(br#"{"delay":5}"#))]);
    }

    #[tokio::test]
    async fn test_message_context_lookups() {
        let ctx = MessageContext {
            scx: scx(),
            product_id: "meter".into(),
            device_id: Some("dev-2".into()),
            topic: "t".into(),
            packet_id: None,
            payload: Bytes::new(),
            session: DummySession::new("s", "dev-2"),
        };
        assert_eq!(ctx.device().map(|d| d.id.clone()).as_deref(), Some("dev-2"));
        assert_eq!(ctx.product().map(|p| p.id.clone()).as_deref(), Some("meter"));
        assert_eq!(ctx.config("password").as_deref(), Some("secret"));
        assert_eq!(ctx.config("username").as_deref(), Some("u"));

        let mut c = ConnectContext::new(scx(), "".into(), "".into(), ([0, 0, 0, 0], 0).into());
        let e = LogCodec.on_connect(&mut c).await.unwrap_err();
        assert!(GatewayError::is_not_implemented(&e));
    }
}
