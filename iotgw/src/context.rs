use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::codec::InvokeContext;
use crate::device::{Device, DeviceStore, Product, SessionDirectory};
use crate::server::Servers;
use crate::utils::catch_panic;
use crate::{GatewayError, Result};

/// State shared by every server of one gateway process.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub devices: DeviceStore,
    pub sessions: SessionDirectory,
    pub servers: Servers,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> ServerContextBuilder {
        ServerContextBuilder::default()
    }

    /// Runs command `name` against the live session of `device_id`.
    pub async fn invoke(&self, device_id: &str, name: &str, args: serde_json::Value) -> Result<()> {
        let session = self.sessions.get(device_id).ok_or_else(|| GatewayError::DeviceNotFound(device_id.into()))?;
        let ctx = InvokeContext {
            scx: self.clone(),
            device_id: device_id.into(),
            name: name.into(),
            args,
            session: session.clone(),
        };
        let codec = session.codec();
        catch_panic(codec.on_invoke(&ctx)).await
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ServerContext {{ {:?}, sessions: {}, {:?} }}",
            self.devices,
            self.sessions.len(),
            self.servers
        )
    }
}

#[derive(Default)]
pub struct ServerContextBuilder {
    products: Vec<Product>,
    devices: Vec<Device>,
}

impl ServerContextBuilder {
    pub fn products(mut self, products: Vec<Product>) -> Self {
        self.products = products;
        self
    }

    pub fn devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = devices;
        self
    }

    pub fn build(self) -> ServerContext {
        let sessions = SessionDirectory::default();
        let devices = DeviceStore::new(sessions.clone());
        for p in self.products {
            devices.put_product(p);
        }
        for d in self.devices {
            devices.put_device(d);
        }
        ServerContext { inner: Arc::new(ServerContextInner { devices, sessions, servers: Servers::default() }) }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::device::tests::DummySession;

    #[tokio::test]
    async fn test_invoke() {
        let scx = ServerContext::new().devices(vec![Device::new("d1", "p1")]).build();
        assert_eq!(scx.devices.devices_count(), 1);

        let e = scx.invoke("d1", "reboot", serde_json::Value::Null).await.unwrap_err();
        assert_eq!(e.downcast_ref::<GatewayError>(), Some(&GatewayError::DeviceNotFound("d1".into())));

        scx.sessions.put("d1".into(), DummySession::new("s1", "d1"));
        scx.invoke("d1", "reboot", serde_json::json!({"delay": 1})).await.unwrap();

        let s = DummySession::new("s2", "d1");
        scx.sessions.put("d1".into(), s.clone());
        scx.devices.remove_device("d1");
        assert!(s.disconnected.load(Ordering::SeqCst));
    }
}
