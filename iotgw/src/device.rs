//! Devices, products and the directory of live device sessions.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use iotgw_conf::{DeviceConf, ProductConf};

use crate::codec::Codec;
use crate::Result;

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type DeviceId = String;
pub type Config = HashMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub product_id: String,
    pub config: Config,
}

impl Device {
    pub fn new<I: Into<String>, P: Into<String>>(id: I, product_id: P) -> Self {
        Self { id: id.into(), product_id: product_id.into(), config: Config::default() }
    }

    pub fn config<K: Into<String>, V: Into<String>>(mut self, key: K, val: V) -> Self {
        self.config.insert(key.into(), val.into());
        self
    }
}

impl From<&DeviceConf> for Device {
    fn from(c: &DeviceConf) -> Self {
        Self { id: c.id.clone(), product_id: c.product_id.clone(), config: c.config.clone() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Product {
    pub id: String,
    pub config: Config,
}

impl Product {
    pub fn new<I: Into<String>>(id: I) -> Self {
        Self { id: id.into(), config: Config::default() }
    }

    pub fn config<K: Into<String>, V: Into<String>>(mut self, key: K, val: V) -> Self {
        self.config.insert(key.into(), val.into());
        self
    }
}

impl From<&ProductConf> for Product {
    fn from(c: &ProductConf) -> Self {
        Self { id: c.id.clone(), config: c.config.clone() }
    }
}

/// Device and product lookup. Evicting a device disconnects its live session.
#[derive(Clone)]
pub struct DeviceStore {
    devices: Arc<DashMap<DeviceId, Arc<Device>, ahash::RandomState>>,
    products: Arc<DashMap<String, Arc<Product>, ahash::RandomState>>,
    sessions: SessionDirectory,
}

impl DeviceStore {
    pub fn new(sessions: SessionDirectory) -> Self {
        Self { devices: Arc::new(DashMap::default()), products: Arc::new(DashMap::default()), sessions }
    }

    #[inline]
    pub fn get_device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.get(id).map(|d| d.value().clone())
    }

    #[inline]
    pub fn put_device(&self, device: Device) {
        self.devices.insert(device.id.clone(), Arc::new(device));
    }

    pub fn remove_device(&self, id: &str) -> Option<Arc<Device>> {
        let removed = self.devices.remove(id).map(|(_, d)| d);
        if removed.is_some() {
            self.sessions.remove_and_disconnect(id);
        }
        removed
    }

    #[inline]
    pub fn get_product(&self, id: &str) -> Option<Arc<Product>> {
        self.products.get(id).map(|p| p.value().clone())
    }

    #[inline]
    pub fn put_product(&self, product: Product) {
        self.products.insert(product.id.clone(), Arc::new(product));
    }

    /// Device config value, falling back to the device's product.
    pub fn config(&self, device: &Device, key: &str) -> Option<String> {
        if let Some(v) = device.config.get(key) {
            return Some(v.clone());
        }
        self.get_product(&device.product_id).and_then(|p| p.config.get(key).cloned())
    }

    #[inline]
    pub fn devices_count(&self) -> usize {
        self.devices.len()
    }
}

impl fmt::Debug for DeviceStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceStore {{ devices: {}, products: {} }}", self.devices.len(), self.products.len())
    }
}

/// Transport neutral surface of a connected device.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Session id, unique per connection attempt.
    fn id(&self) -> &str;

    fn device_id(&self) -> Option<String>;

    /// MQTT publishes on `topic`, raw TCP writes `payload` as is.
    async fn send(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Ends the session and its connection.
    fn disconnect(&self);

    /// Closes the connection only.
    fn close(&self);

    fn info(&self) -> serde_json::Value;

    /// Codec of the server that owns this session.
    fn codec(&self) -> Arc<dyn Codec>;
}

/// Device id to live session.
#[derive(Clone, Default)]
pub struct SessionDirectory {
    sessions: Arc<DashMap<DeviceId, Arc<dyn DeviceSession>, ahash::RandomState>>,
}

impl SessionDirectory {
    #[inline]
    pub fn get(&self, device_id: &str) -> Option<Arc<dyn DeviceSession>> {
        self.sessions.get(device_id).map(|s| s.value().clone())
    }

    /// Registers `session`, returning the session it replaced.
    #[inline]
    pub fn put(&self, device_id: DeviceId, session: Arc<dyn DeviceSession>) -> Option<Arc<dyn DeviceSession>> {
        self.sessions.insert(device_id, session)
    }

    #[inline]
    pub fn remove(&self, device_id: &str) -> Option<Arc<dyn DeviceSession>> {
        self.sessions.remove(device_id).map(|(_, s)| s)
    }

    /// Removes the entry only if it still belongs to session `session_id`.
    #[inline]
    pub fn remove_if_same(&self, device_id: &str, session_id: &str) -> bool {
        self.sessions.remove_if(device_id, |_, s| s.id() == session_id).is_some()
    }

    pub fn remove_and_disconnect(&self, device_id: &str) {
        if let Some(s) = self.remove(device_id) {
            log::debug!("disconnect session {} of device {}", s.id(), device_id);
            s.disconnect();
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
