use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use iotgw_utils::{deserialize_duration, deserialize_non_empty, Bytesize};

pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// PEM certificate chain and key, stored inline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Certificate {
    #[serde(default)]
    pub name: String,
    pub cert: String,
    pub key: String,
}

/// `[mqtt.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttNetwork {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_host")]
    pub host: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub certificate: Vec<Certificate>,
    ///0 means unlimited
    #[serde(default)]
    pub max_allowed_connection: usize,
    #[serde(default = "MqttNetwork::max_packet_size_default")]
    pub max_packet_size: Bytesize,
    #[serde(default = "MqttNetwork::handshake_timeout_default", deserialize_with = "deserialize_duration")]
    pub handshake_timeout: Duration,
    #[serde(default = "MqttNetwork::send_timeout_default", deserialize_with = "deserialize_duration")]
    pub send_timeout: Duration,
    ///QoS 1 resend tick
    #[serde(default = "MqttNetwork::resend_interval_default", deserialize_with = "deserialize_duration")]
    pub resend_interval: Duration,
    #[serde(default = "MqttNetwork::outbound_queue_default")]
    pub outbound_queue: usize,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for MqttNetwork {
    fn default() -> Self {
        Self {
            name: "default/mqtt".into(),
            host: default_host(),
            port: 1883,
            product_id: String::new(),
            use_tls: false,
            certificate: Vec::new(),
            max_allowed_connection: 0,
            max_packet_size: Self::max_packet_size_default(),
            handshake_timeout: Self::handshake_timeout_default(),
            send_timeout: Self::send_timeout_default(),
            resend_interval: Self::resend_interval_default(),
            outbound_queue: Self::outbound_queue_default(),
            backlog: default_backlog(),
        }
    }
}

impl MqttNetwork {
    fn max_packet_size_default() -> Bytesize {
        Bytesize::from(1024 * 1024)
    }
    fn handshake_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
    fn send_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn resend_interval_default() -> Duration {
        Duration::from_millis(200)
    }
    fn outbound_queue_default() -> usize {
        50
    }

    #[inline]
    pub fn laddr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// `[tcp.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpNetwork {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_host")]
    pub host: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub certificate: Vec<Certificate>,
    #[serde(default)]
    pub max_allowed_connection: usize,
    ///Idle read deadline, 0 disables it
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub keepalive: Duration,
    #[serde(default = "TcpNetwork::outbound_queue_default")]
    pub outbound_queue: usize,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub delimeter: Delimeter,
}

impl TcpNetwork {
    fn outbound_queue_default() -> usize {
        256
    }

    #[inline]
    pub fn laddr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DelimType {
    Delimited,
    FixLength,
    SplitFunc,
}

/// Framing of a raw TCP stream.
#[derive(Debug, Clone, Deserialize)]
pub struct Delimeter {
    #[serde(rename = "type")]
    pub typ: DelimType,
    #[serde(default)]
    pub delimited: String,
    #[serde(default)]
    pub length: usize,
    ///0 means unlimited
    #[serde(default)]
    pub max_record_size: usize,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

impl Default for Delimeter {
    fn default() -> Self {
        Self {
            typ: DelimType::FixLength,
            delimited: String::new(),
            length: 128,
            max_record_size: 0,
            stages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    Delimited,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageAction {
    /// Add the stage bytes to the pending frame
    Append,
    /// Append, then emit the pending frame
    Complete,
    /// Append, then read the bytes as a big-endian length for the next stage
    Length,
    /// Drop the stage bytes
    Skip,
}

/// One step of a `SplitFunc` pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Stage {
    pub mode: StageMode,
    #[serde(default)]
    pub delimited: String,
    #[serde(default)]
    pub length: usize,
    pub action: StageAction,
}

/// `[[product]]` entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductConf {
    #[serde(deserialize_with = "deserialize_non_empty")]
    pub id: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// `[[device]]` entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConf {
    #[serde(deserialize_with = "deserialize_non_empty")]
    pub id: String,
    pub product_id: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Networks {
    #[serde(rename = "mqtt")]
    #[serde(default)]
    _mqtts: HashMap<String, MqttNetwork>,

    #[serde(rename = "tcp")]
    #[serde(default)]
    _tcps: HashMap<String, TcpNetwork>,

    #[serde(default, skip)]
    pub mqtts: Vec<Network<MqttNetwork>>,
    #[serde(default, skip)]
    pub tcps: Vec<Network<TcpNetwork>>,
}

impl Networks {
    /// Moves the name keyed tables into name ordered lists.
    pub(crate) fn init(&mut self) {
        for (name, mut inner) in self._mqtts.drain() {
            inner.name = format!("{name}/mqtt");
            self.mqtts.push(Network::new(inner));
        }
        for (name, mut inner) in self._tcps.drain() {
            inner.name = format!("{name}/tcp");
            self.tcps.push(Network::new(inner));
        }
        self.mqtts.sort_by(|a, b| a.name.cmp(&b.name));
        self.tcps.sort_by(|a, b| a.name.cmp(&b.name));
    }

    #[inline]
    pub(crate) fn set_default(&mut self) {
        self.mqtts.push(Network::new(MqttNetwork::default()));
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mqtts.is_empty() && self.tcps.is_empty()
    }
}

/// Shared, read-only network descriptor.
#[derive(Debug, Clone, Default)]
pub struct Network<T> {
    inner: Arc<T>,
}

impl<T> Network<T> {
    #[inline]
    pub fn new(inner: T) -> Self {
        Self { inner: Arc::new(inner) }
    }
}

impl<T> Deref for Network<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_backlog() -> i32 {
    512
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_network() {
        let n: TcpNetwork = toml::from_str(
            r#"
            port = 9000
            product_id = "meter"
            keepalive = "1m"
            delimeter = { type = "Delimited", delimited = "\r\n", max_record_size = 1024 }
            "#,
        )
        .unwrap();
        assert_eq!(n.laddr(), "0.0.0.0:9000".parse().unwrap());
        assert_eq!(n.keepalive, Duration::from_secs(60));
        assert_eq!(n.outbound_queue, 256);
        assert_eq!(n.delimeter.typ, DelimType::Delimited);
        assert_eq!(n.delimeter.delimited, "\r\n");
        assert_eq!(n.delimeter.max_record_size, 1024);
    }

    #[test]
    fn test_default_framing_is_fixed_128() {
        let n: TcpNetwork = toml::from_str("port = 9000").unwrap();
        assert_eq!(n.delimeter.typ, DelimType::FixLength);
        assert_eq!(n.delimeter.length, 128);
        assert_eq!(n.keepalive, Duration::ZERO);
    }

    #[test]
    fn test_split_func_stages() {
        let d: Delimeter = toml::from_str(
            r#"
            type = "SplitFunc"
            [[stages]]
            mode = "fixed"
            length = 2
            action = "length"
            [[stages]]
            mode = "fixed"
            action = "complete"
            "#,
        )
        .unwrap();
        assert_eq!(d.typ, DelimType::SplitFunc);
        assert_eq!(d.stages.len(), 2);
        assert_eq!(d.stages[0].action, StageAction::Length);
        assert_eq!(d.stages[1].mode, StageMode::Fixed);
    }

    #[test]
    fn test_mqtt_network_defaults() {
        let n: MqttNetwork = toml::from_str(
            r#"
            host = "127.0.0.1"
            port = 1884
            max_allowed_connection = 10
            resend_interval = "500ms"
            [[certificate]]
            name = "main"
            cert = "c"
            key = "k"
            "#,
        )
        .unwrap();
        assert_eq!(n.max_packet_size.as_usize(), 1024 * 1024);
        assert_eq!(n.handshake_timeout, Duration::from_secs(30));
        assert_eq!(n.resend_interval, Duration::from_millis(500));
        assert_eq!(n.outbound_queue, 50);
        assert_eq!(n.certificate[0].name, "main");
    }
}
