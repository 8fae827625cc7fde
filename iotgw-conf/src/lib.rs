#![deny(unsafe_code)]

//! Gateway settings.
//!
//! Sources are merged in this order, later ones win:
//! `/etc/iotgw/iotgw.toml`, `./iotgw.toml`, the `--cfg` file, then `IOTGW_*` environment variables.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use config::{Config, File, FileFormat};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use self::logging::{Level, Log};
use self::network::Networks;

pub use self::network::{
    Certificate, DelimType, Delimeter, DeviceConf, MqttNetwork, Network, ProductConf, Stage, StageAction,
    StageMode, TcpNetwork,
};
pub use self::options::Options;

pub mod logging;
pub mod network;
pub mod options;

pub type Result<T> = anyhow::Result<T>;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(flatten)]
    pub networks: Networks,
    #[serde(default, rename = "product")]
    pub products: Vec<ProductConf>,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConf>,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/iotgw/iotgw").required(false))
            .add_source(File::with_name("iotgw").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("iotgw").prefix_separator("_").separator("__").try_parsing(true),
        );

        Self::build(builder.build()?.try_deserialize()?, opts)
    }

    /// Settings from a TOML document only, without the file and environment sources.
    pub fn from_toml(text: &str) -> Result<Self> {
        let cfg = Config::builder().add_source(File::from_str(text, FileFormat::Toml)).build()?;
        Self::build(cfg.try_deserialize()?, Options::default())
    }

    fn build(mut inner: Inner, opts: Options) -> Result<Self> {
        inner.networks.init();
        if inner.networks.is_empty() {
            //set default
            inner.networks.set_default();
        }

        //Command line configuration overriding file configuration
        if let Some(level) = opts.log_level.as_ref() {
            let level = slog::Level::from_str(level).map_err(|_| anyhow!("invalid log level {level:?}"))?;
            inner.log.level = Level::from(level);
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> Option<&'static Self> {
        SETTINGS.get()
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn mqtts(&self) -> &[Network<MqttNetwork>] {
        &self.networks.mqtts
    }

    #[inline]
    pub fn tcps(&self) -> &[Network<TcpNetwork>] {
        &self.networks.tcps
    }

    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        for n in self.mqtts() {
            log::info!("mqtt network {} on {}, tls: {}", n.name, n.laddr(), n.use_tls);
        }
        for n in self.tcps() {
            log::info!("tcp network {} on {}, framing: {:?}", n.name, n.laddr(), n.delimeter.typ);
        }
        log::info!("{} products, {} devices configured", self.products.len(), self.devices.len());
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_network() {
        let s = Settings::from_toml("").unwrap();
        assert_eq!(s.mqtts().len(), 1);
        assert_eq!(s.mqtts()[0].port, 1883);
        assert!(s.tcps().is_empty());
        assert!(s.devices.is_empty());
    }

    #[test]
    fn test_full_document() {
        let s = Settings::from_toml(
            r#"
            [log]
            to = "console"
            level = "warn"

            [mqtt.external]
            port = 1883
            product_id = "thermo"
            max_allowed_connection = 100

            [tcp.meters]
            port = 9000
            product_id = "meter"
            delimeter = { type = "FixLength", length = 16 }

            [[product]]
            id = "thermo"
            config = { username = "u", password = "p" }

            [[device]]
            id = "dev-1"
            product_id = "thermo"
            "#,
        )
        .unwrap();
        assert_eq!(s.log.level.inner(), slog::Level::Warning);
        assert_eq!(s.mqtts()[0].name, "external/mqtt");
        assert_eq!(s.mqtts()[0].max_allowed_connection, 100);
        assert_eq!(s.tcps()[0].name, "meters/tcp");
        assert_eq!(s.tcps()[0].delimeter.length, 16);
        assert_eq!(s.products[0].config.get("username").map(|s| s.as_str()), Some("u"));
        assert_eq!(s.devices[0].product_id, "thermo");
    }

    #[test]
    fn test_blank_device_id() {
        let res = Settings::from_toml(
            r#"
            [[device]]
            id = "  "
            product_id = "thermo"
            "#,
        );
        assert!(res.is_err());
    }
}
