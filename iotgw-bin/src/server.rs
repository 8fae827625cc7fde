#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;

use iotgw::codec::{Codec, LogCodec};
use iotgw::context::ServerContext;
use iotgw::device::{Device, Product};
use iotgw::logger::logger_init;
use iotgw::mqtt::Broker;
use iotgw::tcp::TcpServer;
use iotgw::Result;
use iotgw_conf::{Options, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    //init config
    let settings = Settings::init(Options::from_args())?;

    //init log
    let _logger = logger_init(&settings.log)?;
    settings.logs();

    let scx = ServerContext::new()
        .products(settings.products.iter().map(Product::from).collect())
        .devices(settings.devices.iter().map(Device::from).collect())
        .build();
    let codec: Arc<dyn Codec> = Arc::new(LogCodec);

    //mqtt
    for cfg in settings.mqtts() {
        let broker = Broker::start(scx.clone(), cfg.clone(), codec.clone()).await?;
        log::info!("mqtt network {} listening on {}", broker.name(), broker.local_addr());
    }

    //raw tcp
    for cfg in settings.tcps() {
        let server = TcpServer::start(scx.clone(), cfg.clone(), codec.clone()).await?;
        log::info!("tcp network {} listening on {}", server.name(), server.local_addr());
    }

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down {} servers", scx.servers.len());
    scx.servers.stop_all().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
