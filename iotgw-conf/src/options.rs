use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "iotgw", about = "IoT device connectivity gateway")]
pub struct Options {
    /// Config filename
    #[structopt(name = "cfg", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Overrides `log.level`
    #[structopt(name = "log-level", long)]
    pub log_level: Option<String>,
}
