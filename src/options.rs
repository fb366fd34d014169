use clap::Parser;

/// SMA Bridge - reads SMA inverters over Bluetooth
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Optional runtime limit in seconds
    #[clap(short = 't', long = "time")]
    pub runtime: Option<u64>,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
