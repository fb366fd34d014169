use crate::prelude::*;
use crate::sma::packet::UserType;

use anyhow::{bail, Result};
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::sync::{Arc, Mutex, MutexGuard};

const MAX_PASSWORD_LEN: usize = 12;

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub inverters: Vec<Inverter>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    /// Optional path to append readings to as JSON lines
    pub datalog_file: Option<String>,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_poll_interval")]
    pub poll_interval: Duration,
}

// Inverter {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    /// RFCOMM tty path or `host:port` of a serial bridge
    pub address: String,
    #[serde(default = "Config::default_password")]
    pub password: String,
    #[serde(default)]
    pub user_type: UserType,

    pub device_count: Option<usize>,
    pub archive_days: Option<u32>,
    pub read_timeout: Option<u64>,
}

impl Inverter {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn user_type(&self) -> UserType {
        self.user_type
    }

    pub fn device_count(&self) -> usize {
        self.device_count.unwrap_or(1)
    }

    pub fn archive_days(&self) -> u32 {
        self.archive_days.unwrap_or(0)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout.unwrap_or(5))
    }

    fn validate(&self, i: usize) -> Result<()> {
        let address = self.address.trim();
        if address.is_empty() {
            return Err(file_error!("inverter[{}].address cannot be empty", i));
        }
        if !address.starts_with('/') {
            match address.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() => {
                    if !matches!(port.parse::<u16>(), Ok(p) if p > 0) {
                        bail!("inverter[{}].port must be between 1 and 65535", i);
                    }
                }
                _ => {
                    return Err(file_error!(
                        "inverter[{}].address {} is neither a device path nor host:port",
                        i,
                        address
                    ))
                }
            }
        }
        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(file_error!(
                "inverter[{}].password is longer than {} bytes",
                i,
                MAX_PASSWORD_LEN
            ));
        }
        if self.device_count() == 0 {
            return Err(file_error!("inverter[{}].device_count must be at least 1", i));
        }
        if self.read_timeout.unwrap_or(5) == 0 {
            return Err(file_error!("inverter[{}]: invalid read timeout: 0", i));
        }
        Ok(())
    }
} // }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn inverters(&self) -> Vec<Inverter> {
        self.lock().inverters.clone()
    }

    pub fn enabled_inverters(&self) -> Vec<Inverter> {
        self.inverters().into_iter().filter(|i| i.enabled()).collect()
    }

    pub fn loglevel(&self) -> String {
        self.lock().loglevel.clone()
    }

    pub fn datalog_file(&self) -> Option<String> {
        self.lock().datalog_file.clone()
    }

    pub fn poll_interval(&self) -> Duration {
        self.lock().poll_interval
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| file_error!("error reading {}: {}", file, err))?;

        let config = Self::from_yaml(&content)?;

        info!("Configuration loaded successfully:");
        info!(
            "  Inverters: {} configured, {} enabled",
            config.inverters.len(),
            config.inverters.iter().filter(|i| i.enabled).count()
        );
        for (i, inv) in config.inverters.iter().enumerate() {
            info!("    Inverter[{}]:", i);
            info!("      Enabled: {}", inv.enabled);
            info!("      Address: {}", inv.address);
            info!("      User Type: {:?}", inv.user_type);
            info!("      Device Count: {}", inv.device_count());
            info!("      Archive Days: {}", inv.archive_days());
            info!("      Read Timeout: {}s", inv.read_timeout().as_secs());
        }
        info!("  Poll Interval: {}s", config.poll_interval.as_secs());
        info!(
            "  Datalog File: {}",
            config.datalog_file.as_deref().unwrap_or("disabled")
        );
        info!("  Log Level: {}", config.loglevel);

        Ok(config)
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(file_error!("poll_interval must be at least 1 second"));
        }

        for (i, inv) in self.inverters.iter().enumerate() {
            if inv.enabled {
                inv.validate(i)?;
            }
        }

        Ok(())
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_password() -> String {
        "0000".to_string()
    }

    fn default_poll_interval() -> Duration {
        Duration::from_secs(300)
    }
}
