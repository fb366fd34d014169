use crate::prelude::*;
use crate::datalog_writer::DatalogWriter;
use crate::sma::archive;
use crate::sma::session::InverterSession;
use crate::transport::StreamTransport;

use {
    anyhow::Result,
    serde::Serialize,
    std::sync::Arc,
    tokio::sync::broadcast,
};

const RECONNECT_DELAY_SECS: u64 = 30;
const SECONDS_PER_DAY: u32 = 86_400;

/// Keeps one session open to the root device at `inverter.address` and
/// polls every device behind it each `poll_interval`. Reconnects after
/// any failure until shutdown.
pub struct Poller {
    config: ConfigWrapper,
    inverter: config::Inverter,
    datalog: Option<DatalogWriter>,
    shutdown: broadcast::Receiver<()>,
}

impl Poller {
    pub fn new(
        config: ConfigWrapper,
        inverter: config::Inverter,
        datalog: Option<DatalogWriter>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            inverter,
            datalog,
            shutdown,
        }
    }

    pub async fn start(mut self) {
        let address = self.inverter.address().to_string();

        loop {
            match self.run_session().await {
                Ok(()) => break,
                Err(e) => {
                    error!("inverter {}: {:#}", address, e);
                    info!("inverter {}: reconnecting in {}s", address, RECONNECT_DELAY_SECS);
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                _ = tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
            }
        }

        info!("inverter {}: poller stopped", address);
    }

    async fn run_session(&mut self) -> Result<()> {
        let transport = StreamTransport::open(self.inverter.address()).await?;
        self.run(Arc::new(transport)).await
    }

    /// One session over `transport`. Returns `Ok` only once shutdown was
    /// requested.
    pub async fn run(&mut self, transport: Arc<dyn Transport>) -> Result<()> {
        let mut session = InverterSession::connect(transport, self.inverter.read_timeout()).await?;

        let result = self.poll(&mut session).await;
        session.close().await;
        result
    }

    async fn setup(&self, session: &mut InverterSession) -> Result<()> {
        session.discover_devices(self.inverter.device_count()).await?;
        session
            .authenticate(self.inverter.password(), self.inverter.user_type())
            .await?;
        if let Err(e) = session.sync_time().await {
            warn!("time sync failed: {}", e);
        }

        match session.signal_strength().await {
            Ok(strength) => info!("{}: signal strength {}%", self.inverter.address(), strength),
            Err(e) => debug!("signal strength unavailable: {}", e),
        }

        for device in session.devices().to_vec() {
            if !device.authenticated {
                continue;
            }
            let info = session.read_inverter_info(device.serial).await?;
            info!(
                "{}: {} class {:?} type {:?} firmware {}",
                device.serial,
                info.name.as_deref().unwrap_or("unnamed"),
                info.device_class,
                info.device_type,
                info.firmware
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
            self.record(device.serial, "info", &info)?;
        }

        Ok(())
    }

    async fn read_daily_yields(&self, session: &mut InverterSession, serial: u32) -> Result<()> {
        let to = Utils::unix_now();
        // one extra day so the first requested day has a predecessor sample
        let from = to.saturating_sub((self.inverter.archive_days() + 1) * SECONDS_PER_DAY);

        let samples = session.read_month_yields(serial, from, to).await?;
        let yields = archive::daily_yields(&samples);
        for day in &yields {
            debug!("{}: {} produced {} Wh", serial, Utils::from_unix(day.time), day.energy);
        }
        self.record(serial, "daily_yields", &yields)
    }

    async fn poll(&mut self, session: &mut InverterSession) -> Result<()> {
        self.setup(session).await?;

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!("inverter {}: shutdown requested", self.inverter.address());
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            for device in session.devices().to_vec() {
                if device.authenticated {
                    self.poll_device(session, device.serial).await?;
                }
            }
        }
    }

    async fn poll_device(&self, session: &mut InverterSession, serial: u32) -> Result<()> {
        let ac = session.read_ac(serial).await?;
        let dc = session.read_dc(serial).await?;
        let stats = session.read_stats(serial).await?;
        let status = session.read_status(serial).await?;

        info!(
            "{}: AC {} W, DC {} W, today {} Wh, {:?}",
            serial,
            ac.total_power.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            dc.total_power().map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            stats.day_yield.map(|y| y.to_string()).unwrap_or_else(|| "-".to_string()),
            status.device_status
        );

        self.record(serial, "ac", &ac)?;
        self.record(serial, "dc", &dc)?;
        self.record(serial, "statistics", &stats)?;
        self.record(serial, "status", &status)?;

        if self.inverter.archive_days() > 0 {
            self.read_daily_yields(session, serial).await?;
        }
        Ok(())
    }

    fn record<T: Serialize>(&self, serial: u32, kind: &str, readings: &T) -> Result<()> {
        if let Some(datalog) = &self.datalog {
            datalog.write_readings(serial, kind, readings)?;
        }
        Ok(())
    }
}
