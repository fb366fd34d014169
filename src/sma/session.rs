//! Application protocol client: discovery, logon, clock sync, channel
//! queries and archive paging on top of a connected [`DeviceLink`].

use crate::prelude::*;
use crate::retrying;
use crate::sma::archive::{self, ArchiveEntry, ArchiveKind, DayYield, Event};
use crate::sma::frame::FramedChannel;
use crate::sma::link::DeviceLink;
use crate::sma::packet::{
    Control, ControlWord, Reply, Request, Target, UserType, CMD_LOGOFF, CMD_LOGON,
    CMD_LOGON_ACK, CMD_TIME, LOGON_VALIDITY_SECS, PACKET_ID_FLAG, TIME_INDEX,
};
use crate::sma::readings::{AcReadings, DcReadings, InverterInfo, Query, Statistics, Status};
use crate::sma::record::{self, Record};
use crate::sma::transaction::TransactionCounter;

use {serde::Serialize, std::sync::Arc, tokio::time::Instant};

const DISCOVERY_OBJECT: u16 = 0x0000;
const TIME_TOLERANCE_SECS: i64 = 10;
// offsets within the reply body of a time request
const DEVICE_TIME_OFFSET: usize = 40;
const DEVICE_TIME2_OFFSET: usize = 44;
const TIME_ZONE_OFFSET: usize = 52;
// echoed password within a logon reply body
const PASSWORD_ECHO: std::ops::Range<usize> = 20..32;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub serial: u32,
    pub susy_id: u16,
    pub mac: MacAddress,
    pub authenticated: bool,
}

impl DeviceRecord {
    pub fn target(&self) -> Target {
        Target {
            susy_id: self.susy_id,
            serial: self.serial,
        }
    }
}

struct Exchange {
    framed: FramedChannel<DeviceLink>,
    own_serial: u32,
    timeout: Duration,
}

impl Exchange {
    async fn send(
        &mut self,
        request: &Request,
        destination: MacAddress,
        packet_id: u16,
    ) -> Result<()> {
        let bytes = request.bytes(self.own_serial, packet_id);
        debug!(
            "request 0x{:04x} to {:?} via {}",
            packet_id,
            request.target(),
            destination
        );
        self.framed.write(&bytes, destination).await
    }

    /// Next reply carrying `packet_id`; replies to other packets are skipped.
    async fn receive(&mut self, packet_id: u16) -> Result<(MacAddress, Reply)> {
        let wanted = packet_id & !PACKET_ID_FLAG;
        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout("reply"));
            }

            let frame = self.framed.read(remaining).await?;
            let reply = match Reply::parse(&frame.payload) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("dropping frame from {}: {}", frame.source, e);
                    continue;
                }
            };

            if reply.packet_id() != wanted {
                debug!(
                    "skipping reply to 0x{:04x} while waiting for 0x{:04x}",
                    reply.packet_id(),
                    wanted
                );
                continue;
            }

            trace!(
                "reply from {} ({}) status 0x{:04x} fragment {}",
                reply.header.src_serial,
                frame.source,
                reply.header.status,
                reply.header.fragment
            );
            return Ok((frame.source, reply));
        }
    }
}

/// One connected session with every inverter behind a Bluetooth root
/// device. Requests are strictly sequential.
pub struct InverterSession {
    exchange: Exchange,
    counter: TransactionCounter,
    devices: Vec<DeviceRecord>,
}

impl InverterSession {
    pub fn new(link: DeviceLink, own_serial: u32, timeout: Duration) -> Self {
        Self {
            exchange: Exchange {
                framed: FramedChannel::new(link),
                own_serial,
                timeout,
            },
            counter: TransactionCounter::new(),
            devices: Vec::new(),
        }
    }

    /// Runs the link handshake over `transport` and opens a session on it.
    pub async fn connect(transport: Arc<dyn Transport>, timeout: Duration) -> Result<Self> {
        let link = DeviceLink::new(transport);
        link.connect().await?;
        Ok(Self::new(link, Self::app_serial(), timeout))
    }

    /// Serial we identify as; SMA clients pick one from 9xxxxxxxx.
    pub fn app_serial() -> u32 {
        900_000_000 + Utils::unix_now() % 100_000_000
    }

    pub fn own_serial(&self) -> u32 {
        self.exchange.own_serial
    }

    pub fn link(&self) -> &DeviceLink {
        self.exchange.framed.channel()
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn packet_id(&self) -> u16 {
        self.counter.current()
    }

    fn device(&self, serial: u32) -> Result<DeviceRecord> {
        self.devices
            .iter()
            .find(|d| d.serial == serial)
            .copied()
            .ok_or_else(|| Error::Protocol(format!("unknown device {}", serial)))
    }

    // discovery {{{
    /// Finds the `expected` inverters answering a broadcast.
    pub async fn discover_devices(&mut self, expected: usize) -> Result<Vec<DeviceRecord>> {
        let devices = retrying!("device discovery", self.try_discover(expected))
            .map_err(|e| Error::DiscoveryFailed(Box::new(e)))?;

        info!(
            "discovered {} device(s): {:?}",
            devices.len(),
            devices.iter().map(|d| d.serial).collect::<Vec<_>>()
        );
        self.devices = devices.clone();
        Ok(devices)
    }

    async fn try_discover(&mut self, expected: usize) -> Result<Vec<DeviceRecord>> {
        let tx = self.counter.begin();
        self.exchange.framed.discard();

        let request = Request::query(Target::ANY, DISCOVERY_OBJECT, 0, 0);
        self.exchange
            .send(&request, MacAddress::BROADCAST, tx.id())
            .await?;

        let mut devices: Vec<DeviceRecord> = Vec::with_capacity(expected);
        while devices.len() < expected {
            let (mac, reply) = self.exchange.receive(tx.id()).await?;
            let source = reply.source();
            if devices.iter().any(|d| d.serial == source.serial) {
                debug!("duplicate discovery reply from {}", source.serial);
                continue;
            }

            debug!(
                "found device {} (SUSyID {}) at {}",
                source.serial, source.susy_id, mac
            );
            devices.push(DeviceRecord {
                serial: source.serial,
                susy_id: source.susy_id,
                mac,
                authenticated: false,
            });
        }

        Ok(devices)
    }
    // }}}

    // logon {{{
    /// Logs on to every discovered device. Devices rejecting the password
    /// are marked unauthenticated; fails only if none accepted it.
    pub async fn authenticate(&mut self, password: &str, user_type: UserType) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::AuthenticationFailed(
                "no devices discovered".to_string(),
            ));
        }
        let encoded = user_type.encode_password(password)?;

        retrying!("authentication", self.try_authenticate(&encoded, user_type)).map_err(|e| {
            match e {
                Error::AuthenticationFailed(_) => e,
                e => Error::AuthenticationFailed(e.to_string()),
            }
        })
    }

    fn logon_request(
        target: Target,
        command: u32,
        user_type: UserType,
        now: u32,
        encoded: &[u8],
    ) -> Request {
        Request::new(target)
            .control_word(ControlWord::Logon)
            .u32(command)
            .u32(user_type.group())
            .u32(LOGON_VALIDITY_SECS)
            .u32(now)
            .u32(0)
            .slice(encoded)
    }

    async fn try_authenticate(&mut self, encoded: &[u8], user_type: UserType) -> Result<()> {
        let tx = self.counter.begin();
        self.exchange.framed.discard();

        let now = Utils::unix_now();
        let request = Self::logon_request(Target::ANY, CMD_LOGON, user_type, now, encoded);
        self.exchange
            .send(&request, MacAddress::BROADCAST, tx.id())
            .await?;

        for device in self.devices.iter_mut() {
            device.authenticated = false;
        }

        let mut answered: Vec<u32> = Vec::with_capacity(self.devices.len());
        while answered.len() < self.devices.len() {
            let (_, reply) = self.exchange.receive(tx.id()).await?;
            let serial = reply.header.src_serial;
            if answered.contains(&serial) {
                debug!("duplicate logon reply from {}", serial);
                continue;
            }
            let status = reply.header.status;
            let accepted = status == 0 && reply.body.get(PASSWORD_ECHO) == Some(encoded);

            match self.devices.iter_mut().find(|d| d.serial == serial) {
                Some(device) => {
                    answered.push(serial);
                    if accepted {
                        info!("{}: logged on as {:?}", serial, user_type);
                        device.authenticated = true;
                    } else {
                        warn!("{}: authentication failed (status 0x{:04x})", serial, status);
                    }
                }
                None => warn!("logon reply from unknown device {}", serial),
            }
        }

        if let [device] = self.devices.as_slice() {
            let ack = Self::logon_request(device.target(), CMD_LOGON_ACK, user_type, now, encoded)
                .control(Control::Unsolicited);
            self.exchange.send(&ack, device.mac, tx.id()).await?;
        }

        if self.devices.iter().any(|d| d.authenticated) {
            Ok(())
        } else {
            Err(Error::AuthenticationFailed(
                "password rejected by every device".to_string(),
            ))
        }
    }
    // }}}

    // time {{{
    /// Reads the device clock and corrects it when it is more than
    /// `TIME_TOLERANCE_SECS` off the local clock.
    pub async fn sync_time(&mut self) -> Result<()> {
        retrying!("time sync", self.try_sync_time())
    }

    fn time_request(target: Target, time: u32, zone: u32) -> Request {
        Request::new(target)
            .u32(CMD_TIME)
            .u32(TIME_INDEX)
            .u32(TIME_INDEX)
            .u32(TIME_INDEX)
            .u32(time)
            .u32(time)
            .u32(time)
            .u32(zone)
            .u32(0)
            .u32(1)
    }

    async fn try_sync_time(&mut self) -> Result<()> {
        let tx = self.counter.begin();
        self.exchange.framed.discard();

        let request = Request::new(Target::ANY)
            .u32(CMD_TIME)
            .u32(TIME_INDEX)
            .u32(TIME_INDEX);
        self.exchange
            .send(&request, MacAddress::BROADCAST, tx.id())
            .await?;

        let (mac, reply) = self.exchange.receive(tx.id()).await?;
        reply.expect_object((CMD_TIME >> 16) as u16)?;
        let device_time = reply.u32_at(DEVICE_TIME_OFFSET)?;
        let device_time2 = reply.u32_at(DEVICE_TIME2_OFFSET)?;
        let zone = reply.u32_at(TIME_ZONE_OFFSET)?;
        debug!(
            "{}: clock {} / {}, tz {}s, dst {}",
            reply.header.src_serial,
            Utils::from_unix(device_time),
            Utils::from_unix(device_time2),
            (zone & !1) as i32,
            zone & 1
        );

        let ack = Self::time_request(reply.source(), device_time, zone)
            .control(Control::Unsolicited);
        self.exchange.send(&ack, mac, tx.id()).await?;

        let now = Utils::unix_now();
        let drift = device_time as i64 - now as i64;
        if drift.abs() > TIME_TOLERANCE_SECS {
            info!(
                "device clock is {}s off, setting it to {}",
                drift,
                Utils::from_unix(now)
            );
            let set = Self::time_request(Target::ANY, now, zone).control_word(ControlWord::Logon);
            self.exchange
                .send(&set, MacAddress::BROADCAST, tx.id())
                .await?;
        }

        Ok(())
    }
    // }}}

    // channel queries {{{
    /// One query/reply round for `object` over `from..=to` on `serial`.
    pub async fn request_channel(
        &mut self,
        serial: u32,
        object: u16,
        from: u32,
        to: u32,
    ) -> Result<Reply> {
        let device = self.device(serial)?;
        let tx = self.counter.begin();
        self.exchange.framed.discard();

        let request = Request::query(device.target(), object, from, to);
        self.exchange.send(&request, device.mac, tx.id()).await?;

        let (_, reply) = self.exchange.receive(tx.id()).await?;
        if reply.header.src_serial != serial {
            return Err(Error::Protocol(format!(
                "reply for {} came from {}",
                serial, reply.header.src_serial
            )));
        }
        if reply.header.status != 0 {
            return Err(Error::Protocol(format!(
                "{} rejected object 0x{:04x} (status 0x{:04x})",
                serial, object, reply.header.status
            )));
        }
        reply.expect_object(object)?;

        Ok(reply)
    }

    async fn read_records(&mut self, serial: u32, query: Query) -> Result<Vec<Record>> {
        let reply = retrying!(
            query.name,
            self.request_channel(serial, query.object, query.from, query.to)
        )?;
        let records = record::decode(query.object, reply.records())?;
        debug!("{}: {} {} record(s)", serial, records.len(), query.name);
        Ok(records)
    }

    pub async fn read_ac(&mut self, serial: u32) -> Result<AcReadings> {
        let records = self.read_records(serial, Query::AC).await?;
        Ok(AcReadings::from_records(&records))
    }

    pub async fn read_dc(&mut self, serial: u32) -> Result<DcReadings> {
        let records = self.read_records(serial, Query::DC).await?;
        Ok(DcReadings::from_records(&records))
    }

    pub async fn read_stats(&mut self, serial: u32) -> Result<Statistics> {
        let records = self.read_records(serial, Query::STATISTICS).await?;
        Ok(Statistics::from_records(&records))
    }

    pub async fn read_status(&mut self, serial: u32) -> Result<Status> {
        let records = self.read_records(serial, Query::STATUS).await?;
        Ok(Status::from_records(&records))
    }

    pub async fn read_inverter_info(&mut self, serial: u32) -> Result<InverterInfo> {
        let records = self.read_records(serial, Query::DEVICE_INFO).await?;
        Ok(InverterInfo::from_records(&records))
    }
    // }}}

    // archives {{{
    /// Pages through the `kind` archive of `serial`, keeping entries
    /// stamped within `from..=to`.
    pub async fn read_archive(
        &mut self,
        serial: u32,
        kind: ArchiveKind,
        from: u32,
        to: u32,
    ) -> Result<Vec<ArchiveEntry>> {
        let entries = retrying!("archive read", self.try_read_archive(serial, kind, from, to))?;
        let entries = archive::filter_range(entries, from, to);
        debug!("{}: {} {:?} entries", serial, entries.len(), kind);
        Ok(entries)
    }

    async fn try_read_archive(
        &mut self,
        serial: u32,
        kind: ArchiveKind,
        from: u32,
        to: u32,
    ) -> Result<Vec<ArchiveEntry>> {
        let device = self.device(serial)?;
        let object = u16::from(kind);
        let tx = self.counter.begin();
        self.exchange.framed.discard();

        let request = Request::query(device.target(), object, from, to);
        self.exchange.send(&request, device.mac, tx.id()).await?;

        let mut entries = Vec::new();
        loop {
            let (_, reply) = self.exchange.receive(tx.id()).await?;
            reply.expect_object(object)?;
            entries.extend(archive::decode_page(kind, reply.records())?);

            if !reply.has_more_fragments() {
                break;
            }
            trace!("{} archive fragments to follow", reply.header.fragment);
        }

        Ok(entries)
    }

    /// Five-minute cumulative yield samples.
    pub async fn read_day_yields(
        &mut self,
        serial: u32,
        from: u32,
        to: u32,
    ) -> Result<Vec<DayYield>> {
        self.read_yields(serial, ArchiveKind::DayData, from, to).await
    }

    /// One cumulative yield sample per day.
    pub async fn read_month_yields(
        &mut self,
        serial: u32,
        from: u32,
        to: u32,
    ) -> Result<Vec<DayYield>> {
        self.read_yields(serial, ArchiveKind::MonthData, from, to).await
    }

    async fn read_yields(
        &mut self,
        serial: u32,
        kind: ArchiveKind,
        from: u32,
        to: u32,
    ) -> Result<Vec<DayYield>> {
        let entries = self.read_archive(serial, kind, from, to).await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| match e {
                ArchiveEntry::DayYield(d) => Some(d),
                ArchiveEntry::Event(_) => None,
            })
            .collect())
    }

    pub async fn read_events(
        &mut self,
        serial: u32,
        kind: ArchiveKind,
        from: u32,
        to: u32,
    ) -> Result<Vec<Event>> {
        if !matches!(kind, ArchiveKind::UserEvents | ArchiveKind::InstallerEvents) {
            return Err(Error::Protocol(format!("{:?} is not an event archive", kind)));
        }

        let entries = self.read_archive(serial, kind, from, to).await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| match e {
                ArchiveEntry::Event(e) => Some(e),
                ArchiveEntry::DayYield(_) => None,
            })
            .collect())
    }
    // }}}

    /// Signal strength (percent) of the root device.
    pub async fn signal_strength(&self) -> Result<u8> {
        let link = self.link();
        link.signal_strength(link.info().peer_address).await
    }

    /// Logs off every device and shuts the link down.
    pub async fn close(mut self) {
        {
            let tx = self.counter.begin();
            let logoff = Request::new(Target::ANY)
                .control_word(ControlWord::Logoff)
                .u32(CMD_LOGOFF)
                .u32(0xFFFF_FFFF);
            if let Err(e) = self
                .exchange
                .send(&logoff, MacAddress::BROADCAST, tx.id())
                .await
            {
                warn!("logoff failed: {}", e);
            }
        }

        self.exchange.framed.channel().close().await;
    }
}
