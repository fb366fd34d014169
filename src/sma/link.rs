//! Bluetooth packet layer: discovery handshake, control traffic, and the
//! hand-off of application data to the session.

use crate::prelude::*;
use crate::sma::frame::{Channel, MAX_STUFFED_SIZE};

use {
    async_trait::async_trait,
    bytes::{Bytes, BytesMut},
    num_enum::{IntoPrimitive, TryFromPrimitive},
    std::collections::HashMap,
    std::convert::TryFrom,
    std::sync::atomic::{AtomicBool, Ordering},
    std::sync::{Arc, Mutex},
    tokio::sync::{broadcast, watch, Mutex as AsyncMutex},
    tokio::task::JoinHandle,
    tokio_util::codec::Decoder,
};

pub const HEADER_LEN: usize = 18;
pub const MAX_PACKET_LEN: usize = 255;
pub const MAX_DATA_LEN: usize = MAX_PACKET_LEN - HEADER_LEN;
const SYNC: u8 = 0x7E;

const HANDSHAKE_TIMEOUT_SECS: u64 = 15;
const SIGNAL_TIMEOUT_SECS: u64 = 5;
const READ_POLL_MS: u32 = 500;
// unread application payloads kept for the session; older ones are dropped
const DATA_QUEUE_LEN: usize = 1;

const TOPOLOGY_ENTRY_LEN: usize = 8;

// Command {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    Data = 0x01,
    IdExchange = 0x02,
    SignalQuery = 0x03,
    SignalReport = 0x04,
    Topology = 0x05,
    DataPart = 0x08,
    Address = 0x0A,
}
// }}}

// LinkState {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkState {
    NotConnected,
    AwaitingIdAck,
    AwaitingOwnAddress,
    AwaitingDeviceCount,
    DeviceListKnown,
    Connected,
    Failed,
}

impl LinkState {
    fn carries_data(&self) -> bool {
        matches!(self, LinkState::DeviceListKnown | LinkState::Connected)
    }
}
// }}}

// Packet {{{
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub source: MacAddress,
    pub destination: MacAddress,
    pub command: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(
        source: MacAddress,
        destination: MacAddress,
        command: Command,
        payload: &[u8],
    ) -> Self {
        Self {
            source,
            destination,
            command: command.into(),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.command).ok()
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        let len = HEADER_LEN + self.payload.len();
        if len > MAX_PACKET_LEN {
            return Err(Error::Link(format!("packet of {} bytes is too long", len)));
        }

        let mut r = vec![0; len];
        r[0] = SYNC;
        r[1] = len as u8;
        r[2] = 0;
        r[3] = r[0] ^ r[1] ^ r[2];
        r[4..10].copy_from_slice(&self.source.to_wire());
        r[10..16].copy_from_slice(&self.destination.to_wire());
        r[16] = self.command;
        r[17] = 0;
        r[18..].copy_from_slice(&self.payload);

        Ok(r)
    }
}

/// Splits a raw byte stream into link packets. Header violations are fatal
/// since the stream carries no way to resynchronise.
#[derive(Default)]
pub struct PacketDecoder;

impl Decoder for PacketDecoder {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < 4 {
            return Ok(None);
        }
        if src[0] != SYNC {
            return Err(Error::Link(format!("bad sync byte 0x{:02x}", src[0])));
        }
        if src[3] != src[0] ^ src[1] ^ src[2] {
            return Err(Error::Link(format!(
                "header checksum mismatch ({})",
                Utils::hex(&src[..4])
            )));
        }

        let len = src[1] as usize;
        if len < HEADER_LEN {
            return Err(Error::Link(format!("bad packet length {}", len)));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let raw = src.split_to(len);
        Ok(Some(Packet {
            source: MacAddress::from_wire(&raw[4..10])?,
            destination: MacAddress::from_wire(&raw[10..16])?,
            command: raw[16],
            payload: Bytes::copy_from_slice(&raw[HEADER_LEN..]),
        }))
    }
}
// }}}

/// Application data handed from the reader task to the session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataPacket {
    pub source: MacAddress,
    pub payload: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub net_id: u8,
    pub own_address: MacAddress,
    pub peer_address: MacAddress,
    pub devices: Vec<MacAddress>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    write_lock: AsyncMutex<()>,
    state: watch::Sender<LinkState>,
    signal: watch::Sender<Option<u8>>,
    info: Mutex<LinkInfo>,
    failure: Mutex<Option<String>>,
    data: broadcast::Sender<DataPacket>,
    // 0x08 part payloads waiting for the closing 0x01 packet, per sender
    parts: Mutex<HashMap<MacAddress, BytesMut>>,
    stop: AtomicBool,
}

impl Shared {
    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    fn info(&self) -> LinkInfo {
        self.info.lock().map(|i| i.clone()).unwrap_or_default()
    }

    fn update_info(&self, f: impl FnOnce(&mut LinkInfo)) {
        if let Ok(mut info) = self.info.lock() {
            f(&mut info);
        }
    }

    fn transition(&self, from: LinkState, to: LinkState) {
        debug!("link state {:?} -> {:?}", from, to);
        self.state.send_replace(to);
    }

    fn fail(&self, reason: String) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(reason);
        }
        self.state.send_replace(LinkState::Failed);
    }

    fn failure(&self) -> Error {
        let reason = self
            .failure
            .lock()
            .ok()
            .and_then(|f| f.clone())
            .unwrap_or_else(|| "link failed".to_string());
        Error::Link(reason)
    }

    /// Sends `packets` back to back; the write lock keeps other writers
    /// from interleaving with them.
    async fn send(&self, packets: &[Packet]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        for packet in packets {
            let bytes = packet.bytes()?;
            trace!("TX {}", Utils::hex(&bytes));
            self.transport
                .write(&bytes, &packet.destination.to_string())
                .await?;
        }
        Ok(())
    }

    async fn receive_loop(&self) -> Result<()> {
        let mut decoder = PacketDecoder;
        let mut buf = BytesMut::with_capacity(2 * MAX_PACKET_LEN);
        let mut chunk = [0u8; MAX_PACKET_LEN];

        while !self.stop.load(Ordering::Relaxed) {
            let n = self.transport.read(&mut chunk, READ_POLL_MS).await?;
            if n == 0 {
                continue;
            }
            buf.extend_from_slice(&chunk[..n]);

            while let Some(packet) = decoder.decode(&mut buf)? {
                trace!(
                    "RX cmd=0x{:02x} {} -> {} {}",
                    packet.command,
                    packet.source,
                    packet.destination,
                    Utils::hex(&packet.payload)
                );
                self.handle(packet).await?;
            }
        }

        Ok(())
    }

    async fn handle(&self, packet: Packet) -> Result<()> {
        match packet.command() {
            Some(Command::IdExchange) => self.on_id_exchange(packet).await?,
            Some(Command::Address) => self.on_address(&packet),
            Some(Command::Topology) => self.on_topology(&packet),
            Some(Command::SignalReport) => self.on_signal(&packet),
            Some(Command::Data) | Some(Command::DataPart) => self.on_data(packet),
            _ => debug!(
                "ignoring command 0x{:02x} from {}",
                packet.command, packet.source
            ),
        }
        Ok(())
    }

    async fn on_id_exchange(&self, packet: Packet) -> Result<()> {
        let state = self.state();
        if state != LinkState::AwaitingIdAck {
            debug!("ignoring id exchange in state {:?}", state);
            return Ok(());
        }
        if packet.payload.len() < 5 {
            warn!("short id exchange packet from {}", packet.source);
            return Ok(());
        }

        let net_id = packet.payload[4];
        self.update_info(|info| {
            info.net_id = net_id;
            info.peer_address = packet.source;
        });
        info!("{}: network id {}", packet.source, net_id);

        let echo = Packet::new(
            MacAddress::ZERO,
            packet.source,
            Command::IdExchange,
            &packet.payload,
        );
        self.send(&[echo]).await?;

        self.transition(state, LinkState::AwaitingOwnAddress);
        Ok(())
    }

    fn on_address(&self, packet: &Packet) {
        let state = self.state();
        if state != LinkState::AwaitingOwnAddress {
            debug!("ignoring address announcement in state {:?}", state);
            return;
        }

        let payload = &packet.payload;
        if payload.len() < 13 {
            warn!("short address announcement from {}", packet.source);
            return;
        }
        let (peer, own) = match (
            MacAddress::from_wire(&payload[0..6]),
            MacAddress::from_wire(&payload[7..13]),
        ) {
            (Ok(peer), Ok(own)) => (peer, own),
            _ => return,
        };

        info!("peer address {}, own address {}", peer, own);
        self.update_info(|info| {
            info.peer_address = peer;
            info.own_address = own;
        });

        self.transition(state, LinkState::AwaitingDeviceCount);
    }

    fn on_topology(&self, packet: &Packet) {
        let state = self.state();
        if state != LinkState::AwaitingDeviceCount {
            debug!("ignoring device list in state {:?}", state);
            return;
        }

        let payload = &packet.payload;
        if payload.is_empty() || payload.len() % TOPOLOGY_ENTRY_LEN != 0 {
            warn!(
                "device list of {} bytes is not a multiple of {}, dropped",
                payload.len(),
                TOPOLOGY_ENTRY_LEN
            );
            return;
        }

        let own = self.info().own_address;
        let devices: Vec<MacAddress> = payload
            .chunks(TOPOLOGY_ENTRY_LEN)
            .filter_map(|entry| MacAddress::from_wire(&entry[0..6]).ok())
            .filter(|mac| *mac != own)
            .collect();

        info!("{} device(s) in network: {:?}", devices.len(), devices);
        self.update_info(|info| info.devices = devices);

        self.transition(state, LinkState::DeviceListKnown);
    }

    fn on_signal(&self, packet: &Packet) {
        if packet.payload.len() < 5 {
            warn!("short signal report from {}", packet.source);
            return;
        }
        let strength = (packet.payload[4] as u32 * 100 / 255) as u8;
        debug!("{}: signal strength {}%", packet.source, strength);
        self.signal.send_replace(Some(strength));
    }

    fn on_data(&self, packet: Packet) {
        if !self.state().carries_data() {
            debug!("ignoring data from {} before handshake", packet.source);
            return;
        }

        let own = self.info().own_address;
        if packet.destination != own && !packet.destination.is_broadcast() {
            debug!(
                "ignoring data for {} (we are {})",
                packet.destination, own
            );
            return;
        }

        let payload = {
            let mut parts = match self.parts.lock() {
                Ok(parts) => parts,
                Err(_) => return,
            };
            let buffer = parts.entry(packet.source).or_default();
            buffer.extend_from_slice(&packet.payload);

            if buffer.len() > MAX_STUFFED_SIZE {
                warn!(
                    "dropping {} bytes of unfinished data from {}",
                    buffer.len(),
                    packet.source
                );
                parts.remove(&packet.source);
                return;
            }
            if packet.command() == Some(Command::DataPart) {
                trace!("{}: {} bytes pending", packet.source, buffer.len());
                return;
            }
            parts
                .remove(&packet.source)
                .map(BytesMut::freeze)
                .unwrap_or_default()
        };

        // only fails when nobody holds a receiver
        let _ = self.data.send(DataPacket {
            source: packet.source,
            payload,
        });
    }
}

/// Owns the transport, runs the background reader and multiplexes control
/// traffic from application data.
pub struct DeviceLink {
    shared: Arc<Shared>,
    data_rx: AsyncMutex<broadcast::Receiver<DataPacket>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceLink {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (data, data_rx) = broadcast::channel(DATA_QUEUE_LEN);
        let (state, _) = watch::channel(LinkState::NotConnected);
        let (signal, _) = watch::channel(None);

        Self {
            shared: Arc::new(Shared {
                transport,
                write_lock: AsyncMutex::new(()),
                state,
                signal,
                info: Mutex::new(LinkInfo::default()),
                failure: Mutex::new(None),
                data,
                parts: Mutex::new(HashMap::new()),
                stop: AtomicBool::new(false),
            }),
            data_rx: AsyncMutex::new(data_rx),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    pub fn info(&self) -> LinkInfo {
        self.shared.info()
    }

    /// Starts the reader task and waits for the handshake to announce the
    /// device list.
    pub async fn connect(&self) -> Result<()> {
        if self.shared.state() != LinkState::NotConnected {
            return Err(Error::Link(format!(
                "connect in state {:?}",
                self.shared.state()
            )));
        }

        self.shared.stop.store(false, Ordering::Relaxed);
        if let Ok(mut parts) = self.shared.parts.lock() {
            parts.clear();
        }
        self.shared.state.send_replace(LinkState::AwaitingIdAck);

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = shared.receive_loop().await {
                error!("link reader failed: {}", e);
                shared.fail(e.to_string());
            }
            debug!("link reader exiting");
        });
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }

        let mut state_rx = self.shared.state.subscribe();
        let reached = tokio::time::timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            state_rx.wait_for(|s| matches!(s, LinkState::DeviceListKnown | LinkState::Failed)),
        )
        .await
        .map(|r| r.map(|s| *s));

        match reached {
            Ok(Ok(LinkState::DeviceListKnown)) => {
                self.shared
                    .transition(LinkState::DeviceListKnown, LinkState::Connected);
                info!("link connected to {}", self.info().peer_address);
                Ok(())
            }
            Ok(_) => {
                self.stop().await;
                Err(self.shared.failure())
            }
            Err(_) => {
                warn!(
                    "handshake stuck in {:?} after {}s",
                    self.shared.state(),
                    HANDSHAKE_TIMEOUT_SECS
                );
                self.stop().await;
                self.shared.fail("handshake timeout".to_string());
                Err(Error::HandshakeTimeout)
            }
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.shared.state() {
            LinkState::Failed => Err(self.shared.failure()),
            LinkState::NotConnected => Err(Error::Link("not connected".to_string())),
            _ => Ok(()),
        }
    }

    /// Sends one application payload, split into as many link packets as
    /// needed.
    pub async fn write(&self, payload: &[u8], destination: MacAddress) -> Result<()> {
        self.ensure_usable()?;

        let own = self.info().own_address;
        let chunks: Vec<&[u8]> = payload.chunks(MAX_DATA_LEN).collect();
        let last = chunks.len().saturating_sub(1);
        let packets: Vec<Packet> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let command = if i == last {
                    Command::Data
                } else {
                    Command::DataPart
                };
                Packet::new(own, destination, command, chunk)
            })
            .collect();

        self.shared.send(&packets).await
    }

    /// Next application data packet, or `None` if nothing arrived within
    /// `timeout`.
    pub async fn read(&self, timeout: Duration) -> Result<Option<DataPacket>> {
        self.ensure_usable()?;

        let mut rx = self.data_rx.lock().await;
        let mut state_rx = self.shared.state.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(packet) => return Ok(Some(packet)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("dropped {} unread data packet(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::Link("reader stopped".to_string()));
                    }
                },
                _ = state_rx.wait_for(|s| *s == LinkState::Failed) => {
                    return Err(self.shared.failure());
                }
                _ = &mut deadline => return Ok(None),
            }
        }
    }

    /// Queries the signal strength (percent) of `peer`.
    pub async fn signal_strength(&self, peer: MacAddress) -> Result<u8> {
        self.ensure_usable()?;

        self.shared.signal.send_replace(None);
        let mut signal_rx = self.shared.signal.subscribe();

        let query = Packet::new(
            self.info().own_address,
            peer,
            Command::SignalQuery,
            &[0x05, 0x00],
        );
        self.shared.send(&[query]).await?;

        let reported = tokio::time::timeout(
            Duration::from_secs(SIGNAL_TIMEOUT_SECS),
            signal_rx.wait_for(|v| v.is_some()),
        )
        .await;

        match reported {
            Ok(Ok(value)) => (*value).ok_or(Error::Timeout("signal strength")),
            Ok(Err(_)) => Err(Error::Link("signal channel closed".to_string())),
            Err(_) => Err(Error::Timeout("signal strength")),
        }
    }

    async fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        let handle = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("link reader ended abnormally: {}", e);
            }
        }
    }

    /// Stops the reader task and waits for it to exit.
    pub async fn close(&self) {
        info!("closing link to {}", self.info().peer_address);
        self.stop().await;
        if self.shared.state() != LinkState::Failed {
            self.shared.state.send_replace(LinkState::NotConnected);
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl Channel for DeviceLink {
    async fn send(&self, payload: &[u8], destination: MacAddress) -> Result<()> {
        self.write(payload, destination).await
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<DataPacket>> {
        self.read(timeout).await
    }
}
