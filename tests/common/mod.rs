#![allow(dead_code)]

use sma_bridge::prelude::*;
use sma_bridge::sma::frame::FrameCodec;
use sma_bridge::sma::link::{Command, Packet, PacketDecoder, MAX_DATA_LEN};
use sma_bridge::sma::packet::Reply;

use {
    async_trait::async_trait,
    bytes::BytesMut,
    std::collections::VecDeque,
    std::sync::{Arc, Mutex},
    tokio_util::codec::Decoder,
};

pub const NET_ID: u8 = 3;
pub const SERIAL: u32 = 2_130_012_345;
pub const SECOND_SERIAL: u32 = 2_130_067_890;
pub const SUSY_ID: u16 = 0x0083;
// before each inbound burst; bytes within a burst arrive back to back
const BURST_GAP_MS: u64 = 10;
const IDLE_POLL_MS: u64 = 5;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn own_mac() -> MacAddress {
    MacAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13])
}

pub fn inverter_mac() -> MacAddress {
    MacAddress::new([0x00, 0x80, 0x25, 0x2A, 0x04, 0x11])
}

pub fn second_mac() -> MacAddress {
    MacAddress::new([0x00, 0x80, 0x25, 0x2A, 0x04, 0x22])
}

/// One application reply as sent by the device at `source`.
#[derive(Clone, Debug)]
pub struct Answer {
    pub source: MacAddress,
    pub payload: Vec<u8>,
}

pub type Responder = Box<dyn FnMut(&Reply) -> Vec<Answer> + Send>;

// Factory {{{
pub struct Factory;

impl Factory {
    pub fn hello(peer: MacAddress) -> Packet {
        Packet::new(
            peer,
            MacAddress::ZERO,
            Command::IdExchange,
            &[0x00, 0x04, 0x70, 0x00, NET_ID, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00],
        )
    }

    pub fn address(peer: MacAddress) -> Packet {
        let mut payload = peer.to_wire().to_vec();
        payload.push(0x01);
        payload.extend_from_slice(&own_mac().to_wire());
        Packet::new(peer, own_mac(), Command::Address, &payload)
    }

    pub fn topology(peer: MacAddress, devices: &[MacAddress]) -> Packet {
        let mut payload = own_mac().to_wire().to_vec();
        payload.extend_from_slice(&[0x01, 0x00]);
        for device in devices {
            payload.extend_from_slice(&device.to_wire());
            payload.extend_from_slice(&[0x02, 0x01]);
        }
        Packet::new(peer, own_mac(), Command::Topology, &payload)
    }

    /// Id exchange, address and device list, in order.
    pub fn handshake(devices: &[MacAddress]) -> Vec<Packet> {
        let peer = devices[0];
        vec![
            Self::hello(peer),
            Self::address(peer),
            Self::topology(peer, devices),
        ]
    }

    /// 28 byte spot record.
    pub fn spot_record(index: u16, data_type: u8, value: u32) -> Vec<u8> {
        let mut r = vec![0x01];
        r.extend_from_slice(&index.to_le_bytes());
        r.push(data_type);
        r.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        r.extend_from_slice(&value.to_le_bytes());
        for _ in 0..3 {
            r.extend_from_slice(&0x8000_0000u32.to_le_bytes());
        }
        r.extend_from_slice(&[0; 4]);
        r
    }

    /// 12 byte archived yield sample.
    pub fn yield_sample(time: u32, value: u64) -> Vec<u8> {
        let mut r = time.to_le_bytes().to_vec();
        r.extend_from_slice(&value.to_le_bytes());
        r
    }

    /// Query reply body: echoed command word and range, then `records`.
    pub fn records_body(object: u16, records: &[u8]) -> Vec<u8> {
        let mut r = ((object as u32) << 16 | 0x0201).to_le_bytes().to_vec();
        r.extend_from_slice(&[0; 8]);
        r.extend_from_slice(records);
        r
    }
}
// }}}

// ReplyBuilder {{{
/// Builds the device-side reply to `request`.
pub struct ReplyBuilder {
    request: Reply,
    source: MacAddress,
    serial: u32,
    status: u16,
    fragment: u16,
    body: Vec<u8>,
}

impl ReplyBuilder {
    pub fn new(request: &Reply) -> Self {
        Self {
            request: request.clone(),
            source: inverter_mac(),
            serial: SERIAL,
            status: 0,
            fragment: 0,
            body: Vec::new(),
        }
    }

    pub fn from_device(mut self, source: MacAddress, serial: u32) -> Self {
        self.source = source;
        self.serial = serial;
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn fragment(mut self, fragment: u16) -> Self {
        self.fragment = fragment;
        self
    }

    pub fn body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    pub fn answer(self) -> Answer {
        let h = self.request.header;
        let mut payload = Vec::with_capacity(24 + self.body.len());
        payload.push(((24 + self.body.len()) / 4) as u8);
        payload.push(0xE0);
        payload.extend_from_slice(&h.src_susy_id.to_le_bytes());
        payload.extend_from_slice(&h.src_serial.to_le_bytes());
        payload.extend_from_slice(&h.src_control.to_le_bytes());
        payload.extend_from_slice(&SUSY_ID.to_le_bytes());
        payload.extend_from_slice(&self.serial.to_le_bytes());
        payload.extend_from_slice(&h.dst_control.to_le_bytes());
        payload.extend_from_slice(&self.status.to_le_bytes());
        payload.extend_from_slice(&self.fragment.to_le_bytes());
        payload.extend_from_slice(&h.packet_id.to_le_bytes());
        payload.extend_from_slice(&self.body);

        Answer {
            source: self.source,
            payload,
        }
    }
}
// }}}

// MockTransport {{{
/// Plays the Bluetooth root device: replays queued bursts of bytes and
/// answers application requests through a scripted responder. A read hands
/// out at most `buf.len()` bytes, the rest of a burst follows without delay.
#[derive(Default)]
pub struct MockTransport {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    pending: Mutex<Vec<u8>>,
    written: Mutex<Vec<Packet>>,
    requests: Mutex<Vec<Reply>>,
    request_buffer: Mutex<BytesMut>,
    responder: Mutex<Option<Responder>>,
    signal: Mutex<Option<u8>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A root device at `devices[0]` that completes the handshake.
    pub fn with_devices(devices: &[MacAddress]) -> Arc<Self> {
        let mock = Self::new();
        for packet in Factory::handshake(devices) {
            mock.push(packet);
        }
        mock
    }

    pub fn push(&self, packet: Packet) {
        self.push_raw(packet.bytes().unwrap());
    }

    /// Queues `bytes` as one burst.
    pub fn push_raw(&self, bytes: Vec<u8>) {
        self.inbound.lock().unwrap().push_back(bytes);
    }

    /// Link packets carrying `answer`, split at the link's data limit.
    pub fn answer_packets(answer: &Answer) -> Vec<Packet> {
        let frame = FrameCodec::default().frame(&answer.payload).unwrap();
        let chunks: Vec<&[u8]> = frame.chunks(MAX_DATA_LEN).collect();
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let command = if i == last {
                    Command::Data
                } else {
                    Command::DataPart
                };
                Packet::new(answer.source, own_mac(), command, chunk)
            })
            .collect()
    }

    /// Queues every packet of `answer` as a single burst.
    pub fn push_answer(&self, answer: Answer) {
        let burst = Self::answer_packets(&answer)
            .iter()
            .flat_map(|p| p.bytes().unwrap())
            .collect();
        self.push_raw(burst);
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&Reply) -> Vec<Answer> + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Raw signal byte reported in answer to a signal query.
    pub fn set_signal(&self, raw: u8) {
        *self.signal.lock().unwrap() = Some(raw);
    }

    pub fn written(&self) -> Vec<Packet> {
        self.written.lock().unwrap().clone()
    }

    /// Every application request written so far, in order.
    pub fn requests(&self) -> Vec<Reply> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose command word names `object`.
    pub fn requests_for(&self, object: u16) -> Vec<Reply> {
        self.requests()
            .into_iter()
            .filter(|r| r.object().ok() == Some(object))
            .collect()
    }

    fn on_request(&self, request: Reply) {
        let answers = match self.responder.lock().unwrap().as_mut() {
            Some(responder) => responder(&request),
            None => Vec::new(),
        };
        self.requests.lock().unwrap().push(request);
        for answer in answers {
            self.push_answer(answer);
        }
    }

    fn on_packet(&self, packet: Packet) {
        match packet.command() {
            Some(Command::Data) | Some(Command::DataPart) => {
                let frame = {
                    let mut buffer = self.request_buffer.lock().unwrap();
                    buffer.extend_from_slice(&packet.payload);
                    FrameCodec::default().decode(&mut buffer).unwrap()
                };
                if let Some(frame) = frame {
                    self.on_request(Reply::parse(&frame).unwrap());
                }
            }
            Some(Command::SignalQuery) => {
                if let Some(raw) = *self.signal.lock().unwrap() {
                    self.push(Packet::new(
                        packet.destination,
                        own_mac(),
                        Command::SignalReport,
                        &[0x05, 0x00, 0x00, 0x00, raw, 0x00],
                    ));
                }
            }
            _ => {}
        }
        self.written.lock().unwrap().push(packet);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&self, data: &[u8], _destination: &str) -> Result<usize> {
        let mut buf = BytesMut::from(data);
        while let Some(packet) = PacketDecoder.decode(&mut buf)? {
            self.on_packet(packet);
        }
        Ok(data.len())
    }

    async fn read(&self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize> {
        let mut bytes = std::mem::take(&mut *self.pending.lock().unwrap());
        if bytes.is_empty() {
            let next = self.inbound.lock().unwrap().pop_front();
            match next {
                Some(burst) => {
                    tokio::time::sleep(Duration::from_millis(BURST_GAP_MS)).await;
                    bytes = burst;
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(IDLE_POLL_MS)).await;
                    return Ok(0);
                }
            }
        }

        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        *self.pending.lock().unwrap() = bytes.split_off(n);
        Ok(n)
    }
}
// }}}
