//! Byte-stuffed, FCS-16 protected framing of application payloads.
//!
//! Wire layout: `7E | FF 03 | protocol (LE) | payload | fcs (LE) | 7E`, with
//! everything between the sync bytes escaped as `7D, b ^ 0x20` when `b` is a
//! control character.

use crate::prelude::*;
use crate::sma::link::DataPacket;

use {
    async_trait::async_trait,
    bytes::{Buf, BufMut, Bytes, BytesMut},
    tokio::time::Instant,
    tokio_util::codec::{Decoder, Encoder},
};

pub const SYNC: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;
// bit n set => byte n (< 0x20) must be escaped
const ESCAPE_MAP: u32 = 0x000E_0000;

const ADDRESS: u8 = 0xFF;
const CONTROL: u8 = 0x03;
pub const SMA_PROTOCOL_ID: u16 = 0x6560;

const HEADER_LEN: usize = 4;
const FCS_LEN: usize = 2;
pub const MAX_FRAME_SIZE: usize = 527;
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_LEN - FCS_LEN;
/// Opening sync plus a maximum frame with every byte escaped.
pub const MAX_STUFFED_SIZE: usize = 2 * MAX_FRAME_SIZE + 1;

const FCS_GOOD: u16 = 0xF0B8;

/// PPP FCS-16 (RFC 1662), already complemented for transmission.
pub fn fcs16(data: &[u8]) -> u16 {
    crc16::State::<crc16::X_25>::calculate(data)
}

#[derive(Clone, Debug)]
pub struct FrameCodec {
    protocol_id: u16,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(SMA_PROTOCOL_ID)
    }
}

impl FrameCodec {
    pub fn new(protocol_id: u16) -> Self {
        Self { protocol_id }
    }

    /// Frames `payload` into a ready-to-send byte string.
    pub fn frame(&mut self, payload: &[u8]) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(2 * (payload.len() + HEADER_LEN + FCS_LEN) + 2);
        self.encode(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    fn needs_escape(byte: u8) -> bool {
        match byte {
            ESCAPE | SYNC => true,
            b if b < 0x20 => ESCAPE_MAP & (1 << b) != 0,
            _ => false,
        }
    }

    fn unstuff(raw: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut r = Vec::with_capacity(raw.len());
        let mut bytes = raw.iter();
        while let Some(&b) = bytes.next() {
            if b == ESCAPE {
                match bytes.next() {
                    Some(&escaped) => r.push(escaped ^ ESCAPE_XOR),
                    None => return Err(FrameError::Truncated),
                }
            } else {
                r.push(b);
            }
        }
        Ok(r)
    }

    fn check(&self, frame: &[u8]) -> Result<Bytes, FrameError> {
        let len = frame.len();
        if len < HEADER_LEN + FCS_LEN {
            return Err(FrameError::Truncated);
        }
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(MAX_FRAME_SIZE));
        }
        if !fcs16(frame) != FCS_GOOD {
            return Err(FrameError::ChecksumMismatch);
        }
        if frame[0] != ADDRESS
            || frame[1] != CONTROL
            || Utils::u16ify(frame, 2) != self.protocol_id
        {
            return Err(FrameError::UnexpectedHeader);
        }

        Ok(Bytes::copy_from_slice(&frame[HEADER_LEN..len - FCS_LEN]))
    }
}

impl<'a> Encoder<&'a [u8]> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, payload: &'a [u8], dst: &mut BytesMut) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::TooLarge(MAX_FRAME_SIZE).into());
        }

        let mut frame = Vec::with_capacity(payload.len() + HEADER_LEN + FCS_LEN);
        frame.extend_from_slice(&[ADDRESS, CONTROL]);
        frame.extend_from_slice(&self.protocol_id.to_le_bytes());
        frame.extend_from_slice(payload);
        let fcs = fcs16(&frame);
        frame.extend_from_slice(&fcs.to_le_bytes());

        dst.put_u8(SYNC);
        for b in frame {
            if Self::needs_escape(b) {
                dst.put_u8(ESCAPE);
                dst.put_u8(b ^ ESCAPE_XOR);
            } else {
                dst.put_u8(b);
            }
        }
        dst.put_u8(SYNC);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let start = match src.iter().position(|&b| b == SYNC) {
                Some(p) => p,
                None => {
                    if !src.is_empty() {
                        debug!("discarding {} unsynced bytes", src.len());
                        src.clear();
                    }
                    return Ok(None);
                }
            };
            if start > 0 {
                debug!("discarding {} bytes before sync", start);
                src.advance(start);
            }

            let end = match src[1..].iter().position(|&b| b == SYNC) {
                Some(p) => p + 1,
                None => {
                    if src.len() > MAX_STUFFED_SIZE {
                        src.clear();
                        return Err(FrameError::TooLarge(MAX_FRAME_SIZE).into());
                    }
                    return Ok(None);
                }
            };

            if end == 1 {
                // closing sync of a previous frame followed by an opening one
                src.advance(1);
                continue;
            }

            // leave the closing sync in place, it may open the next frame
            let raw = src.split_to(end);
            let frame = Self::unstuff(&raw[1..])?;
            trace!("RX frame {}", Utils::hex(&frame));
            return Ok(Some(self.check(&frame)?));
        }
    }
}

/// Read/write channel a [`FramedChannel`] runs on; implemented by
/// [`crate::sma::link::DeviceLink`].
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, payload: &[u8], destination: MacAddress) -> Result<()>;
    async fn receive(&self, timeout: Duration) -> Result<Option<DataPacket>>;
}

/// One decoded frame, tagged with the link address it arrived from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub source: MacAddress,
    pub payload: Bytes,
}

/// A [`FrameCodec`] bound to a [`Channel`], keeping partially received
/// frames buffered between calls.
pub struct FramedChannel<C> {
    channel: C,
    codec: FrameCodec,
    buffer: BytesMut,
    source: MacAddress,
}

impl<C: Channel> FramedChannel<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            codec: FrameCodec::default(),
            buffer: BytesMut::with_capacity(2 * MAX_FRAME_SIZE),
            source: MacAddress::ZERO,
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_inner(self) -> C {
        self.channel
    }

    pub async fn write(&mut self, payload: &[u8], destination: MacAddress) -> Result<()> {
        let bytes = self.codec.frame(payload)?;
        trace!("TX frame to {} {}", destination, Utils::hex(payload));
        self.channel.send(&bytes, destination).await
    }

    /// Waits up to `timeout` for the next complete frame.
    pub async fn read(&mut self, timeout: Duration) -> Result<Frame> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(payload) = self.codec.decode(&mut self.buffer)? {
                return Ok(Frame {
                    source: self.source,
                    payload,
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout("frame"));
            }

            match self.channel.receive(remaining).await? {
                Some(packet) => {
                    self.source = packet.source;
                    self.buffer.extend_from_slice(&packet.payload);
                }
                None => return Err(Error::Timeout("frame")),
            }
        }
    }

    /// Drops any partially buffered frame, e.g. before starting a new request.
    pub fn discard(&mut self) {
        if !self.buffer.is_empty() {
            debug!("discarding {} buffered bytes", self.buffer.len());
            self.buffer.clear();
        }
    }
}
