//! Application header and request/reply bodies carried inside frames.

use crate::prelude::*;

use {
    bytes::{BufMut, Bytes, BytesMut},
    nom_derive::{Nom, Parse},
    num_enum::{IntoPrimitive, TryFromPrimitive},
    serde::Deserialize,
};

pub const HEADER_LEN: usize = 24;
/// Offset of the first record within an application payload.
pub const RECORDS_OFFSET: usize = 36;

pub const OUR_SUSY_ID: u16 = 0x007D;
pub const PACKET_ID_FLAG: u16 = 0x8000;

pub const CMD_LOGON: u32 = 0xFFFD_040C;
pub const CMD_LOGON_ACK: u32 = 0xFFFD_040D;
pub const CMD_LOGOFF: u32 = 0xFFFD_010E;
pub const CMD_TIME: u32 = 0xF000_020A;
pub const TIME_INDEX: u32 = 0x0023_6D00;
pub const LOGON_VALIDITY_SECS: u32 = 900;

const QUERY_SUFFIX: u32 = 0x0200;
const PASSWORD_LEN: usize = 12;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Control {
    Request = 0xA0,
    Unsolicited = 0xE0,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ControlWord {
    Query = 0x0000,
    Logon = 0x0100,
    Logoff = 0x0300,
}

// UserType {{{
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    #[default]
    User,
    Installer,
}

impl UserType {
    pub fn group(&self) -> u32 {
        match self {
            UserType::User => 0x07,
            UserType::Installer => 0x0A,
        }
    }

    fn key(&self) -> u8 {
        match self {
            UserType::User => 0x88,
            UserType::Installer => 0xBB,
        }
    }

    /// XORs `password` with the group key and pads it with the bare key.
    pub fn encode_password(&self, password: &str) -> Result<[u8; PASSWORD_LEN]> {
        let bytes = password.as_bytes();
        if bytes.len() > PASSWORD_LEN {
            return Err(Error::AuthenticationFailed(format!(
                "password longer than {} bytes",
                PASSWORD_LEN
            )));
        }

        let key = self.key();
        let mut r = [key; PASSWORD_LEN];
        for (out, b) in r.iter_mut().zip(bytes) {
            *out = b ^ key;
        }
        Ok(r)
    }
}
// }}}

/// Addressed device; [`Target::ANY`] reaches every inverter on the link.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Target {
    pub susy_id: u16,
    pub serial: u32,
}

impl Target {
    pub const ANY: Self = Self {
        susy_id: 0xFFFF,
        serial: 0xFFFF_FFFF,
    };
}

// Header {{{
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Nom)]
#[nom(LittleEndian)]
pub struct Header {
    pub words: u8,
    pub control: u8,
    pub dst_susy_id: u16,
    pub dst_serial: u32,
    pub dst_control: u16,
    pub src_susy_id: u16,
    pub src_serial: u32,
    pub src_control: u16,
    pub status: u16,
    pub fragment: u16,
    pub packet_id: u16,
}

impl Header {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.words);
        buf.put_u8(self.control);
        buf.put_u16_le(self.dst_susy_id);
        buf.put_u32_le(self.dst_serial);
        buf.put_u16_le(self.dst_control);
        buf.put_u16_le(self.src_susy_id);
        buf.put_u32_le(self.src_serial);
        buf.put_u16_le(self.src_control);
        buf.put_u16_le(self.status);
        buf.put_u16_le(self.fragment);
        buf.put_u16_le(self.packet_id);
    }
} // }}}

// Request {{{
#[derive(Clone, Debug)]
pub struct Request {
    control: Control,
    control_word: ControlWord,
    target: Target,
    body: BytesMut,
}

impl Request {
    pub fn new(target: Target) -> Self {
        Self {
            control: Control::Request,
            control_word: ControlWord::Query,
            target,
            body: BytesMut::new(),
        }
    }

    /// Channel query for `object` over the index range `from..=to`.
    pub fn query(target: Target, object: u16, from: u32, to: u32) -> Self {
        Self::new(target)
            .u32((object as u32) << 16 | QUERY_SUFFIX)
            .u32(from)
            .u32(to)
    }

    pub fn control(mut self, control: Control) -> Self {
        self.control = control;
        self
    }

    pub fn control_word(mut self, control_word: ControlWord) -> Self {
        self.control_word = control_word;
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.body.put_u32_le(value);
        self
    }

    pub fn slice(mut self, data: &[u8]) -> Self {
        self.body.put_slice(data);
        self
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn bytes(&self, own_serial: u32, packet_id: u16) -> Vec<u8> {
        let padding = (4 - self.body.len() % 4) % 4;
        let len = HEADER_LEN + self.body.len() + padding;

        let header = Header {
            words: (len / 4) as u8,
            control: self.control.into(),
            dst_susy_id: self.target.susy_id,
            dst_serial: self.target.serial,
            dst_control: self.control_word.into(),
            src_susy_id: OUR_SUSY_ID,
            src_serial: own_serial,
            src_control: self.control_word.into(),
            status: 0,
            fragment: 0,
            packet_id: packet_id | PACKET_ID_FLAG,
        };

        let mut buf = BytesMut::with_capacity(len);
        header.write(&mut buf);
        buf.put_slice(&self.body);
        buf.put_bytes(0, padding);
        buf.to_vec()
    }
} // }}}

// Reply {{{
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    pub header: Header,
    pub body: Bytes,
}

impl Reply {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        match Header::parse(payload) {
            Ok((body, header)) => Ok(Self {
                header,
                body: Bytes::copy_from_slice(body),
            }),
            Err(_) => Err(Error::Protocol(format!(
                "application payload of {} bytes is too short",
                payload.len()
            ))),
        }
    }

    pub fn packet_id(&self) -> u16 {
        self.header.packet_id & !PACKET_ID_FLAG
    }

    pub fn source(&self) -> Target {
        Target {
            susy_id: self.header.src_susy_id,
            serial: self.header.src_serial,
        }
    }

    pub fn has_more_fragments(&self) -> bool {
        self.header.fragment != 0
    }

    /// Little-endian word at `offset` of the body.
    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        if self.body.len() < offset + 4 {
            return Err(Error::Protocol(format!(
                "reply body of {} bytes has no word at {}",
                self.body.len(),
                offset
            )));
        }
        Ok(Utils::u32ify(&self.body, offset))
    }

    pub fn command(&self) -> Result<u32> {
        self.u32_at(0)
    }

    /// Object id echoed in the upper half of the command word.
    pub fn object(&self) -> Result<u16> {
        Ok((self.command()? >> 16) as u16)
    }

    pub fn expect_object(&self, object: u16) -> Result<()> {
        let got = self.object()?;
        if got != object {
            return Err(Error::Protocol(format!(
                "expected object 0x{:04x}, got 0x{:04x}",
                object, got
            )));
        }
        Ok(())
    }

    pub fn records(&self) -> &[u8] {
        self.body.get(RECORDS_OFFSET - HEADER_LEN..).unwrap_or_default()
    }
} // }}}
