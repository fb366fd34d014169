use crate::prelude::*;

use serde::{Serialize, Serializer};

// MacAddress {{{
/// Bluetooth device address in human-readable byte order.
///
/// SMA packets carry addresses least significant byte first, so
/// [`MacAddress::to_wire`]/[`MacAddress::from_wire`] reverse the bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const ZERO: Self = Self([0; 6]);
    pub const BROADCAST: Self = Self([0xFF; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let mut r: [u8; 6] = bytes
            .try_into()
            .map_err(|_| Error::Protocol(format!("bad address length {}", bytes.len())))?;
        r.reverse();
        Ok(Self(r))
    }

    pub fn to_wire(&self) -> [u8; 6] {
        let mut r = self.0;
        r.reverse();
        r
    }

    pub fn data(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::ZERO || *self == Self::BROADCAST
    }
}

impl std::str::FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(Error::Protocol(format!("{} is not a bluetooth address", s)));
        }

        let mut r = [0u8; 6];
        for (byte, part) in r.iter_mut().zip(parts) {
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| Error::Protocol(format!("{} is not a bluetooth address", s)))?;
        }
        Ok(Self(r))
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl std::fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Serialize for MacAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
} // }}}
