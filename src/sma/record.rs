//! Channel records returned by spot value, counter and device queries.

use crate::prelude::*;

use {
    enum_dispatch::*,
    nom_derive::{Nom, Parse},
    serde::Serialize,
};

pub const TYPE_UNSIGNED: u8 = 0x00;
pub const TYPE_STATUS: u8 = 0x08;
pub const TYPE_TEXT: u8 = 0x10;
pub const TYPE_SIGNED: u8 = 0x40;

pub const OBJECT_COUNTERS: u16 = 0x5400;
pub const OBJECT_DEVICE_INFO: u16 = 0x5800;

const RECORD_HEADER_LEN: usize = 8;
const ATTRIBUTE_END: u32 = 0x00FF_FFFE;

// {{{ RecordHeader
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Nom)]
#[nom(LittleEndian)]
pub struct RecordHeader {
    /// Source number, e.g. the tracker or phase a reading belongs to.
    pub source_count: u8,
    pub index: u16,
    pub data_type: u8,
    pub timestamp: u32,
} // }}}

#[enum_dispatch]
pub trait RecordCommon {
    fn header(&self) -> &RecordHeader;

    fn index(&self) -> u16 {
        self.header().index
    }

    fn source_count(&self) -> u8 {
        self.header().source_count
    }

    fn timestamp(&self) -> u32 {
        self.header().timestamp
    }
}

#[enum_dispatch(RecordCommon)]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Record {
    Record1(Record1),
    Record2(Record2),
    Record3(Record3),
}

// {{{ Record1
/// Spot value record: the reading is `value1`.
#[derive(Clone, Debug, Eq, PartialEq, Nom)]
#[nom(LittleEndian)]
pub struct Record1 {
    pub header: RecordHeader,
    pub value1: u32,
    pub value2: u32,
    pub value3: u32,
    #[nom(SkipAfter(4))]
    pub value4: u32,
}

impl RecordCommon for Record1 {
    fn header(&self) -> &RecordHeader {
        &self.header
    }
}

impl Record1 {
    pub fn reading(&self) -> Option<i64> {
        if self.header.data_type == TYPE_SIGNED {
            signed(self.value1).map(i64::from)
        } else {
            unsigned(self.value1).map(i64::from)
        }
    }
} // }}}

// {{{ Record2
/// Cumulative counter record.
#[derive(Clone, Debug, Eq, PartialEq, Nom)]
#[nom(LittleEndian)]
pub struct Record2 {
    pub header: RecordHeader,
    pub value: u64,
}

impl RecordCommon for Record2 {
    fn header(&self) -> &RecordHeader {
        &self.header
    }
}

impl Record2 {
    pub fn counter(&self) -> Option<u64> {
        counter(self.value)
    }
} // }}}

// {{{ Record3
/// Status attribute list, text, or packed version block.
#[derive(Clone, Debug, Eq, PartialEq, Nom)]
#[nom(LittleEndian)]
pub struct Record3 {
    pub header: RecordHeader,
    #[nom(Count = "32")]
    pub data: Vec<u8>,
}

impl RecordCommon for Record3 {
    fn header(&self) -> &RecordHeader {
        &self.header
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Attribute {
    pub id: u32,
    pub selected: bool,
}

impl Record3 {
    pub fn attributes(&self) -> Vec<Attribute> {
        self.data
            .chunks_exact(4)
            .map(|w| Utils::u32ify(w, 0))
            .map(|w| (w & 0x00FF_FFFF, w >> 24))
            .take_while(|(id, _)| *id != ATTRIBUTE_END)
            .filter(|(id, _)| *id != 0)
            .map(|(id, flag)| Attribute {
                id,
                selected: flag == 1,
            })
            .collect()
    }

    pub fn selected_attribute(&self) -> Option<u32> {
        self.attributes()
            .into_iter()
            .find(|a| a.selected)
            .map(|a| a.id)
    }

    pub fn text(&self) -> Option<String> {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        let text = String::from_utf8_lossy(&self.data[..end]).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
} // }}}

/// Signed reading; any value with the top bit set marks "no value".
pub fn signed(raw: u32) -> Option<i32> {
    if raw & 0x8000_0000 != 0 {
        None
    } else {
        Some(raw as i32)
    }
}

pub fn unsigned(raw: u32) -> Option<u32> {
    (raw != u32::MAX).then_some(raw)
}

pub fn counter(raw: u64) -> Option<u64> {
    (raw != u64::MAX && raw != 0x8000_0000_0000_0000).then_some(raw)
}

/// Record layout used by `object` for a record of `data_type`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Layout {
    Spot,
    Counter,
    Block,
}

impl Layout {
    pub fn select(object: u16, data_type: u8) -> Self {
        match (object, data_type) {
            (OBJECT_COUNTERS, _) => Layout::Counter,
            (OBJECT_DEVICE_INFO, _) | (_, TYPE_STATUS) | (_, TYPE_TEXT) => Layout::Block,
            _ => Layout::Spot,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Layout::Spot => 28,
            Layout::Counter => 16,
            Layout::Block => 40,
        }
    }
}

/// Decodes the records of a reply to a query on `object`. A trailing
/// partial record is ignored.
pub fn decode(object: u16, mut data: &[u8]) -> Result<Vec<Record>> {
    let mut r = Vec::new();

    while data.len() >= RECORD_HEADER_LEN {
        let layout = Layout::select(object, data[3]);
        let len = layout.len();
        if data.len() < len {
            debug!(
                "ignoring {} trailing bytes of object 0x{:04x}",
                data.len(),
                object
            );
            break;
        }

        let (raw, rest) = data.split_at(len);
        let record = match layout {
            Layout::Spot => Record1::parse(raw).map(|(_, r)| Record::from(r)),
            Layout::Counter => Record2::parse(raw).map(|(_, r)| Record::from(r)),
            Layout::Block => Record3::parse(raw).map(|(_, r)| Record::from(r)),
        }
        .map_err(|e| Error::Protocol(format!("bad record in object 0x{:04x}: {:?}", object, e)))?;

        trace!("record {:?}", record);
        r.push(record);
        data = rest;
    }

    Ok(r)
}
