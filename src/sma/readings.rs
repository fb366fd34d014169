//! Typed readings built from channel records.
//!
//! Missing or invalid values stay `None`; they are never reported as zero.

use crate::prelude::*;
use crate::sma::record::{Record, Record1, Record3, RecordCommon};

use serde::{Serialize, Serializer};

/// Object id and index range of one channel query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Query {
    pub name: &'static str,
    pub object: u16,
    pub from: u32,
    pub to: u32,
}

impl Query {
    pub const AC: Self = Self {
        name: "ac",
        object: 0x5100,
        from: 0x0026_3F00,
        to: 0x0046_57FF,
    };
    pub const DC: Self = Self {
        name: "dc",
        object: 0x5380,
        from: 0x0025_1E00,
        to: 0x0045_21FF,
    };
    pub const STATISTICS: Self = Self {
        name: "statistics",
        object: 0x5400,
        from: 0x0026_0100,
        to: 0x0046_2FFF,
    };
    pub const STATUS: Self = Self {
        name: "status",
        object: 0x5180,
        from: 0x0021_4800,
        to: 0x0041_64FF,
    };
    pub const DEVICE_INFO: Self = Self {
        name: "device info",
        object: 0x5800,
        from: 0x0082_1E00,
        to: 0x0082_34FF,
    };
}

// indices {{{
const AC_TOTAL_POWER: u16 = 0x263F;
const AC_PHASE_POWER: [u16; 3] = [0x4640, 0x4641, 0x4642];
const AC_PHASE_VOLTAGE: [u16; 3] = [0x4648, 0x4649, 0x464A];
const AC_PHASE_CURRENT: [u16; 3] = [0x4653, 0x4654, 0x4655];
const AC_FREQUENCY: u16 = 0x4657;

const DC_POWER: u16 = 0x251E;
const DC_VOLTAGE: u16 = 0x451F;
const DC_CURRENT: u16 = 0x4521;

const TOTAL_YIELD: u16 = 0x2601;
const DAY_YIELD: u16 = 0x2622;
const OPERATION_TIME: u16 = 0x462E;
const FEED_IN_TIME: u16 = 0x462F;

const DEVICE_STATUS: u16 = 0x2148;
const GRID_RELAY: u16 = 0x4164;

const DEVICE_NAME: u16 = 0x821E;
const DEVICE_CLASS: u16 = 0x821F;
const DEVICE_TYPE: u16 = 0x8220;
const FIRMWARE: u16 = 0x8234;
// }}}

fn spot(record: &Record) -> Option<&Record1> {
    match record {
        Record::Record1(r) => Some(r),
        _ => None,
    }
}

fn block(record: &Record) -> Option<&Record3> {
    match record {
        Record::Record3(r) => Some(r),
        _ => None,
    }
}

// AcReadings {{{
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AcReadings {
    /// W
    pub total_power: Option<i64>,
    /// W per phase
    pub phase_power: [Option<i64>; 3],
    /// V per phase
    pub phase_voltage: [Option<f64>; 3],
    /// A per phase
    pub phase_current: [Option<f64>; 3],
    /// Hz
    pub frequency: Option<f64>,
}

impl AcReadings {
    pub fn from_records(records: &[Record]) -> Self {
        let mut r = Self::default();

        for record in records.iter().filter_map(spot) {
            let index = record.index();
            let value = record.reading();

            if index == AC_TOTAL_POWER {
                r.total_power = value;
            } else if index == AC_FREQUENCY {
                r.frequency = Utils::div100(value);
            } else if let Some(phase) = AC_PHASE_POWER.iter().position(|&i| i == index) {
                r.phase_power[phase] = value;
            } else if let Some(phase) = AC_PHASE_VOLTAGE.iter().position(|&i| i == index) {
                r.phase_voltage[phase] = Utils::div100(value);
            } else if let Some(phase) = AC_PHASE_CURRENT.iter().position(|&i| i == index) {
                r.phase_current[phase] = Utils::div1000(value);
            } else {
                trace!("ignoring ac index 0x{:04x}", index);
            }
        }

        r
    }
} // }}}

// DcReadings {{{
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Tracker {
    /// W
    pub power: Option<i64>,
    /// V
    pub voltage: Option<f64>,
    /// A
    pub current: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DcReadings {
    pub trackers: [Tracker; 2],
}

impl DcReadings {
    pub fn from_records(records: &[Record]) -> Self {
        let mut r = Self::default();

        for record in records.iter().filter_map(spot) {
            let tracker = match record.source_count() {
                1 => &mut r.trackers[0],
                2 => &mut r.trackers[1],
                n => {
                    debug!("ignoring dc record for tracker {}", n);
                    continue;
                }
            };

            let value = record.reading();
            match record.index() {
                DC_POWER => tracker.power = value,
                DC_VOLTAGE => tracker.voltage = Utils::div100(value),
                DC_CURRENT => tracker.current = Utils::div1000(value),
                index => trace!("ignoring dc index 0x{:04x}", index),
            }
        }

        r
    }

    /// Sum over trackers that reported power, `None` if none did.
    pub fn total_power(&self) -> Option<i64> {
        self.trackers
            .iter()
            .filter_map(|t| t.power)
            .fold(None, |acc, p| Some(acc.unwrap_or(0) + p))
    }
} // }}}

// Statistics {{{
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// Wh
    pub total_yield: Option<u64>,
    /// Wh
    pub day_yield: Option<u64>,
    /// s
    pub operation_time: Option<u64>,
    /// s
    pub feed_in_time: Option<u64>,
}

impl Statistics {
    pub fn from_records(records: &[Record]) -> Self {
        let mut r = Self::default();

        for record in records {
            let Record::Record2(counter) = record else {
                continue;
            };
            let value = counter.counter();
            match counter.index() {
                TOTAL_YIELD => r.total_yield = value,
                DAY_YIELD => r.day_yield = value,
                OPERATION_TIME => r.operation_time = value,
                FEED_IN_TIME => r.feed_in_time = value,
                index => trace!("ignoring counter index 0x{:04x}", index),
            }
        }

        r
    }
} // }}}

// Status {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum DeviceStatus {
    Ok,
    Fault,
    Off,
    Warning,
    Other(u32),
}

impl From<u32> for DeviceStatus {
    fn from(attribute: u32) -> Self {
        match attribute {
            307 => Self::Ok,
            35 => Self::Fault,
            303 => Self::Off,
            455 => Self::Warning,
            other => Self::Other(other),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum GridRelay {
    Closed,
    Open,
    NotAvailable,
    Other(u32),
}

impl From<u32> for GridRelay {
    fn from(attribute: u32) -> Self {
        match attribute {
            51 => Self::Closed,
            311 => Self::Open,
            16_777_213 => Self::NotAvailable,
            other => Self::Other(other),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Status {
    pub device_status: Option<DeviceStatus>,
    pub grid_relay: Option<GridRelay>,
}

impl Status {
    pub fn from_records(records: &[Record]) -> Self {
        let mut r = Self::default();

        for record in records.iter().filter_map(block) {
            let selected = record.selected_attribute();
            match record.index() {
                DEVICE_STATUS => r.device_status = selected.map(DeviceStatus::from),
                GRID_RELAY => r.grid_relay = selected.map(GridRelay::from),
                index => trace!("ignoring status index 0x{:04x}", index),
            }
        }

        r
    }
} // }}}

// InverterInfo {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u8,
    pub release_type: u8,
}

impl FirmwareVersion {
    /// Decodes the packed `type, build, minor, major` bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [release_type, build, minor, major, ..] => Some(Self {
                major: *major,
                minor: *minor,
                build: *build,
                release_type: *release_type,
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}.{}{}.{:02}.",
            self.major >> 4,
            self.major & 0x0F,
            self.minor >> 4,
            self.minor & 0x0F,
            self.build
        )?;
        match b"NEABRS".get(self.release_type as usize) {
            Some(letter) => write!(f, "{}", *letter as char),
            None => write!(f, "{}", self.release_type),
        }
    }
}

impl Serialize for FirmwareVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InverterInfo {
    pub name: Option<String>,
    pub device_class: Option<u32>,
    pub device_type: Option<u32>,
    pub firmware: Option<FirmwareVersion>,
}

impl InverterInfo {
    pub fn from_records(records: &[Record]) -> Self {
        let mut r = Self::default();

        for record in records.iter().filter_map(block) {
            match record.index() {
                DEVICE_NAME => r.name = record.text(),
                DEVICE_CLASS => r.device_class = record.selected_attribute(),
                DEVICE_TYPE => r.device_type = record.selected_attribute(),
                FIRMWARE => {
                    r.firmware = record.data.get(16..20).and_then(FirmwareVersion::from_bytes)
                }
                index => trace!("ignoring device info index 0x{:04x}", index),
            }
        }

        r
    }
} // }}}
