//! Archived day yields and event log entries.

use crate::prelude::*;
use crate::sma::record;

use {
    nom_derive::{Nom, Parse},
    num_enum::{IntoPrimitive, TryFromPrimitive},
    serde::Serialize,
    std::convert::TryFrom,
};

const DAY_YIELD_LEN: usize = 12;
const EVENT_LEN: usize = 48;
/// Consecutive yield samples further apart than this are not differenced.
pub const MAX_YIELD_GAP_SECS: u32 = 48 * 3600;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ArchiveKind {
    /// 5-minute cumulative yield
    DayData = 0x7000,
    UserEvents = 0x7010,
    InstallerEvents = 0x7012,
    /// daily cumulative yield
    MonthData = 0x7020,
}

impl ArchiveKind {
    fn record_len(&self) -> usize {
        match self {
            ArchiveKind::DayData | ArchiveKind::MonthData => DAY_YIELD_LEN,
            ArchiveKind::UserEvents | ArchiveKind::InstallerEvents => EVENT_LEN,
        }
    }
}

// DayYield {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct DayYield {
    pub time: u32,
    /// Wh since commissioning
    pub cumulative_yield: i64,
}

#[derive(Nom)]
#[nom(LittleEndian)]
struct RawDayYield {
    time: u32,
    value: u64,
}

impl DayYield {
    fn decode(raw: &[u8]) -> Result<Option<Self>> {
        let (_, r) = RawDayYield::parse(raw)
            .map_err(|_| Error::Protocol("short day yield record".to_string()))?;

        Ok(record::counter(r.value).and_then(|v| {
            i64::try_from(v).ok().map(|cumulative_yield| Self {
                time: r.time,
                cumulative_yield,
            })
        }))
    }
} // }}}

// Event {{{
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Nom)]
#[nom(LittleEndian)]
pub struct Event {
    pub time: u32,
    pub entry_id: u16,
    pub susy_id: u16,
    pub serial: u32,
    pub event_code: u16,
    pub flags: u16,
    pub group: u32,
    #[nom(SkipBefore(4))]
    pub tag: u32,
    pub counter: u32,
    pub change_time: u32,
    pub parameter: u32,
    pub new_value: u32,
    pub old_value: u32,
} // }}}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArchiveEntry {
    DayYield(DayYield),
    Event(Event),
}

impl ArchiveEntry {
    pub fn time(&self) -> u32 {
        match self {
            ArchiveEntry::DayYield(d) => d.time,
            ArchiveEntry::Event(e) => e.time,
        }
    }
}

/// Decodes the fixed size entries of one archive page. Entries carrying the
/// invalid-value sentinel or a zero timestamp are dropped.
pub fn decode_page(kind: ArchiveKind, data: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let len = kind.record_len();
    if data.len() % len != 0 {
        debug!(
            "{:?} page of {} bytes has {} trailing bytes",
            kind,
            data.len(),
            data.len() % len
        );
    }

    let mut r = Vec::new();
    for raw in data.chunks_exact(len) {
        let entry = match kind {
            ArchiveKind::DayData | ArchiveKind::MonthData => {
                DayYield::decode(raw)?.map(ArchiveEntry::DayYield)
            }
            ArchiveKind::UserEvents | ArchiveKind::InstallerEvents => Event::parse(raw)
                .map(|(_, e)| ArchiveEntry::Event(e))
                .map_err(|_| Error::Protocol("short event record".to_string()))
                .map(Some)?,
        };

        match entry {
            Some(entry) if entry.time() != 0 => r.push(entry),
            _ => trace!("dropping empty {:?} entry {}", kind, Utils::hex(raw)),
        }
    }

    Ok(r)
}

/// Keeps entries with `from <= time <= to`; devices may return their whole
/// history regardless of the requested range.
pub fn filter_range(entries: Vec<ArchiveEntry>, from: u32, to: u32) -> Vec<ArchiveEntry> {
    entries
        .into_iter()
        .filter(|e| (from..=to).contains(&e.time()))
        .collect()
}

/// Energy produced between two consecutive yield samples.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct DailyYield {
    /// time of the later sample
    pub time: u32,
    /// Wh
    pub energy: i64,
}

/// Differences a time-ordered series of cumulative yields. Pairs more than
/// [`MAX_YIELD_GAP_SECS`] apart, or out of order, produce no entry.
pub fn daily_yields(entries: &[DayYield]) -> Vec<DailyYield> {
    entries
        .windows(2)
        .filter_map(|pair| {
            let (prev, next) = (pair[0], pair[1]);
            if next.time <= prev.time || next.time - prev.time > MAX_YIELD_GAP_SECS {
                debug!(
                    "skipping yield pair {} -> {} ({}s apart)",
                    prev.time,
                    next.time,
                    next.time as i64 - prev.time as i64
                );
                return None;
            }
            Some(DailyYield {
                time: next.time,
                energy: next.cumulative_yield - prev.cumulative_yield,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: u32 = 1_700_000_000;

    fn day_yield(time: u32, value: u64) -> Vec<u8> {
        let mut r = time.to_le_bytes().to_vec();
        r.extend_from_slice(&value.to_le_bytes());
        r
    }

    fn sample(time: u32, cumulative_yield: i64) -> DayYield {
        DayYield {
            time,
            cumulative_yield,
        }
    }

    #[test]
    fn deltas_between_consecutive_days() {
        let series = [
            sample(T, 100),
            sample(T + 86_400, 150),
            sample(T + 2 * 86_400, 400),
        ];
        let deltas: Vec<i64> = daily_yields(&series).iter().map(|d| d.energy).collect();
        assert_eq!(deltas, vec![50, 250]);
    }

    #[test]
    fn gaps_are_skipped() {
        assert!(daily_yields(&[sample(T, 100), sample(T + 200_000, 150)]).is_empty());

        let series = [
            sample(T, 100),
            sample(T + 200_000, 150),
            sample(T + 200_000 + 86_400, 175),
        ];
        assert_eq!(
            daily_yields(&series),
            vec![DailyYield {
                time: T + 200_000 + 86_400,
                energy: 25
            }]
        );
        assert!(daily_yields(&[sample(T, 1)]).is_empty());
    }

    #[test]
    fn day_yield_pages() {
        let mut data = day_yield(T, 1_000);
        data.extend(day_yield(T + 300, u64::MAX));
        data.extend(day_yield(0, 0));
        data.extend(day_yield(T + 600, 1_010));

        let entries = decode_page(ArchiveKind::DayData, &data).unwrap();
        assert_eq!(
            entries,
            vec![
                ArchiveEntry::DayYield(sample(T, 1_000)),
                ArchiveEntry::DayYield(sample(T + 600, 1_010)),
            ]
        );

        let filtered = filter_range(entries, T + 1, T + 600);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].time(), T + 600);
    }

    #[test]
    fn event_pages() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&T.to_le_bytes());
        raw.extend_from_slice(&17u16.to_le_bytes());
        raw.extend_from_slice(&0x0083u16.to_le_bytes());
        raw.extend_from_slice(&2_130_012_345u32.to_le_bytes());
        raw.extend_from_slice(&10_001u16.to_le_bytes());
        raw.extend_from_slice(&0u16.to_le_bytes());
        for word in [4u32, 0, 0x1234, 3, T - 60, 0x0046_2F00, 7, 6] {
            raw.extend_from_slice(&word.to_le_bytes());
        }
        assert_eq!(raw.len(), 48);

        let entries = decode_page(ArchiveKind::UserEvents, &raw).unwrap();
        let ArchiveEntry::Event(event) = &entries[0] else {
            panic!("not an event");
        };
        assert_eq!(event.entry_id, 17);
        assert_eq!(event.serial, 2_130_012_345);
        assert_eq!(event.event_code, 10_001);
        assert_eq!(event.group, 4);
        assert_eq!(event.tag, 0x1234);
        assert_eq!(event.change_time, T - 60);
        assert_eq!((event.new_value, event.old_value), (7, 6));
    }

    #[test]
    fn archive_kinds() {
        assert_eq!(u16::from(ArchiveKind::MonthData), 0x7020);
        assert_eq!(ArchiveKind::try_from(0x7012).unwrap(), ArchiveKind::InstallerEvents);
        assert!(ArchiveKind::try_from(0x5100).is_err());
    }
}
