pub struct Utils;

impl Utils {
    pub fn round(x: f64, decimals: u32) -> f64 {
        let y = 10i32.pow(decimals) as f64;
        (x * y).round() / y
    }

    pub fn utc() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }

    /// Current time as the 32-bit unix timestamp used on the wire.
    pub fn unix_now() -> u32 {
        Self::utc().timestamp().clamp(0, u32::MAX as i64) as u32
    }

    pub fn from_unix(seconds: u32) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(seconds as i64, 0).unwrap_or_default()
    }

    pub fn div100(raw: Option<i64>) -> Option<f64> {
        raw.map(|v| Self::round(v as f64 / 100.0, 2))
    }

    pub fn div1000(raw: Option<i64>) -> Option<f64> {
        raw.map(|v| Self::round(v as f64 / 1000.0, 3))
    }

    /// Space separated hex dump for trace logging.
    pub fn hex(data: &[u8]) -> String {
        data.iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn u16ify(array: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([array[offset], array[offset + 1]])
    }

    pub fn u32ify(array: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes([
            array[offset],
            array[offset + 1],
            array[offset + 2],
            array[offset + 3],
        ])
    }
}
