use crate::prelude::*;

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Appends one JSON object per reading set to a file. Absent values are
/// written as `null`.
#[derive(Debug, Clone)]
pub struct DatalogWriter {
    file: Arc<Mutex<std::fs::File>>,
    path: String,
    lines_written: Arc<Mutex<u64>>,
}

impl DatalogWriter {
    pub fn new(path: &str) -> Result<Self> {
        info!("Opening datalog file at {}", path);

        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                error!("Failed to open datalog file {}: {}", path, e);
                return Err(e.into());
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)) {
                error!("Failed to set permissions on datalog file {}: {}", path, e);
                return Err(e.into());
            }
        }

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path.to_string(),
            lines_written: Arc::new(Mutex::new(0)),
        })
    }

    /// Writes `readings` of `kind` (e.g. `ac`, `statistics`) for `serial`.
    pub fn write_readings<T: Serialize>(
        &self,
        serial: u32,
        kind: &str,
        readings: &T,
    ) -> Result<()> {
        let mut json_data = serde_json::Map::new();
        json_data.insert(
            "utc_timestamp".to_string(),
            serde_json::Value::Number(Utils::utc().timestamp().into()),
        );
        json_data.insert("serial".to_string(), serde_json::Value::Number(serial.into()));
        json_data.insert("kind".to_string(), serde_json::Value::String(kind.to_string()));
        json_data.insert("data".to_string(), serde_json::to_value(readings)?);

        let json_string = serde_json::to_string(&serde_json::Value::Object(json_data))?;

        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("Failed to lock datalog file"))?;
        if let Err(e) = writeln!(file, "{}", json_string).and_then(|_| file.flush()) {
            error!("Failed to write to datalog file {}: {}", self.path, e);
            return Err(e.into());
        }

        let mut lines_written = self
            .lines_written
            .lock()
            .map_err(|_| anyhow!("Failed to lock line counter"))?;
        *lines_written += 1;
        debug!("{} {} readings written to {} ({} total)", serial, kind, self.path, *lines_written);

        Ok(())
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written.lock().map(|n| *n).unwrap_or_default()
    }
}
