//! `[log]` section.
//!
//! ```toml
//! [log]
//! to = "both"         # off | console | file | both
//! level = "debug"     # trace | debug | info | warn | error | critical
//! dir = "/var/log/fluxmq"
//! file = "fluxmq.log"
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    #[serde(deserialize_with = "deserialize_level")]
    pub level: slog::Level,
    pub dir: PathBuf,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            to: To::Console,
            level: slog::Level::Info,
            dir: PathBuf::from("/var/log/fluxmq"),
            file: "fluxmq.log".into(),
        }
    }
}

impl Log {
    /// Log file to append to, `None` when file output is off or no file is named.
    pub fn file_path(&self) -> Option<PathBuf> {
        if !self.to.file() || self.file.is_empty() {
            return None;
        }
        Some(self.dir.join(&self.file))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    File,
    #[default]
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(self) -> bool {
        matches!(self, To::Both | To::File)
    }

    #[inline]
    pub fn console(self) -> bool {
        matches!(self, To::Both | To::Console)
    }
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<slog::Level, D::Error>
where
    D: Deserializer<'de>,
{
    let level = String::deserialize(deserializer)?;
    slog::Level::from_str(&level).map_err(|_| de::Error::custom(format!("invalid log level: {level}")))
}
