use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// `[log]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default")]
    pub level: Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self {
            to: Self::to_default(),
            level: Self::level_default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
        }
    }
}

impl Log {
    #[inline]
    fn to_default() -> To {
        To::Console
    }
    #[inline]
    fn level_default() -> Level {
        Level(slog::Level::Info)
    }
    #[inline]
    fn dir_default() -> String {
        "/var/log/iotgw".into()
    }
    #[inline]
    fn file_default() -> String {
        "iotgw.log".into()
    }

    /// Full path of the log file, `None` when no file name is configured.
    pub fn filename(&self) -> Option<PathBuf> {
        if self.file.is_empty() {
            return None;
        }
        let mut path = PathBuf::from(self.dir.trim());
        path.push(&self.file);
        Some(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl<'de> Deserialize<'de> for To {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let to = match String::deserialize(deserializer)?.to_ascii_lowercase().as_str() {
            "off" => To::Off,
            "file" => To::File,
            "console" => To::Console,
            _ => To::Both,
        };
        Ok(to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }

    /// The matching `log` crate filter.
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.0 {
            slog::Level::Critical | slog::Level::Error => log::LevelFilter::Error,
            slog::Level::Warning => log::LevelFilter::Warn,
            slog::Level::Info => log::LevelFilter::Info,
            slog::Level::Debug => log::LevelFilter::Debug,
            slog::Level::Trace => log::LevelFilter::Trace,
        }
    }
}

impl From<slog::Level> for Level {
    #[inline]
    fn from(level: slog::Level) -> Self {
        Level(level)
    }
}

impl Deref for Level {
    type Target = slog::Level;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Level {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        let level = slog::Level::from_str(&level)
            .map_err(|_| de::Error::custom(format!("invalid log level {level:?}")))?;
        Ok(Level(level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrap {
        log: Log,
    }

    #[test]
    fn test_log_section() {
        let w: Wrap = toml::from_str(
            r#"
            [log]
            to = "FILE"
            level = "debug"
            dir = "/tmp/iotgw/"
            "#,
        )
        .unwrap();
        assert_eq!(w.log.to, To::File);
        assert!(w.log.to.file() && !w.log.to.console());
        assert_eq!(w.log.level.inner(), slog::Level::Debug);
        assert_eq!(w.log.level.level_filter(), log::LevelFilter::Debug);
        assert_eq!(w.log.filename(), Some(PathBuf::from("/tmp/iotgw/iotgw.log")));
    }

    #[test]
    fn test_unknown_target_falls_back_to_both() {
        let w: Wrap = toml::from_str("[log]\nto = \"syslog\"").unwrap();
        assert_eq!(w.log.to, To::Both);
        assert_eq!(w.log.level.inner(), slog::Level::Info);
    }

    #[test]
    fn test_invalid_level() {
        let res = toml::from_str::<Wrap>("[log]\nlevel = \"loud\"");
        assert!(res.is_err());
    }
}
