use std::fs::{self, File, OpenOptions};
use std::io::{self, Stdout, Write};
use std::path::Path;

use anyhow::anyhow;
use slog::{b, o, Drain, Record};

use iotgw_conf::logging::{Level, Log, To};

use crate::Result;

pub use slog::Logger;

/// Builds the slog logger described by `cfg` and routes the `log` facade into it.
pub fn logger_init(cfg: &Log) -> Result<Logger> {
    let logger = config_logger(cfg)?;
    log::set_boxed_logger(Box::new(LoggerEx(logger.clone())))
        .map_err(|e| anyhow!("logger already installed, {e}"))?;
    log::set_max_level(if cfg.to.off() { log::LevelFilter::Off } else { cfg.level.level_filter() });
    Ok(logger)
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&Record::new(&s, args, b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

pub fn config_logger(cfg: &Log) -> Result<Logger> {
    let file = match cfg.filename() {
        Some(filename) if cfg.to.file() => Some(open_file(&filename)?),
        _ => None,
    };
    let decorator = slog_term::PlainSyncDecorator::new(WriteFilter { to: cfg.to, file, console: io::stdout() });
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(|io: &mut dyn Write| {
            write!(io, "{}", iotgw_utils::format_timestamp_millis(iotgw_utils::timestamp_millis()))
        })
        .build()
        .fuse();

    let drain = LevelFilter { drain, level: cfg.level }.fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Ok(Logger::root(drain, o!()))
}

struct LevelFilter<D> {
    drain: D,
    level: Level,
}

impl<D> Drain for LevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(&self, record: &Record, values: &slog::OwnedKVList) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level.inner()) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

struct WriteFilter {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.to.console() {
            self.console.write_all(buf)?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &Path) -> Result<File> {
    if let Some(dir) = filename.parent() {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| anyhow!("logger file config error, filename: {:?}, {:?}", filename, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(log_to_slog_level(log::Level::Warn), slog::Level::Warning);
        assert_eq!(log_to_slog_level(log::Level::Trace), slog::Level::Trace);
    }

    #[test]
    fn test_file_logger() {
        let dir = std::env::temp_dir().join(format!("iotgw-log-{}", uuid::Uuid::new_v4().simple()));
        let cfg = Log { to: To::File, dir: dir.to_string_lossy().into_owned(), ..Default::default() };
        let logger = config_logger(&cfg).unwrap();
        slog::info!(logger, "hello from test");
        drop(logger);
        assert!(dir.join("iotgw.log").exists());
        let _ = fs::remove_dir_all(dir);
    }
}
