use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};
use std::path::Path;

use anyhow::anyhow;
use slog::{o, Drain};

use fluxmq_conf::logging::{Log, To};

use crate::Result;

pub use slog::Logger;

/// Routes the `log` macros into an async slog drain built from the `[log]` section.
pub fn logger_init(cfg: &Log) -> Result<()> {
    let logger = config_logger(cfg)?;
    log::set_boxed_logger(Box::new(LoggerEx(logger))).map_err(|e| anyhow!("logger init failed, {}", e))?;
    log::set_max_level(slog_log_to_level(cfg.level).to_level_filter());
    Ok(())
}

pub fn config_logger(cfg: &Log) -> Result<Logger> {
    let decorator = slog_term::PlainDecorator::new(WriteFilter::new(cfg)?);
    let drain = slog_term::FullFormat::new(decorator).use_custom_timestamp(timestamp).build().fuse();
    let drain = drain.filter_level(cfg.level).fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();
    Ok(Logger::root(drain, o!()))
}

fn timestamp(io: &mut dyn io::Write) -> io::Result<()> {
    write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: r.target() };
        self.0.log(&slog::Record::new(&s, r.args(), slog::b!()))
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

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();
    slog::RecordLocation { file, line, column: 0, function: "", module }
}

/// Console, file, both or nowhere: with neither sink set, records are discarded.
struct WriteFilter {
    console: Option<Stdout>,
    file: Option<File>,
}

impl WriteFilter {
    fn new(cfg: &Log) -> Result<Self> {
        let file = cfg.file_path().map(|path| open_file(&path)).transpose()?;
        let console = if cfg.to.console() { Some(io::stdout()) } else { None };
        Ok(Self { console, file })
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(c) = self.console.as_mut() {
            c.write_all(buf)?;
        }
        if let Some(f) = self.file.as_mut() {
            f.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(c) = self.console.as_mut() {
            c.flush()?;
        }
        if let Some(f) = self.file.as_mut() {
            f.flush()?;
        }
        Ok(())
    }
}

fn open_file(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow!("log dir {} can not be created, {}", dir.display(), e))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow!("log file {} can not be opened, {}", path.display(), e))
}
