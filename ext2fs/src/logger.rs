//! `log` backend for the kernel console.
//!
//! Records pass a minimum level and a per-module filter table before they
//! reach the [`ConsoleSink`]. A filter names a module path and also covers
//! its submodules.

use core::fmt;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

use crate::config::DEFAULT_LOG_LEVEL;

/// Where formatted log lines end up, usually the kernel console.
pub trait ConsoleSink: Send + Sync {
    fn write_line(&self, args: fmt::Arguments);
}

fn colored_str(level: Level) -> &'static str {
    match level {
        Level::Trace => "\x1b[90mTRACE\x1b[0m", // Grey
        Level::Debug => "\x1b[36mDEBUG\x1b[0m", // Cyan
        Level::Info => "\x1b[32mINFO\x1b[0m",   // Green
        Level::Warn => "\x1b[33mWARN\x1b[0m",   // Yellow
        Level::Error => "\x1b[31mERROR\x1b[0m", // Red
    }
}

/// Maximum number of module filters
const MAX_MODULE_FILTERS: usize = 32;

#[derive(Debug, Clone, Copy)]
struct ModuleFilter {
    name: [u8; 32],
    name_len: usize,
    enabled: bool,
}

impl ModuleFilter {
    const fn new() -> Self {
        Self {
            name: [0; 32],
            name_len: 0,
            enabled: true,
        }
    }

    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = core::cmp::min(bytes.len(), self.name.len());
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name_len = len;
    }

    fn same_name(&self, module: &str) -> bool {
        self.name_len != 0 && &self.name[..self.name_len] == module.as_bytes()
    }

    fn covers(&self, target: &str) -> bool {
        if self.name_len == 0 {
            return false;
        }
        let name = &self.name[..self.name_len];
        let target = target.as_bytes();
        target.starts_with(name)
            && (target.len() == name.len() || target[name.len()..].starts_with(b"::"))
    }
}

struct FilterTable {
    level: LevelFilter,
    module_filters: [ModuleFilter; MAX_MODULE_FILTERS],
    filter_count: usize,
    // state for modules not in the filter list
    default_enabled: bool,
}

impl FilterTable {
    fn set_module(&mut self, module: &str, enabled: bool) -> bool {
        let count = self.filter_count;
        if let Some(filter) = self.module_filters[..count]
            .iter_mut()
            .find(|f| f.same_name(module))
        {
            filter.enabled = enabled;
            return true;
        }
        if count == MAX_MODULE_FILTERS {
            return false;
        }
        self.module_filters[count].set_name(module);
        self.module_filters[count].enabled = enabled;
        self.filter_count += 1;
        true
    }

    /// The longest matching filter wins.
    fn is_module_enabled(&self, target: &str) -> bool {
        self.module_filters[..self.filter_count]
            .iter()
            .filter(|f| f.covers(target))
            .max_by_key(|f| f.name_len)
            .map_or(self.default_enabled, |f| f.enabled)
    }
}

pub struct KernelLogger {
    filters: Mutex<FilterTable>,
    sink: Mutex<Option<&'static dyn ConsoleSink>>,
}

impl KernelLogger {
    pub const fn new() -> Self {
        Self {
            filters: Mutex::new(FilterTable {
                level: DEFAULT_LOG_LEVEL,
                module_filters: [ModuleFilter::new(); MAX_MODULE_FILTERS],
                filter_count: 0,
                default_enabled: true,
            }),
            sink: Mutex::new(None),
        }
    }

    /// Registers this logger with the `log` facade. Fails if another logger
    /// was installed first.
    pub fn install(
        &'static self,
        sink: &'static dyn ConsoleSink,
        level: LevelFilter,
    ) -> Result<(), SetLoggerError> {
        self.set_sink(sink);
        self.set_level(level);
        log::set_logger(self)?;
        log::set_max_level(level);
        Ok(())
    }

    pub fn set_sink(&self, sink: &'static dyn ConsoleSink) {
        *self.sink.lock() = Some(sink);
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.filters.lock().level = level;
    }

    pub fn set_default_enabled(&self, enabled: bool) {
        self.filters.lock().default_enabled = enabled;
    }

    /// Returns false when the filter table is full.
    pub fn enable_module(&self, module: &str) -> bool {
        self.filters.lock().set_module(module, true)
    }

    pub fn disable_module(&self, module: &str) -> bool {
        self.filters.lock().set_module(module, false)
    }
}

impl Default for KernelLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let filters = self.filters.lock();
        metadata.level() <= filters.level && filters.is_module_enabled(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let sink = *self.sink.lock();
        if let Some(sink) = sink {
            sink.write_line(format_args!(
                "[{}] [\x1b[34m{}\x1b[0m] {}",
                colored_str(record.level()),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}
