//! Network stack logging infrastructure
//!
//! Provides a ring buffer for stack messages that can be:
//! - Written to by any subsystem via the klog_*() functions
//! - Forwarded to the `log` facade, so a host installs any logger it likes
//! - Drained by a diagnostic command or a test

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::lock::LockId;
use crate::Spinlock;

/// Maximum messages in the ring buffer
const LOG_BUFFER_SIZE: usize = 128;

/// Maximum length of a single log message
const MAX_MESSAGE_LEN: usize = 256;

/// Log levels
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Error conditions
    Error = 0,
    /// Warning conditions
    Warning = 1,
    /// Informational
    Info = 2,
    /// Debug-level messages
    Debug = 3,
    /// Per-packet messages (very verbose)
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn to_log(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// A single log entry
#[derive(Clone, Debug)]
pub struct LogEntry {
    /// Timestamp (ms from the installed time source)
    pub timestamp: u64,
    pub level: LogLevel,
    /// Subsystem name (e.g., "buf", "icmpv6", "dns", "svc")
    pub subsystem: String,
    pub message: String,
}

impl LogEntry {
    /// Format as a string for display
    pub fn format(&self) -> String {
        format!(
            "[{:>10}.{:03}] {} {}: {}",
            self.timestamp / 1000,
            self.timestamp % 1000,
            self.level.as_str(),
            self.subsystem,
            self.message
        )
    }
}

/// Ring buffer for stack log messages
pub struct LogBuffer {
    entries: Spinlock<VecDeque<LogEntry>>,
    /// Total messages logged
    sequence: AtomicUsize,
    /// Messages above this level are suppressed
    level_filter: AtomicUsize,
    /// Forward accepted entries to the `log` facade
    forward: AtomicBool,
    time_source: Spinlock<Option<fn() -> u64>>,
}

impl LogBuffer {
    pub const fn new() -> Self {
        Self {
            entries: Spinlock::new_with_id(VecDeque::new(), LockId::Klog),
            sequence: AtomicUsize::new(0),
            level_filter: AtomicUsize::new(LogLevel::Debug as usize),
            forward: AtomicBool::new(true),
            time_source: Spinlock::new_with_id(None, LockId::Klog),
        }
    }

    /// Log a message
    pub fn log(&self, level: LogLevel, subsystem: &str, message: &str) {
        if (level as usize) > self.level_filter.load(Ordering::Relaxed) {
            return;
        }

        let timestamp = match *self.time_source.lock() {
            Some(f) => f(),
            None => 0,
        };

        let message = if message.len() > MAX_MESSAGE_LEN {
            let mut cut = MAX_MESSAGE_LEN - 3;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            let mut s = String::from(&message[..cut]);
            s.push_str("...");
            s
        } else {
            String::from(message)
        };

        if self.forward.load(Ordering::Relaxed) {
            log::log!(target: subsystem, level.to_log(), "{}", message);
        }

        let entry = LogEntry {
            timestamp,
            level,
            subsystem: String::from(subsystem),
            message,
        };

        let mut buffer = self.entries.lock();
        if buffer.len() >= LOG_BUFFER_SIZE {
            buffer.pop_front(); // Drop oldest
        }
        buffer.push_back(entry);

        self.sequence.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain all entries
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut buffer = self.entries.lock();
        buffer.drain(..).collect()
    }

    /// Get recent entries without removing them, newest first
    pub fn recent(&self, count: usize) -> Vec<LogEntry> {
        let buffer = self.entries.lock();
        buffer.iter().rev().take(count).cloned().collect()
    }

    pub fn set_level(&self, level: LogLevel) {
        self.level_filter.store(level as usize, Ordering::Release);
    }

    pub fn set_forward(&self, enabled: bool) {
        self.forward.store(enabled, Ordering::Release);
    }

    pub fn set_time_source(&self, f: fn() -> u64) {
        *self.time_source.lock() = Some(f);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Total messages logged
    pub fn sequence(&self) -> usize {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Global stack log buffer
pub static KLOG: LogBuffer = LogBuffer::new();

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLIC LOGGING FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn klog_error(subsystem: &str, message: &str) {
    KLOG.log(LogLevel::Error, subsystem, message);
}

pub fn klog_warning(subsystem: &str, message: &str) {
    KLOG.log(LogLevel::Warning, subsystem, message);
}

pub fn klog_info(subsystem: &str, message: &str) {
    KLOG.log(LogLevel::Info, subsystem, message);
}

pub fn klog_debug(subsystem: &str, message: &str) {
    KLOG.log(LogLevel::Debug, subsystem, message);
}

pub fn klog_trace(subsystem: &str, message: &str) {
    KLOG.log(LogLevel::Trace, subsystem, message);
}

/// Set the minimum log level to record
pub fn set_log_level(level: LogLevel) {
    KLOG.set_level(level);
}

/// Install the timestamp source for new entries
pub fn set_time_source(f: fn() -> u64) {
    KLOG.set_time_source(f);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_time() -> u64 {
        12_345
    }

    #[test]
    fn test_ring_drops_oldest() {
        let buf = LogBuffer::new();
        for i in 0..(LOG_BUFFER_SIZE + 3) {
            buf.log(LogLevel::Info, "t", &format!("m{}", i));
        }
        assert_eq!(buf.len(), LOG_BUFFER_SIZE);
        assert_eq!(buf.sequence(), LOG_BUFFER_SIZE + 3);
        let all = buf.drain();
        assert_eq!(all[0].message, "m3");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_level_filter_and_format() {
        let buf = LogBuffer::new();
        buf.set_time_source(fixed_time);
        buf.set_level(LogLevel::Info);
        buf.log(LogLevel::Trace, "dns", "dropped");
        buf.log(LogLevel::Warning, "dns", "kept");
        let recent = buf.recent(4);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].format(), "[        12.345] WARN dns: kept");
    }

    #[test]
    fn test_long_message_truncated() {
        let buf = LogBuffer::new();
        let long = "x".repeat(MAX_MESSAGE_LEN + 10);
        buf.log(LogLevel::Error, "buf", &long);
        let e = &buf.recent(1)[0];
        assert_eq!(e.message.len(), MAX_MESSAGE_LEN);
        assert!(e.message.ends_with("..."));
    }
}
