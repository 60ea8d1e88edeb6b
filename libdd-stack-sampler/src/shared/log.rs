// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Logging for contexts where `tracing` cannot be used: signal handlers, the window in which
//! another thread is suspended, and the crash path.
//!
//! A record is formatted into a fixed buffer on the stack and emitted with a single `write(2)` to
//! stderr. Records longer than the buffer are truncated. `errno` is preserved.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

const RECORD_CAPACITY: usize = 512;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
}

impl LogLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Off,
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            _ => Self::Debug,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Error as u8);

pub fn set_level(level: LogLevel) {
    LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= self::level()
}

/// A `fmt::Write` sink over a fixed array. Never allocates; silently drops what does not fit.
pub struct StackWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> StackWriter<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Appends `bytes`, keeping the last byte of the buffer free for a trailing newline.
    fn push(&mut self, bytes: &[u8]) {
        let room = N.saturating_sub(1).saturating_sub(self.len);
        let n = bytes.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        if n < bytes.len() {
            self.truncated = true;
        }
    }

    fn finish_line(&mut self) {
        if self.len < N {
            self.buf[self.len] = b'\n';
            self.len += 1;
        }
    }
}

impl<const N: usize> Default for StackWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for StackWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push(s.as_bytes());
        Ok(())
    }
}

/// Formats and emits one record. Safe to call from a signal handler as long as `args` only
/// formats integers, pointers and string slices.
pub fn write_record(level: LogLevel, module: &str, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let mut record = StackWriter::<RECORD_CAPACITY>::new();
    format_record(&mut record, level, module, args);

    let saved = errno::errno();
    let bytes = record.as_bytes();
    let mut written = 0;
    while written < bytes.len() {
        // Safety: the pointer and length describe the initialized prefix of `record`.
        let rval = unsafe {
            libc::write(
                libc::STDERR_FILENO,
                bytes[written..].as_ptr() as *const libc::c_void,
                bytes.len() - written,
            )
        };
        if rval > 0 {
            written += rval as usize;
        } else if rval < 0 && errno::errno().0 == libc::EINTR {
            continue;
        } else {
            break;
        }
    }
    errno::set_errno(saved);
}

fn format_record<const N: usize>(
    record: &mut StackWriter<N>,
    level: LogLevel,
    module: &str,
    args: fmt::Arguments<'_>,
) {
    use fmt::Write;
    let _ = write!(record, "[dd-stack-sampler] {} {}: ", level.as_str(), module);
    let _ = record.write_fmt(args);
    record.finish_line();
}

/// Async-signal-safe counterpart of the `tracing` macros.
///
/// ```ignore
/// async_safe_log!(LogLevel::Error, "failed to suspend thread {}", tid);
/// ```
macro_rules! async_safe_log {
    ($level:expr, $($arg:tt)+) => {
        $crate::shared::log::write_record($level, module_path!(), format_args!($($arg)+))
    };
}
pub(crate) use async_safe_log;
