//! Kernel logging sinks.
//!
//! Two phases, zero-loss transition:
//!
//! **Phase 1 — early serial (pre-heap):** [`init_early_serial`] registers
//! print/log functions that write straight to COM1 with no locks and no
//! allocation; everything logged during PMM/VMM/heap bring-up goes through
//! this path.
//!
//! **Phase 2 — full logger (post-heap):** [`init_logger`] installs a
//! [`Logger`] fanning records out to a `Vec<Box<dyn LogSink>>` behind a spin
//! lock, with the serial sink pre-registered. Additional sinks (e.g. a
//! terminal window) are added with [`add_sink`].
//!
//! Records carry `(level, file:line, message)` per the `palmyra-core`
//! logging contract.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use palmyra_core::log::{Location, LogLevel};
use palmyra_core::sync::SpinLock;

use crate::drivers::uart::{COM1, Uart16550};

/// A dyn-compatible output sink for the kernel logger.
pub trait LogSink: Send + Sync {
    /// Writes a string fragment.
    fn write_str(&self, s: &str);
    /// Maximum level accepted (records with `level <= max_level` pass).
    fn max_level(&self) -> LogLevel;
    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;
}

/// A [`LogSink`] writing to a 16550 UART.
pub struct SerialSink {
    uart: Uart16550,
    max_level: LogLevel,
}

impl SerialSink {
    /// Creates a serial sink.
    #[must_use]
    pub fn new(uart: Uart16550, max_level: LogLevel) -> Self {
        Self { uart, max_level }
    }
}

impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.uart.write_byte(b'\r');
            }
            self.uart.write_byte(byte);
        }
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "serial"
    }
}

/// Stack-constructed `fmt::Write` adapter over the UART.
struct SerialWriter(Uart16550);

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.0.write_byte(b'\r');
            }
            self.0.write_byte(byte);
        }
        Ok(())
    }
}

/// Early print function: straight to COM1, no locks.
fn early_serial_print(args: fmt::Arguments<'_>) {
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = w.write_fmt(args);
}

/// Early log function: formats a leveled, located record to COM1.
fn early_serial_log(level: LogLevel, loc: Location, args: fmt::Arguments<'_>) {
    let micros = palmyra_core::clock::monotonic_micros();
    let secs = micros / 1_000_000;
    let sub = micros % 1_000_000;
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = write!(
        w,
        "[{secs:>5}.{sub:06}] {} {}:{} {args}\n",
        level.name(),
        loc.file,
        loc.line
    );
}

/// Registers the early serial functions. Call after UART init and before
/// any `kprint!`/`klog!` use. No heap required.
pub fn init_early_serial() {
    // SAFETY: both functions only construct a stack Uart16550 and write
    // bytes; safe from any context.
    unsafe {
        palmyra_core::log::set_print_fn(early_serial_print);
        palmyra_core::log::set_log_fn(early_serial_log);
    }
}

// ---------------------------------------------------------------------------
// Full logger
// ---------------------------------------------------------------------------

struct LoggerInner {
    sinks: Vec<Box<dyn LogSink>>,
}

/// The kernel logger: fan-out to every registered sink.
pub struct Logger {
    inner: SpinLock<Option<LoggerInner>>,
}

impl Logger {
    /// Creates an uninitialized logger; writes are no-ops until
    /// [`init_with_serial`](Self::init_with_serial).
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Installs the sink list with a serial sink pre-registered, then takes
    /// over the global print/log functions.
    fn init_with_serial(&self) {
        {
            let mut guard = self.inner.lock();
            let mut sinks: Vec<Box<dyn LogSink>> = Vec::with_capacity(4);
            sinks.push(Box::new(SerialSink::new(
                Uart16550::new(COM1),
                LogLevel::Trace,
            )));
            *guard = Some(LoggerInner { sinks });
        }

        // SAFETY: logger_print and logger_log are safe from any context.
        unsafe {
            palmyra_core::log::set_print_fn(logger_print);
            palmyra_core::log::set_log_fn(logger_log);
        }
    }

    /// Registers an additional sink.
    fn add_sink(&self, sink: Box<dyn LogSink>) {
        let mut guard = self.inner.lock();
        if let Some(inner) = guard.as_mut() {
            inner.sinks.push(sink);
        }
    }

    /// Raw write: fans `args` out to every sink, no filtering.
    fn write_fmt(&self, args: fmt::Arguments<'_>) {
        let guard = self.inner.lock();
        if let Some(inner) = guard.as_ref() {
            for sink in &inner.sinks {
                let mut w = SinkWriter(sink.as_ref());
                let _ = fmt::Write::write_fmt(&mut w, args);
            }
        }
    }

    /// Leveled write: formats one record and hands it to every sink whose
    /// level admits it.
    fn log(&self, level: LogLevel, loc: Location, args: fmt::Arguments<'_>) {
        let micros = palmyra_core::clock::monotonic_micros();
        let secs = micros / 1_000_000;
        let sub = micros % 1_000_000;

        let guard = self.inner.lock();
        if let Some(inner) = guard.as_ref() {
            for sink in &inner.sinks {
                if level <= sink.max_level() {
                    let mut w = SinkWriter(sink.as_ref());
                    let _ = write!(
                        w,
                        "[{secs:>5}.{sub:06}] {} {}:{} {args}\n",
                        level.name(),
                        loc.file,
                        loc.line
                    );
                }
            }
        }
    }
}

/// Adapter wrapping a `&dyn LogSink` as `fmt::Write`.
struct SinkWriter<'a>(&'a dyn LogSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Global logger instance.
pub static LOGGER: Logger = Logger::new();

fn logger_print(args: fmt::Arguments<'_>) {
    LOGGER.write_fmt(args);
}

fn logger_log(level: LogLevel, loc: Location, args: fmt::Arguments<'_>) {
    LOGGER.log(level, loc, args);
}

/// Initializes the full logger (phase 2). Call once the heap is available.
pub fn init_logger() {
    LOGGER.init_with_serial();
}

/// Registers an additional sink with the global logger.
pub fn add_sink(sink: Box<dyn LogSink>) {
    LOGGER.add_sink(sink);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use alloc::sync::Arc;

    /// Captures log output for assertions.
    struct CaptureSink {
        buffer: Arc<SpinLock<String>>,
        max_level: LogLevel,
    }

    impl LogSink for CaptureSink {
        fn write_str(&self, s: &str) {
            self.buffer.lock().push_str(s);
        }

        fn max_level(&self) -> LogLevel {
            self.max_level
        }

        fn name(&self) -> &str {
            "capture"
        }
    }

    #[test]
    fn leveled_records_carry_location_and_filter() {
        let logger = Logger::new();
        *logger.inner.lock() = Some(LoggerInner { sinks: Vec::new() });

        let info_buf = Arc::new(SpinLock::new(String::new()));
        logger.add_sink(Box::new(CaptureSink {
            buffer: Arc::clone(&info_buf),
            max_level: LogLevel::Info,
        }));
        let trace_buf = Arc::new(SpinLock::new(String::new()));
        logger.add_sink(Box::new(CaptureSink {
            buffer: Arc::clone(&trace_buf),
            max_level: LogLevel::Trace,
        }));

        let loc = Location { file: "net/arp.rs", line: 42 };
        logger.log(LogLevel::Debug, loc, format_args!("who-has {}", "10.0.0.1"));
        logger.log(LogLevel::Error, loc, format_args!("ring full"));

        // The Info-capped sink only saw the error.
        let info = info_buf.lock();
        assert!(!info.contains("who-has"));
        assert!(info.contains("ERROR"));
        assert!(info.contains("net/arp.rs:42"));

        // The Trace sink saw both.
        let trace = trace_buf.lock();
        assert!(trace.contains("who-has 10.0.0.1"));
        assert!(trace.contains("ring full"));
    }

    #[test]
    fn uninitialized_logger_is_silent() {
        let logger = Logger::new();
        // No sinks installed: must not panic.
        logger.write_fmt(format_args!("into the void"));
        logger.log(
            LogLevel::Info,
            Location { file: "x", line: 1 },
            format_args!("nothing"),
        );
    }
}
