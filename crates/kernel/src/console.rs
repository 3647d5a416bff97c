//! Kernel console output.
//!
//! The display device itself (VGA text mode, serial, whatever the target
//! has) is outside this crate; the boot environment installs a
//! [`ConsoleSink`] once and everything else goes through [`print!`] and
//! [`println!`]. Output produced before a sink exists is dropped.

use core::fmt::{self, Write as _};

use spin::Once;

use crate::sync::IntrMutex;

static SINK: Once<&'static dyn ConsoleSink> = Once::new();
static WRITE_LOCK: IntrMutex<()> = IntrMutex::new(());

/// Byte sink behind the kernel console.
///
/// Implementations are expected to be cheap and infallible; a sink that can
/// fail should swallow the failure rather than report it, since there is
/// nowhere else to report to.
pub trait ConsoleSink: Sync {
    fn write_str(&self, s: &str);
}

/// Installs the console sink. The first call wins; later calls are ignored.
pub fn install(sink: &'static dyn ConsoleSink) {
    SINK.call_once(|| sink);
}

struct SinkWriter(&'static dyn ConsoleSink);

impl fmt::Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Formats `args` to the installed sink under the console lock, so lines
/// from interrupt handlers and the main flow do not interleave.
pub fn print(args: fmt::Arguments) {
    if let Some(&sink) = SINK.get() {
        let _guard = WRITE_LOCK.lock();
        let _ = SinkWriter(sink).write_fmt(args);
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}
