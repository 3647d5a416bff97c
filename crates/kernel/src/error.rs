//! Fatal-error reporting.
//!
//! The kernel's convention for unrecoverable faults: format the error and
//! its source chain to the console, then panic. The panic handler belongs to
//! the boot environment and halts the CPU; continuing after heap corruption
//! or misconfiguration would only compound the damage.

use core::{error::Error, fmt};

/// Reports an unrecoverable error and halts.
#[track_caller]
pub fn report<E>(err: E) -> !
where
    E: Error,
{
    let report = Report::new(err);
    error!("{report}");
    panic!("unrecoverable kernel error");
}

/// Display adapter rendering an error with its source chain.
pub struct Report<E> {
    error: E,
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E> fmt::Debug for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\x1B[31;1m{}\x1B[0m", self.error)?;
        let mut source = self.error.source();
        if source.is_some() {
            write!(f, "\ncaused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            write!(f, "\n{index:4}: {s}")?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::format;

    use snafu::{IntoError as _, Snafu};

    use super::*;
    use crate::test_support::GATE;

    #[derive(Debug, Snafu)]
    #[snafu(display("inner failure"))]
    struct InnerError;

    #[derive(Debug, Snafu)]
    #[snafu(display("outer failure"))]
    struct OuterError {
        source: InnerError,
    }

    #[test]
    fn report_renders_the_source_chain() {
        let err = OuterSnafu.into_error(InnerError);
        let rendered = format!("{}", Report::new(err));
        assert!(rendered.contains("outer failure"));
        assert!(rendered.contains("caused by:"));
        assert!(rendered.contains("inner failure"));
    }

    #[test]
    #[should_panic(expected = "unrecoverable kernel error")]
    fn report_halts() {
        let _gate = GATE.lock();
        report(InnerError);
    }
}
