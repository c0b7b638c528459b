use std::fmt::Display;
use std::io::Write;

use thiserror::Error;

/// Errors that can occur when configuring instrumentation or rendering reports.
///
/// None of these are data collection failures: the allocation path never produces an error
/// of its own.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A configuration variable was set to a value that is not understood. The documented
    /// default is used instead.
    #[error("Option '{key}={value}' not known. Fallback on default '{fallback}'")]
    UnrecognizedOption {
        /// Name of the configuration variable.
        key: &'static str,

        /// The value that was rejected, lossily converted to UTF-8.
        value: String,

        /// The default value that is used instead.
        fallback: &'static str,
    },

    /// A quantity is too large to be expressed with the supported magnitude prefixes.
    #[error("{value} is too large to be expressed with SI-like prefixes")]
    MagnitudeOverflow {
        /// The quantity that could not be formatted.
        value: u128,
    },
}

/// A specialized `Result` type for memstats operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Writes `message` as one diagnostic line.
///
/// Write failures are ignored. Diagnostics are written from inside the global allocator and
/// the exit hook, where a panic aborts the process.
pub(crate) fn write_diagnostic(output: &mut impl Write, message: &impl Display) {
    _ = writeln!(output, "{message}");
}

/// A writer whose reader has gone away, like stderr redirected into a closed pipe.
#[cfg(test)]
pub(crate) struct BrokenPipe;

#[cfg(test)]
impl Write for BrokenPipe {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::ErrorKind::BrokenPipe.into())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Err(std::io::ErrorKind::BrokenPipe.into())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn unrecognized_option_message_names_key_value_and_fallback() {
        let error = Error::UnrecognizedOption {
            key: "MEMSTATS_BINS",
            value: "lots".to_string(),
            fallback: "15",
        };

        assert_eq!(
            error.to_string(),
            "Option 'MEMSTATS_BINS=lots' not known. Fallback on default '15'"
        );
    }

    #[test]
    fn diagnostic_is_one_line() {
        let mut output = Vec::new();
        write_diagnostic(&mut output, &Error::MagnitudeOverflow { value: 7 });

        assert_eq!(
            String::from_utf8(output).unwrap(),
            "7 is too large to be expressed with SI-like prefixes\n"
        );
    }

    #[test]
    fn diagnostic_to_closed_output_is_dropped() {
        write_diagnostic(&mut BrokenPipe, &"nobody is listening");
        write_diagnostic(&mut BrokenPipe, &Error::MagnitudeOverflow { value: 7 });
    }

    #[test]
    fn magnitude_overflow_is_error() {
        let result: Result<()> = Err(Error::MagnitudeOverflow { value: u128::MAX });
        assert!(result.is_err());
    }
}
