//! Configuration read once from the process environment.

use std::ffi::{CStr, c_char};
use std::io::{self, Write};
use std::num::NonZero;

use new_zealand::nz;

use crate::error::write_diagnostic;
use crate::{Error, Palette};

pub(crate) const THREAD_INSTRUMENTATION_INIT_KEY: &str = "MEMSTATS_THREAD_INSTRUMENTATION_INIT";
pub(crate) const ENABLE_INSTRUMENTATION_KEY: &str = "MEMSTATS_ENABLE_INSTRUMENTATION";
pub(crate) const REPORT_AT_EXIT_KEY: &str = "MEMSTATS_REPORT_AT_EXIT";
pub(crate) const HISTOGRAM_REPRESENTATION_KEY: &str = "MEMSTATS_HISTOGRAM_REPRESENTATION";
pub(crate) const BINS_KEY: &str = "MEMSTATS_BINS";

const DEFAULT_BINS: NonZero<u16> = nz!(15);

/// Longest variable name we look up, plus the terminating NUL.
const KEY_BUFFER_LEN: usize = 64;

/// Instrumentation settings, fixed for the lifetime of the process.
///
/// The active configuration is loaded from environment variables the first time the process
/// allocates (or calls into this crate) and can be inspected via [`Config::current()`].
///
/// | Variable | Values | Default |
/// |---|---|---|
/// | `MEMSTATS_THREAD_INSTRUMENTATION_INIT` | `true`, `1`, `false`, `0` | `false` |
/// | `MEMSTATS_ENABLE_INSTRUMENTATION` | `true`, `1`, `false`, `0` | `false` |
/// | `MEMSTATS_REPORT_AT_EXIT` | `true`, `1`, `false`, `0` | `true` |
/// | `MEMSTATS_HISTOGRAM_REPRESENTATION` | `punctuation`, `circle`, `shadow`, `wire`, `box`, `number` | `box` |
/// | `MEMSTATS_BINS` | positive integer | `15` |
///
/// Unrecognized values are reported on stderr and replaced by the default.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    thread_instrumentation_init: bool,
    enable_instrumentation: bool,
    report_at_exit: bool,
    palette: Palette,
    bins: NonZero<u16>,
}

impl Config {
    /// Returns the configuration of this process, loading it first if necessary.
    #[must_use]
    pub fn current() -> &'static Self {
        crate::lifecycle::context().config()
    }

    /// Whether instrumentation is enabled on a thread before the thread changes it.
    #[must_use]
    pub fn thread_instrumentation_init(&self) -> bool {
        self.thread_instrumentation_init
    }

    /// Whether process-wide instrumentation is enabled at startup.
    #[must_use]
    pub fn enable_instrumentation(&self) -> bool {
        self.enable_instrumentation
    }

    /// Whether a final report is printed when the process exits.
    #[must_use]
    pub fn report_at_exit(&self) -> bool {
        self.report_at_exit
    }

    /// The glyphs used to draw histograms.
    #[must_use]
    pub fn palette(&self) -> Palette {
        self.palette
    }

    /// The number of histogram bins per bucket.
    #[must_use]
    pub fn bins(&self) -> NonZero<u16> {
        self.bins
    }

    #[cfg(test)]
    pub(crate) fn fake(bins: NonZero<u16>, palette: Palette) -> Self {
        Self {
            palette,
            bins,
            ..Self::default()
        }
    }

    /// Builds a configuration from an arbitrary variable lookup, collecting a problem for
    /// every value that is not understood.
    pub(crate) fn from_lookup<'a>(
        lookup: impl Fn(&'static str) -> Option<&'a [u8]>,
    ) -> (Self, Vec<Error>) {
        let mut problems = Vec::new();
        let defaults = Self::default();

        let mut setting = |key: &'static str, fallback: &'static str| {
            lookup(key).and_then(|raw| match std::str::from_utf8(raw) {
                Ok(value) => Some(value),
                Err(_) => {
                    problems.push(Error::UnrecognizedOption {
                        key,
                        value: String::from_utf8_lossy(raw).into_owned(),
                        fallback,
                    });
                    None
                }
            })
        };

        let thread_instrumentation_init = setting(THREAD_INSTRUMENTATION_INIT_KEY, "false")
            .map(|value| parse_bool(THREAD_INSTRUMENTATION_INIT_KEY, value, false));
        let enable_instrumentation = setting(ENABLE_INSTRUMENTATION_KEY, "false")
            .map(|value| parse_bool(ENABLE_INSTRUMENTATION_KEY, value, false));
        let report_at_exit = setting(REPORT_AT_EXIT_KEY, "true")
            .map(|value| parse_bool(REPORT_AT_EXIT_KEY, value, true));
        let palette = setting(HISTOGRAM_REPRESENTATION_KEY, defaults.palette.name())
            .map(str::parse::<Palette>);
        let bins = setting(BINS_KEY, "15").map(parse_bins);

        let config = Self {
            thread_instrumentation_init: resolve(
                thread_instrumentation_init,
                defaults.thread_instrumentation_init,
                &mut problems,
            ),
            enable_instrumentation: resolve(
                enable_instrumentation,
                defaults.enable_instrumentation,
                &mut problems,
            ),
            report_at_exit: resolve(report_at_exit, defaults.report_at_exit, &mut problems),
            palette: resolve(palette, defaults.palette, &mut problems),
            bins: resolve(bins, defaults.bins, &mut problems),
        };

        (config, problems)
    }

    /// Loads the configuration from the process environment, printing a diagnostic for every
    /// unrecognized value.
    ///
    /// Reading the environment does not allocate, so this is safe to call from inside the
    /// global allocator.
    pub(crate) fn from_env() -> Self {
        Self::from_lookup_reporting(env_lookup, &mut io::stderr())
    }

    /// Builds a configuration from a variable lookup, writing one diagnostic line per
    /// unrecognized value to `diagnostics`.
    fn from_lookup_reporting<'a>(
        lookup: impl Fn(&'static str) -> Option<&'a [u8]>,
        diagnostics: &mut impl Write,
    ) -> Self {
        let (config, problems) = Self::from_lookup(lookup);

        for problem in problems {
            write_diagnostic(diagnostics, &problem);
        }

        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thread_instrumentation_init: false,
            enable_instrumentation: false,
            report_at_exit: true,
            palette: Palette::Box,
            bins: DEFAULT_BINS,
        }
    }
}

fn parse_bool(key: &'static str, value: &str, default: bool) -> Result<bool, Error> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Error::UnrecognizedOption {
            key,
            value: value.to_owned(),
            fallback: if default { "true" } else { "false" },
        }),
    }
}

fn parse_bins(value: &str) -> Result<NonZero<u16>, Error> {
    value
        .parse::<NonZero<u16>>()
        .map_err(|_| Error::UnrecognizedOption {
            key: BINS_KEY,
            value: value.to_owned(),
            fallback: "15",
        })
}

/// Takes a successfully parsed value, or the default if the variable is absent or its value
/// is not understood.
fn resolve<T>(parsed: Option<Result<T, Error>>, default: T, problems: &mut Vec<Error>) -> T {
    match parsed {
        Some(Ok(value)) => value,
        Some(Err(problem)) => {
            problems.push(problem);
            default
        }
        None => default,
    }
}

/// Reads an environment variable without allocating.
///
/// `std::env::var_os()` returns an owned value, which would allocate through the very
/// allocator that is being initialized, so we go to the C runtime directly.
fn env_lookup(key: &'static str) -> Option<&'static [u8]> {
    let mut buffer = [0_u8; KEY_BUFFER_LEN];
    buffer.get_mut(..key.len())?.copy_from_slice(key.as_bytes());

    let c_key = CStr::from_bytes_until_nul(&buffer).ok()?;

    // SAFETY: `c_key` is a valid NUL-terminated string that outlives the call.
    let value: *const c_char = unsafe { libc::getenv(c_key.as_ptr()) };

    if value.is_null() {
        return None;
    }

    // SAFETY: `getenv()` returned a non-null pointer to a NUL-terminated string owned by the
    // environment. We only read configuration during initialization and nothing in this crate
    // modifies the environment, so the string remains valid while we parse it.
    Some(unsafe { CStr::from_ptr(value) }.to_bytes())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::BrokenPipe;

    fn config_from(pairs: &[(&'static str, &'static str)]) -> (Config, Vec<Error>) {
        let values: HashMap<&str, &[u8]> = pairs
            .iter()
            .map(|(key, value)| (*key, value.as_bytes()))
            .collect();

        Config::from_lookup(|key| values.get(key).copied())
    }

    #[test]
    fn no_variables_gives_defaults() {
        let (config, problems) = config_from(&[]);

        assert!(problems.is_empty());
        assert_eq!(config, Config::default());
        assert!(!config.thread_instrumentation_init());
        assert!(!config.enable_instrumentation());
        assert!(config.report_at_exit());
        assert_eq!(config.palette(), Palette::Box);
        assert_eq!(config.bins().get(), 15);
    }

    #[test]
    fn recognized_values_are_applied() {
        let (config, problems) = config_from(&[
            (THREAD_INSTRUMENTATION_INIT_KEY, "1"),
            (ENABLE_INSTRUMENTATION_KEY, "true"),
            (REPORT_AT_EXIT_KEY, "0"),
            (HISTOGRAM_REPRESENTATION_KEY, "wire"),
            (BINS_KEY, "4"),
        ]);

        assert!(problems.is_empty());
        assert!(config.thread_instrumentation_init());
        assert!(config.enable_instrumentation());
        assert!(!config.report_at_exit());
        assert_eq!(config.palette(), Palette::Wire);
        assert_eq!(config.bins().get(), 4);
    }

    #[test]
    fn unrecognized_values_fall_back_to_defaults() {
        let (config, problems) = config_from(&[
            (THREAD_INSTRUMENTATION_INIT_KEY, "yes"),
            (ENABLE_INSTRUMENTATION_KEY, "TRUE"),
            (REPORT_AT_EXIT_KEY, ""),
            (HISTOGRAM_REPRESENTATION_KEY, "sparkles"),
            (BINS_KEY, "0"),
        ]);

        assert_eq!(config, Config::default());
        assert_eq!(problems.len(), 5);

        let messages: Vec<_> = problems.iter().map(ToString::to_string).collect();
        assert!(messages.contains(
            &"Option 'MEMSTATS_REPORT_AT_EXIT=' not known. Fallback on default 'true'".to_string()
        ));
        assert!(messages.contains(
            &"Option 'MEMSTATS_BINS=0' not known. Fallback on default '15'".to_string()
        ));
        assert!(messages.contains(
            &"Option 'MEMSTATS_HISTOGRAM_REPRESENTATION=sparkles' not known. Fallback on default 'box'"
                .to_string()
        ));
    }

    #[test]
    fn problems_are_written_one_per_line() {
        let values: HashMap<&str, &[u8]> =
            HashMap::from([(BINS_KEY, &b"many"[..]), (REPORT_AT_EXIT_KEY, &b"yes"[..])]);
        let mut diagnostics = Vec::new();

        let config =
            Config::from_lookup_reporting(|key| values.get(key).copied(), &mut diagnostics);

        assert_eq!(config, Config::default());

        let text = String::from_utf8(diagnostics).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("Option 'MEMSTATS_BINS=many' not known. Fallback on default '15'"));
    }

    #[test]
    fn problems_written_to_closed_output_are_dropped() {
        let config = Config::from_lookup_reporting(
            |key| (key == BINS_KEY).then_some(&b"0"[..]),
            &mut BrokenPipe,
        );

        assert_eq!(config.bins().get(), 15);
    }

    #[test]
    fn resolve_keeps_parsed_value_or_falls_back() {
        let mut problems = Vec::new();

        assert_eq!(resolve(Some(Ok(3_u8)), 1, &mut problems), 3);
        assert_eq!(resolve(None, 1_u8, &mut problems), 1);
        assert!(problems.is_empty());

        let rejected = parse_bins("lots").map(NonZero::get);
        assert_eq!(resolve(Some(rejected), 15, &mut problems), 15);
        assert_eq!(problems.len(), 1);
    }

    #[test]
    fn bins_must_fit_u16() {
        let (config, problems) = config_from(&[(BINS_KEY, "70000")]);

        assert_eq!(config.bins().get(), 15);
        assert_eq!(problems.len(), 1);
    }

    #[test]
    fn invalid_utf8_is_unrecognized() {
        let (config, problems) = Config::from_lookup(|key| {
            (key == HISTOGRAM_REPRESENTATION_KEY).then_some(&[0xff_u8, 0xfe][..])
        });

        assert_eq!(config.palette(), Palette::Box);
        assert!(matches!(
            problems.as_slice(),
            [Error::UnrecognizedOption { key: HISTOGRAM_REPRESENTATION_KEY, .. }]
        ));
    }

    #[test]
    fn env_lookup_reads_process_environment() {
        // PATH is present in every environment the tests run in.
        assert!(env_lookup("PATH").is_some());
        assert!(env_lookup("MEMSTATS_VARIABLE_THAT_IS_NEVER_SET").is_none());
    }

    #[test]
    fn env_lookup_rejects_oversized_key() {
        let key: &'static str = "MEMSTATS_KEY_THAT_IS_WAY_TOO_LONG_TO_FIT_INTO_THE_LOOKUP_BUFFER_X";
        assert!(key.len() >= KEY_BUFFER_LEN);
        assert!(env_lookup(key).is_none());
    }
}
