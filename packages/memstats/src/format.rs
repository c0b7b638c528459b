//! Compact magnitude formatting for report columns.

use crate::{Error, Result};

/// Prefixes for increasing magnitudes. The first entry is the unprefixed magnitude.
const METRIC_PREFIXES: [char; 11] = [' ', 'k', 'M', 'G', 'T', 'P', 'E', 'Z', 'Y', 'R', 'Q'];

/// Each byte prefix step is a factor of 1024 (2^10).
const BYTE_STEP_BITS: u32 = 10;

/// Each count prefix step is a factor of 1000 (10^3).
const COUNT_STEP_DIGITS: u32 = 3;

/// Formats a number of bytes as a truncated value, a base-1024 prefix and the `B` unit.
///
/// `10` becomes `"10 B"`, `2560` becomes `"2kB"`.
pub(crate) fn bytes_to_string(bytes: u128) -> Result<String> {
    let base = bytes.checked_ilog2().unwrap_or(0) / BYTE_STEP_BITS;
    let prefix = prefix_for(base, bytes)?;

    let scaled = bytes >> (base * BYTE_STEP_BITS);

    Ok(format!("{scaled}{prefix}B"))
}

/// Formats a count as a truncated value followed by a base-1000 prefix.
///
/// `10` becomes `"10 "`, `25_000` becomes `"25k"`.
pub(crate) fn count_to_string(count: u128) -> Result<String> {
    let base = count.checked_ilog10().unwrap_or(0) / COUNT_STEP_DIGITS;
    let prefix = prefix_for(base, count)?;

    #[expect(
        clippy::integer_division,
        reason = "truncation to the leading digits is the intended rendering"
    )]
    let scaled = count / 1000_u128.pow(base);

    Ok(format!("{scaled}{prefix}"))
}

fn prefix_for(base: u32, value: u128) -> Result<char> {
    usize::try_from(base)
        .ok()
        .and_then(|index| METRIC_PREFIXES.get(index))
        .copied()
        .ok_or(Error::MagnitudeOverflow { value })
}
