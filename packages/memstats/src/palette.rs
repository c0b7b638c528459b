use std::fmt::{self, Display, Write};
use std::str::FromStr;

use crate::Error;

/// The set of glyphs used to draw histogram bins in a report.
///
/// Each palette lists its glyphs from the lowest to the highest share of the bucket's
/// largest bin. A bin is drawn with the glyph whose share range contains the bin's count.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Palette {
    /// `" .:!"`
    Punctuation,

    /// `" .oO"`
    Circle,

    /// `" ░▒▓█"`
    Shadow,

    /// `" -~=#"`
    Wire,

    /// `" ▁▂▃▄▅▆▇█"`
    #[default]
    Box,

    /// `"0123456789"`
    Number,
}

const PUNCTUATION: &[&str] = &[" ", ".", ":", "!"];
const CIRCLE: &[&str] = &[" ", ".", "o", "O"];
const SHADOW: &[&str] = &[" ", "░", "▒", "▓", "█"];
const WIRE: &[&str] = &[" ", "-", "~", "=", "#"];
const BOX: &[&str] = &[" ", "▁", "▂", "▃", "▄", "▅", "▆", "▇", "█"];
const NUMBER: &[&str] = &["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];

impl Palette {
    /// All palettes, in the order they are documented.
    pub const ALL: [Self; 6] = [
        Self::Punctuation,
        Self::Circle,
        Self::Shadow,
        Self::Wire,
        Self::Box,
        Self::Number,
    ];

    /// The name used to select this palette via configuration.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Punctuation => "punctuation",
            Self::Circle => "circle",
            Self::Shadow => "shadow",
            Self::Wire => "wire",
            Self::Box => "box",
            Self::Number => "number",
        }
    }

    /// The glyphs of this palette, from the lowest to the highest share.
    #[must_use]
    pub const fn glyphs(self) -> &'static [&'static str] {
        match self {
            Self::Punctuation => PUNCTUATION,
            Self::Circle => CIRCLE,
            Self::Shadow => SHADOW,
            Self::Wire => WIRE,
            Self::Box => BOX,
            Self::Number => NUMBER,
        }
    }

    /// Selects the glyph for a bin holding `bin_count` entries when the largest bin of the
    /// same bucket holds `largest_bin_count` entries.
    ///
    /// The largest bin maps one step past the last glyph, so the index is clamped to it.
    /// An empty bucket (largest count of zero) draws every bin with the first glyph.
    #[must_use]
    pub fn glyph(self, bin_count: u64, largest_bin_count: u64) -> &'static str {
        let glyphs = self.glyphs();
        let levels = glyphs.len() as u64;

        let index = bin_count
            .saturating_mul(levels)
            .checked_div(largest_bin_count)
            .unwrap_or(0)
            .min(levels.saturating_sub(1));

        usize::try_from(index)
            .ok()
            .and_then(|index| glyphs.get(index))
            .copied()
            .unwrap_or(" ")
    }

    /// Writes the glyph-to-share mapping of this palette, one line per glyph.
    ///
    /// ```text
    /// • ' ' -> [ 0.0%,  11.1%)
    /// • '▁' -> [11.1%,  22.2%)
    /// ```
    pub fn write_legend(self, f: &mut impl Write) -> fmt::Result {
        let glyphs = self.glyphs();
        let share_per_glyph = 100.0 / glyphs.len() as f64;

        for (index, glyph) in (0_u32..).zip(glyphs) {
            let lower = f64::from(index) * share_per_glyph;
            let upper = f64::from(index + 1) * share_per_glyph;
            let closing = if index as usize + 1 == glyphs.len() {
                ']'
            } else {
                ')'
            };

            writeln!(f, "• '{glyph}' -> [{lower:4.1}%, {upper:5.1}%{closing}")?;
        }

        Ok(())
    }
}

impl Display for Palette {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Palette {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|palette| palette.name() == s)
            .ok_or_else(|| Error::UnrecognizedOption {
                key: crate::config::HISTOGRAM_REPRESENTATION_KEY,
                value: s.to_owned(),
                fallback: Self::default().name(),
            })
    }
}
