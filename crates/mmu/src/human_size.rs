//! Human-readable byte counts for log messages.

use core::fmt;

/// Formats a byte count with binary prefixes, e.g. `4KiB`, `1.5MiB`, `31MiB`.
///
/// Values are truncated to one decimal place using integer arithmetic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        let mut unit = 0;
        let mut scale = 1usize;
        while unit + 1 < UNITS.len() && self.0 / scale >= 1024 {
            scale *= 1024;
            unit += 1;
        }

        let whole = self.0 / scale;
        let tenths = match scale {
            1 => 0,
            _ => ((self.0 % scale) / (scale / 10)).min(9),
        };
        if tenths == 0 {
            write!(f, "{whole}{}", UNITS[unit])
        } else {
            write!(f, "{whole}.{tenths}{}", UNITS[unit])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_units() {
        assert_eq!(HumanSize(0).to_string(), "0B");
        assert_eq!(HumanSize(1023).to_string(), "1023B");
        assert_eq!(HumanSize(4096).to_string(), "4KiB");
        assert_eq!(HumanSize(0x20_0000).to_string(), "2MiB");
        assert_eq!(HumanSize(0x4000_0000).to_string(), "1GiB");
    }

    #[test]
    fn fractional_units() {
        assert_eq!(HumanSize(1536).to_string(), "1.5KiB");
        assert_eq!(HumanSize(0x1F0_0000).to_string(), "31MiB");
        assert_eq!(HumanSize(0x18_0000).to_string(), "1.5MiB");
    }

    #[test]
    fn largest_value() {
        assert_eq!(HumanSize(usize::MAX).to_string(), "15.9EiB");
    }
}
