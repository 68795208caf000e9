use std::{
    fmt,
    time::Duration,
};

use number_prefix::NumberPrefix;

/// Size in base 2 units.
#[derive(Debug)]
pub struct BinarySize(pub u64);

impl fmt::Display for BinarySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NumberPrefix::binary(self.0 as f64) {
            NumberPrefix::Standalone(number) => write!(f, "{number:.0}B"),
            NumberPrefix::Prefixed(prefix, number) => write!(f, "{number:.2}{prefix}B"),
        }
    }
}

/// Plain count in base 10 units, eg. candidate versions tried.
#[derive(Debug)]
pub struct DecimalCount(pub u64);

impl fmt::Display for DecimalCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NumberPrefix::decimal(self.0 as f64) {
            NumberPrefix::Standalone(number) => write!(f, "{number:.0}"),
            NumberPrefix::Prefixed(prefix, number) => {
                // Lowercase k is the SI symbol, but K reads better next to M and G
                let symbol = prefix.symbol().to_ascii_uppercase();
                write!(f, "{number:.2}{symbol}")
            }
        }
    }
}

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

/// Duration rounded to its two most significant units, eg. `3d 4h`.
#[derive(Debug)]
pub struct HumanDuration(pub Duration);

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        let units = [
            (secs / SECS_PER_DAY, "d"),
            (secs % SECS_PER_DAY / SECS_PER_HOUR, "h"),
            (secs % SECS_PER_HOUR / SECS_PER_MINUTE, "m"),
            (secs % SECS_PER_MINUTE, "s"),
        ];

        let Some(first) = units.iter().position(|(v, _)| *v > 0) else {
            return f.write_str("0s");
        };

        let mut wrote = false;
        for (value, abbrev) in units[first..].iter().take(2) {
            if *value == 0 {
                continue;
            }
            if wrote {
                f.write_str(" ")?;
            }
            write!(f, "{value}{abbrev}")?;
            wrote = true;
        }

        Ok(())
    }
}

/// Duration as `HH:MM:SS`. Hours are not wrapped into days.
#[derive(Debug)]
pub struct ClockDuration(pub Duration);

impl fmt::Display for ClockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();

        write!(
            f,
            "{:02}:{:02}:{:02}",
            secs / SECS_PER_HOUR,
            secs % SECS_PER_HOUR / SECS_PER_MINUTE,
            secs % SECS_PER_MINUTE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_size() {
        assert_eq!(BinarySize(0).to_string(), "0B");
        assert_eq!(BinarySize(1023).to_string(), "1023B");
        assert_eq!(BinarySize(1536).to_string(), "1.50KiB");
        assert_eq!(BinarySize(5 * 1024 * 1024 * 1024).to_string(), "5.00GiB");
    }

    #[test]
    fn test_decimal_count() {
        assert_eq!(DecimalCount(0).to_string(), "0");
        assert_eq!(DecimalCount(999).to_string(), "999");
        assert_eq!(DecimalCount(1500).to_string(), "1.50K");
        assert_eq!(DecimalCount(12_345_678).to_string(), "12.35M");
        assert_eq!(DecimalCount(3_000_000_000).to_string(), "3.00G");
    }

    #[test]
    fn test_human_duration() {
        let test_cases = [
            (0, "0s"),
            (59, "59s"),
            (61, "1m 1s"),
            (3600, "1h"),
            (3661, "1h 1m"),
            (90061, "1d 1h"),
            (86400 + 59, "1d"),
            (30 * 86400 + 7200, "30d 2h"),
        ];

        for (secs, expected) in test_cases {
            assert_eq!(HumanDuration(Duration::from_secs(secs)).to_string(), expected, "{secs}s");
        }
    }

    #[test]
    fn test_clock_duration() {
        let test_cases = [
            (0, "00:00:00"),
            (61, "00:01:01"),
            (3661, "01:01:01"),
            (100 * 3600, "100:00:00"),
        ];

        for (secs, expected) in test_cases {
            assert_eq!(ClockDuration(Duration::from_secs(secs)).to_string(), expected);
        }

        // Subsecond precision is dropped
        assert_eq!(ClockDuration(Duration::new(1, 999_999_999)).to_string(), "00:00:01");
    }
}
