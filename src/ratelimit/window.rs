//! Rate limit window parsing.
//!
//! Windows are written the way operators think about them: `"1 m"`,
//! `"15 m"`, `"1 h"`, `"30s"`. A malformed window never fails a request; it
//! degrades to [`DEFAULT_WINDOW_SECS`] and logs a warning.

use std::time::Duration;
use tracing::warn;

/// Window used when a configured window string cannot be parsed.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Time unit suffix of a window string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowUnit {
    /// `s`
    Second,
    /// `m`
    Minute,
    /// `h`
    Hour,
    /// `d`
    Day,
}

impl WindowUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            WindowUnit::Second => Duration::from_secs(1),
            WindowUnit::Minute => Duration::from_secs(60),
            WindowUnit::Hour => Duration::from_secs(3600),
            WindowUnit::Day => Duration::from_secs(86400),
        }
    }

    /// Parse a unit suffix.
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "s" => Some(WindowUnit::Second),
            "m" => Some(WindowUnit::Minute),
            "h" => Some(WindowUnit::Hour),
            "d" => Some(WindowUnit::Day),
            _ => None,
        }
    }
}

/// Parse `<integer><unit>` (whitespace allowed between the two) into seconds.
///
/// Returns `None` for anything else, including zero-length windows and values
/// that overflow.
pub fn try_parse_window(window: &str) -> Option<u64> {
    let window = window.trim();
    let split = window.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = window.split_at(split);

    if amount.is_empty() {
        return None;
    }

    let amount: u64 = amount.parse().ok()?;
    let unit = WindowUnit::from_suffix(unit.trim_start())?;
    let secs = amount.checked_mul(unit.duration().as_secs())?;

    (secs > 0).then_some(secs)
}

/// Parse a window string into seconds, falling back to [`DEFAULT_WINDOW_SECS`].
pub fn parse_window(window: &str) -> u64 {
    match try_parse_window(window) {
        Some(secs) => secs,
        None => {
            warn!(
                window = %window,
                default_secs = DEFAULT_WINDOW_SECS,
                "Invalid rate limit window, using default"
            );
            DEFAULT_WINDOW_SECS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_duration() {
        assert_eq!(WindowUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(WindowUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(WindowUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(WindowUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_with_and_without_space() {
        assert_eq!(parse_window("1 m"), 60);
        assert_eq!(parse_window("1m"), 60);
        assert_eq!(parse_window("15 m"), 900);
        assert_eq!(parse_window("1 h"), 3600);
        assert_eq!(parse_window("30s"), 30);
        assert_eq!(parse_window("2 d"), 172_800);
        assert_eq!(parse_window("  5   s  "), 5);
    }

    #[test]
    fn test_malformed_falls_back_to_default() {
        for bad in [
            "", " ", "m", "1", "1 x", "one m", "-1 m", "1.5 m", "1 mm", "0 m", "1 M",
            "99999999999999999999 s", "18446744073709551615 d",
        ] {
            assert_eq!(try_parse_window(bad), None, "{bad:?} should be rejected");
            assert_eq!(parse_window(bad), DEFAULT_WINDOW_SECS);
        }
    }

    #[test]
    fn test_arbitrary_bytes_never_panic() {
        let inputs = ["\u{0}", "1\u{200b}m", "١ m", "1 🙂", "\n\n", "1 m 2 m"];
        for input in inputs {
            let _ = parse_window(input);
        }
    }
}
