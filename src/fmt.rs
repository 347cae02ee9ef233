//! Provides parsing and formatting helpers for durations and byte sizes.
//!
//! The configuration permits to specify cache budgets ("64m") and liveness intervals
//! ("5m") as human readable literals, which are parsed here. The formatting counterparts
//! are used when reporting metrics and when rendering timeout errors on the wire.
use std::fmt::Write;
use std::time::Duration;

/// Formats a duration given in microseconds.
///
/// This function determines the ideal unit (ranging from microseconds to seconds) to
/// provide a concise representation.
///
/// Note that a helper function [format_short_duration](format_short_duration) is also
/// provided which directly returns a String.
pub fn format_micros(micros: i32, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    if micros < 1_000 {
        write!(f, "{} us", micros)
    } else if micros < 10_000 {
        write!(f, "{:.2} ms", micros as f32 / 1_000.)
    } else if micros < 100_000 {
        write!(f, "{:.1} ms", micros as f32 / 1_000.)
    } else if micros < 1_000_000 {
        write!(f, "{} ms", micros / 1_000)
    } else if micros < 10_000_000 {
        write!(f, "{:.2} s", micros as f32 / 1_000_000.)
    } else if micros < 100_000_000 {
        write!(f, "{:.1} s", micros as f32 / 1_000_000.)
    } else {
        write!(f, "{} s", micros / 1_000_000)
    }
}

/// Formats a duration given in microseconds and returns a String representation.
///
/// # Examples
///
/// ```
/// assert_eq!(ganymede::fmt::format_short_duration(100), "100 us");
/// assert_eq!(ganymede::fmt::format_short_duration(8_192), "8.19 ms");
/// assert_eq!(ganymede::fmt::format_short_duration(128_123), "128 ms");
/// assert_eq!(ganymede::fmt::format_short_duration(1_128_123), "1.13 s");
/// ```
pub fn format_short_duration(duration_in_micros: i32) -> String {
    let mut result = String::new();
    let _ = format_micros(duration_in_micros, &mut result);
    result
}

/// Formats a given size in bytes.
///
/// This function determines the ideal unit (ranging from bytes to petabytes) to provide
/// a concise representation.
///
/// # Examples
///
/// ```
/// assert_eq!(ganymede::fmt::format_size(0), "0 bytes");
/// assert_eq!(ganymede::fmt::format_size(1), "1 byte");
/// assert_eq!(ganymede::fmt::format_size(100), "100 bytes");
/// assert_eq!(ganymede::fmt::format_size(8_734), "8.53 KiB");
/// assert_eq!(ganymede::fmt::format_size(8_734_000), "8.33 MiB");
/// assert_eq!(ganymede::fmt::format_size(8_734_000_000), "8.13 GiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    let mut result = String::new();

    if size_in_bytes == 1 {
        let _ = write!(result, "1 byte");
        return result;
    } else if size_in_bytes < 1024 {
        let _ = write!(result, "{} bytes", size_in_bytes);
        return result;
    }

    let mut magnitude = 0;
    let mut size = size_in_bytes as f32;
    while size > 1024. && magnitude < 5 {
        size /= 1024.;
        magnitude += 1;
    }

    if size <= 10. {
        let _ = write!(result, "{:.2} ", size);
    } else if size <= 100. {
        let _ = write!(result, "{:.1} ", size);
    } else {
        let _ = write!(result, "{:.0} ", size);
    }

    let _ = match magnitude {
        0 => write!(result, "Bytes"),
        1 => write!(result, "KiB"),
        2 => write!(result, "MiB"),
        3 => write!(result, "GiB"),
        4 => write!(result, "TiB"),
        _ => write!(result, "PiB"),
    };

    result
}

/// Parses a byte size from a given string.
///
/// This string can have the following suffixes:
/// * **k** or **K**: multiplies the given value by 1024 thus treats the value as KiB
/// * **m** or **M**: treats the value as MiB
/// * **g** or **G**: treats the value as GiB
/// * **t** or **T**: treats the value as TiB
///
/// Returns an **Err** if either a non-integer value is given or if an unknown suffix
/// was provided.
///
/// # Examples
///
/// ```
/// assert_eq!(ganymede::fmt::parse_size("100").unwrap(), 100);
/// assert_eq!(ganymede::fmt::parse_size("8k").unwrap(), 8192);
/// assert_eq!(ganymede::fmt::parse_size("8m").unwrap(), 8 * 1024 * 1024);
/// assert_eq!(ganymede::fmt::parse_size("4 G").unwrap(), 4 * 1024 * 1024 * 1024);
///
/// // An invalid suffix results in an error...
/// assert_eq!(ganymede::fmt::parse_size("3 Y").is_err(), true);
///
/// // Decimal and negative numbers result in an error...
/// assert_eq!(ganymede::fmt::parse_size("1.2g").is_err(), true);
/// assert_eq!(ganymede::fmt::parse_size("-1").is_err(), true);
/// ```
pub fn parse_size(str: impl AsRef<str>) -> anyhow::Result<usize> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_SUFFIX: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *([bBkKmMgGtT]?) *$").unwrap();
    }

    match NUMBER_AND_SUFFIX.captures(str.as_ref()) {
        Some(captures) => {
            let number = captures[1].parse::<usize>().unwrap();
            match &captures[2] {
                "k" | "K" => Ok(number * 1024),
                "m" | "M" => Ok(number * 1024 * 1024),
                "g" | "G" => Ok(number * 1024 * 1024 * 1024),
                "t" | "T" => Ok(number * 1024 * 1024 * 1024 * 1024),
                _ => Ok(number),
            }
        }
        None => Err(anyhow::anyhow!(
            "Cannot parse '{}' into a size expression. \
             Expected a positive number and optionally 'b', 'k', 'm', 'g' or 't' as suffix.",
            str.as_ref()
        )),
    }
}

/// Parses a duration from a given string.
///
/// This string can have the following suffixes:
/// * **ms** or **MS**: treats the value as milliseconds
/// * **s** or **S**: treats the value as seconds
/// * **m** or **M**: treats the value as minutes
/// * **h** or **H**: treats the value as hours
/// * **d** or **D**: treats the value as days
///
/// Returns an **Err** if either a non-integer value is given or if an unknown suffix
/// was provided.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(ganymede::fmt::parse_duration("100 ms").unwrap(), Duration::from_millis(100));
/// assert_eq!(ganymede::fmt::parse_duration("12 s").unwrap(), Duration::from_secs(12));
/// assert_eq!(ganymede::fmt::parse_duration("3 M").unwrap(), Duration::from_secs(3 * 60));
/// assert_eq!(ganymede::fmt::parse_duration("2 H").unwrap(), Duration::from_secs(2 * 60 * 60));
///
/// // An invalid suffix results in an error...
/// assert_eq!(ganymede::fmt::parse_duration("3 Y").is_err(), true);
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_SUFFIX: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *((ms|s|m|h|d|MS|S|M|H|D)?) *$").unwrap();
    }

    match NUMBER_AND_SUFFIX.captures(str.as_ref()) {
        Some(captures) => {
            let number = captures[1].parse::<u64>().unwrap();
            match &captures[2] {
                "s" | "S" => Ok(Duration::from_secs(number)),
                "m" | "M" => Ok(Duration::from_secs(number * 60)),
                "h" | "H" => Ok(Duration::from_secs(number * 60 * 60)),
                "d" | "D" => Ok(Duration::from_secs(number * 60 * 60 * 24)),
                _ => Ok(Duration::from_millis(number)),
            }
        }
        None => Err(anyhow::anyhow!(
            "Cannot parse '{}' into a duration expression. \
             Expected a positive number and optionally 'ms', 's', 'm', 'h' or 'd' as suffix.",
            str.as_ref()
        )),
    }
}

/// Formats a duration into a string like "5d 3h 17m 2s 12ms".
///
/// This is the format used when reporting handle timeouts on the wire, therefore
/// "short" durations like 50ms render without any padding or larger units.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(ganymede::fmt::format_duration(Duration::from_millis(50)), "50ms");
/// assert_eq!(ganymede::fmt::format_duration(Duration::from_millis(1013)), "1s 13ms");
/// assert_eq!(ganymede::fmt::format_duration(Duration::from_secs(60 * 32 + 13)), "32m 13s");
/// assert_eq!(ganymede::fmt::format_duration(Duration::from_secs(4 * 60 * 60)), "4h");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let mut result = String::new();

    let mut value = duration.as_millis();
    {
        let days = value / (1000 * 60 * 60 * 24);
        if days > 0 {
            let _ = write!(result, "{}d", days);
            value %= 1000 * 60 * 60 * 24;
        }
    }
    {
        let hours = value / (1000 * 60 * 60);
        if hours > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}h", hours);
            value %= 1000 * 60 * 60;
        }
    }
    {
        let minutes = value / (1000 * 60);
        if minutes > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}m", minutes);
            value %= 1000 * 60;
        }
    }
    {
        let seconds = value / 1000;
        if seconds > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}s", seconds);
            value %= 1000;
        }
    }
    if value > 0 {
        if !result.is_empty() {
            result.push(' ');
        }
        let _ = write!(result, "{}ms", value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_parsed_with_all_known_suffixes() {
        assert_eq!(parse_size("42").unwrap(), 42);
        assert_eq!(parse_size("42b").unwrap(), 42);
        assert_eq!(parse_size("2K").unwrap(), 2048);
        assert_eq!(parse_size("1 t").unwrap(), 1024 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("one meg").is_err(), true);
    }

    #[test]
    fn durations_are_parsed_with_all_known_suffixes() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5 m").unwrap(), Duration::from_secs(300));
        assert_eq!(
            parse_duration("1D").unwrap(),
            Duration::from_secs(24 * 60 * 60)
        );
        assert_eq!(parse_duration("soon").is_err(), true);
    }

    #[test]
    fn wire_timeout_format_is_stable() {
        // The handle timeout error message embeds this representation, therefore it
        // must not change between releases.
        assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
        assert_eq!(format_duration(Duration::from_secs(10)), "10s");
    }
}
