//! Configuration value parsers shared by filters and plugins.
//!
//! Layers receive their configuration as `key=value` string pairs routed
//! through the chain builder; the helpers here turn the value strings into
//! sizes, booleans, probabilities and integers with uniform error
//! reporting.

use thiserror::Error;

/// Errors produced while parsing configuration values or applying
/// configuration keys.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The size string has no parseable digits.
    #[error("could not parse size string: {0:?}")]
    InvalidSize(String),

    /// The size string is negative.
    #[error("size cannot be negative: {0:?}")]
    NegativeSize(String),

    /// The size (or size times scale) overflows a signed 64-bit value.
    #[error("size exceeds maximum value: {0:?}")]
    SizeOverflow(String),

    /// The size carries a suffix that is not one of the known scales.
    #[error("could not parse size, unknown suffix: {0:?}")]
    UnknownSuffix(String),

    /// The value is not a recognized boolean spelling.
    #[error("could not parse boolean: {0:?}")]
    InvalidBool(String),

    /// The value is not a number, percentage or ratio.
    #[error("{key}: could not parse probability: {value:?}")]
    InvalidProbability {
        /// The configuration key being parsed.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// The value is not an unsigned number of the expected width.
    #[error("{key}: could not parse number: {value:?}")]
    InvalidNumber {
        /// The configuration key being parsed.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// No layer in the chain recognized the configuration key.
    #[error("unknown parameter: {0:?}")]
    UnknownKey(String),

    /// A free-form configuration error reported by a layer.
    #[error("{0}")]
    Invalid(String),
}

/// Result alias for configuration parsing.
pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    /// A free-form configuration error.
    pub fn invalid(msg: impl Into<String>) -> ConfigError {
        ConfigError::Invalid(msg.into())
    }
}

/// Parse a string with a possible scaling suffix, such as `"2M"`.
///
/// Suffixes: `b`/`B` (bytes), `s`/`S` (512-byte sectors), and the powers of
/// 1024 `k m g t p e` in either case.  Disk sizes cannot usefully exceed a
/// signed 64-bit value and cannot be negative.  No fractional values, no
/// hex, no `MiB`/`MB` distinction.
pub fn human_size_parse(s: &str) -> ConfigResult<u64> {
    let bytes = s.as_bytes();
    let mut i = 0;

    // Integer parsing skips leading whitespace and accepts a sign.
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let mut negative = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        negative = bytes[i] == b'-';
        i += 1;
    }

    let digits_start = i;
    let mut value: i64 = 0;
    let mut overflowed = false;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        let d = i64::from(bytes[i] - b'0');
        match value.checked_mul(10).and_then(|v| v.checked_add(d)) {
            Some(v) => value = v,
            None => overflowed = true,
        }
        i += 1;
    }
    if i == digits_start {
        return Err(ConfigError::InvalidSize(s.to_string()));
    }
    if negative && (value != 0 || overflowed) {
        return Err(ConfigError::NegativeSize(s.to_string()));
    }
    if overflowed {
        return Err(ConfigError::SizeOverflow(s.to_string()));
    }

    let suffix = &s[i..];
    let scale: u64 = match suffix {
        "" => 1,
        "b" | "B" => 1,
        "s" | "S" => 512,
        "k" | "K" => 1 << 10,
        "m" | "M" => 1 << 20,
        "g" | "G" => 1 << 30,
        "t" | "T" => 1 << 40,
        "p" | "P" => 1 << 50,
        "e" | "E" => 1 << 60,
        _ => return Err(ConfigError::UnknownSuffix(s.to_string())),
    };

    let value = value as u64;
    if (i64::MAX as u64) / scale < value {
        return Err(ConfigError::SizeOverflow(s.to_string()));
    }
    Ok(value * scale)
}

/// Parse a boolean configuration value.
///
/// Accepts `1 true t yes y on` and `0 false f no n off`, case-insensitive.
pub fn parse_bool(value: &str) -> ConfigResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool(value.to_string())),
    }
}

/// Parse a probability: a plain number, `N%`, or a ratio `N/M` or `N:M`.
pub fn parse_probability(key: &str, value: &str) -> ConfigResult<f64> {
    let err = || ConfigError::InvalidProbability {
        key: key.to_string(),
        value: value.to_string(),
    };

    if let Some(pct) = value.strip_suffix('%') {
        let n: f64 = pct.trim().parse().map_err(|_| err())?;
        return Ok(n / 100.0);
    }
    if let Some((n, d)) = value.split_once(['/', ':']) {
        let n: f64 = n.trim().parse().map_err(|_| err())?;
        let d: f64 = d.trim().parse().map_err(|_| err())?;
        if d == 0.0 {
            return Err(err());
        }
        return Ok(n / d);
    }
    let p: f64 = value.parse().map_err(|_| err())?;
    if p < 0.0 {
        return Err(err());
    }
    Ok(p)
}

/// Parse an unsigned decimal configuration value.
pub fn parse_unsigned(key: &str, value: &str) -> ConfigResult<u32> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidNumber {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parse a `u8`, decimal or `0x` hex (useful for byte patterns).
pub fn parse_u8(key: &str, value: &str) -> ConfigResult<u8> {
    let err = || ConfigError::InvalidNumber {
        key: key.to_string(),
        value: value.to_string(),
    };
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).map_err(|_| err())
    } else {
        value.parse::<u8>().map_err(|_| err())
    }
}

/// Is `v` a power of 2?  Zero is not.
pub fn is_power_of_2(v: u64) -> bool {
    v != 0 && v & (v - 1) == 0
}

/// log2 of a power of two, i.e. the equivalent bit shift.
///
/// Undefined for zero; the input must be a power of 2.
pub fn log_2_bits(v: u64) -> u32 {
    63 - v.leading_zeros()
}

/// Round up to the next power of 2.
///
/// `i64::MIN` reinterprets as `2^63` and returns itself; any other negative
/// value returns the `u64::MAX` error sentinel.
pub fn next_power_of_2(x: i64) -> u64 {
    if x as u64 == 0x8000_0000_0000_0000 {
        0x8000_0000_0000_0000
    } else if x < 0 {
        u64::MAX
    } else if x <= 1 {
        1
    } else {
        (x as u64).next_power_of_two()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The reference table: every accepted string with its value, and every
    // rejected string.
    const VALID: &[(&str, u64)] = &[
        ("-0", 0),
        ("0", 0),
        ("+0", 0),
        (" 08", 8),
        ("1", 1),
        ("+1", 1),
        ("1234567890", 1234567890),
        ("+1234567890", 1234567890),
        ("9223372036854775807", i64::MAX as u64),
        ("1s", 512),
        ("2S", 1024),
        ("1b", 1),
        ("1B", 1),
        ("1k", 1 << 10),
        ("1K", 1 << 10),
        ("1m", 1 << 20),
        ("1M", 1 << 20),
        ("+1M", 1 << 20),
        ("1g", 1 << 30),
        ("1G", 1 << 30),
        ("1t", 1 << 40),
        ("1T", 1 << 40),
        ("1p", 1 << 50),
        ("1P", 1 << 50),
        ("8191p", 8191 << 50),
        ("1e", 1 << 60),
        ("1E", 1 << 60),
    ];

    const INVALID: &[&str] = &[
        "",
        "0x0",
        "garbage",
        "0garbage",
        "8E",
        "8192P",
        "9223372036854775808",
        "18446744073709551614",
        "18446744073709551615",
        "18446744073709551616",
        "999999999999999999999999",
        "-1",
        "-2",
        "-9223372036854775809",
        "-9223372036854775808",
        "-9223372036854775807",
        "-18446744073709551616",
        "-18446744073709551615",
        "-18446744073709551614",
        "M",
        "1MB",
        "1MiB",
        "1.5M",
    ];

    #[test]
    fn human_size_reference_table() {
        for &(s, v) in VALID {
            assert_eq!(human_size_parse(s).unwrap(), v, "parsing {:?}", s);
        }
        for &s in INVALID {
            assert!(human_size_parse(s).is_err(), "should reject {:?}", s);
        }
    }

    #[test]
    fn human_size_seed_cases() {
        assert_eq!(human_size_parse("1M").unwrap(), 1_048_576);
        assert_eq!(human_size_parse("1s").unwrap(), 512);
        assert!(human_size_parse("8E").is_err());
        assert!(human_size_parse("-1").is_err());
    }

    #[test]
    fn next_power_of_2_seed_cases() {
        assert_eq!(next_power_of_2(0), 1);
        assert_eq!(next_power_of_2(1), 1);
        assert_eq!(next_power_of_2(3), 4);
        assert_eq!(next_power_of_2(0x7_0000_0001), 0x8_0000_0000);
        assert_eq!(next_power_of_2(i64::MIN), 0x8000_0000_0000_0000);
        assert_eq!(next_power_of_2(-1), u64::MAX);
    }

    #[test]
    fn power_of_2_helpers() {
        assert!(is_power_of_2(1));
        assert!(is_power_of_2(512));
        assert!(!is_power_of_2(0));
        assert!(!is_power_of_2(3));
        assert_eq!(log_2_bits(512), 9);
        assert_eq!(log_2_bits(1), 0);
        assert_eq!(log_2_bits(1 << 21), 21);
    }

    #[test]
    fn bool_values() {
        for v in ["1", "true", "T", "yes", "Y", "on", "ON"] {
            assert_eq!(parse_bool(v).unwrap(), true, "{:?}", v);
        }
        for v in ["0", "false", "F", "no", "N", "off"] {
            assert_eq!(parse_bool(v).unwrap(), false, "{:?}", v);
        }
        assert!(parse_bool("maybe").is_err());
        assert!(parse_bool("").is_err());
    }

    #[test]
    fn probability_forms() {
        assert_eq!(parse_probability("p", "0.5").unwrap(), 0.5);
        assert_eq!(parse_probability("p", "10%").unwrap(), 0.1);
        assert_eq!(parse_probability("p", "1/4").unwrap(), 0.25);
        assert_eq!(parse_probability("p", "1:4").unwrap(), 0.25);
        assert!(parse_probability("p", "1/0").is_err());
        assert!(parse_probability("p", "nope").is_err());
    }

    #[test]
    fn u8_hex_and_decimal() {
        assert_eq!(parse_u8("byte", "255").unwrap(), 0xff);
        assert_eq!(parse_u8("byte", "0xFF").unwrap(), 0xff);
        assert!(parse_u8("byte", "256").is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn human_size_never_panics(s in "\\PC*") {
                let _ = human_size_parse(&s);
            }

            #[test]
            fn plain_decimal_round_trips(v in 0i64..=i64::MAX) {
                prop_assert_eq!(human_size_parse(&v.to_string()).unwrap(), v as u64);
            }

            #[test]
            fn next_power_of_2_is_correct(x in 2i64..=(1i64 << 62)) {
                let p = next_power_of_2(x);
                prop_assert!(is_power_of_2(p));
                prop_assert!(p >= x as u64);
                prop_assert!(p / 2 < x as u64);
            }
        }
    }
}
