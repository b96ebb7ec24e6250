//! Parse human-typed byte sizes (`6gb`, `6 GiB`, `6G`, `512`) into a `u64` byte count.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum BytesParseError {
    #[error("{0:?} is not a recognized byte size")]
    Malformed(String),
    #[error("{0:?} is not a recognized unit suffix")]
    UnknownUnit(String),
}

/// Decimal (SI) and binary (IEC) unit multipliers. A bare letter (`k`, `m`, `g`, ...)
/// without a trailing `b`/`ib` is treated as its decimal form, matching the common
/// shorthand used across this ecosystem's size flags.
fn unit_multiplier(unit: &str) -> Option<u64> {
    match unit.to_ascii_lowercase().as_str() {
        "" | "b" => Some(1),
        "k" | "kb" => Some(1_000),
        "kib" => Some(1 << 10),
        "m" | "mb" => Some(1_000_000),
        "mib" => Some(1 << 20),
        "g" | "gb" => Some(1_000_000_000),
        "gib" => Some(1 << 30),
        "t" | "tb" => Some(1_000_000_000_000),
        "tib" => Some(1 << 40),
        "p" | "pb" => Some(1_000_000_000_000_000),
        "pib" => Some(1 << 50),
        _ => None,
    }
}

static SIZE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn size_pattern() -> &'static Regex {
    SIZE_PATTERN.get_or_init(|| Regex::new(r"(?i)^([0-9]+(?:\.[0-9]+)?)\s*([a-z]*)$").unwrap())
}

pub fn parse_bytes(input: &str) -> Result<u64, BytesParseError> {
    let captures = size_pattern()
        .captures(input.trim())
        .ok_or_else(|| BytesParseError::Malformed(input.to_string()))?;
    let number: f64 = captures[1]
        .parse()
        .map_err(|_| BytesParseError::Malformed(input.to_string()))?;
    let unit = captures.get(2).map_or("", |m| m.as_str());
    let multiplier = unit_multiplier(unit).ok_or_else(|| BytesParseError::UnknownUnit(unit.to_string()))?;
    Ok((number * multiplier as f64).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_number_is_bytes() {
        assert_eq!(parse_bytes("512").unwrap(), 512);
    }

    #[test]
    fn decimal_gb_suffix() {
        assert_eq!(parse_bytes("6gb").unwrap(), 6_000_000_000);
    }

    #[test]
    fn binary_gib_suffix_with_space() {
        assert_eq!(parse_bytes("6 GiB").unwrap(), 6 * (1 << 30));
    }

    #[test]
    fn bare_letter_suffix_is_decimal() {
        assert_eq!(parse_bytes("6G").unwrap(), 6_000_000_000);
    }

    #[test]
    fn fractional_sizes_round_to_nearest_byte() {
        assert_eq!(parse_bytes("1.5kb").unwrap(), 1_500);
    }

    #[test]
    fn unknown_unit_is_rejected() {
        assert!(matches!(parse_bytes("5 xb"), Err(BytesParseError::UnknownUnit(_))));
    }

    #[test]
    fn garbage_input_is_rejected() {
        assert!(matches!(parse_bytes("not a size"), Err(BytesParseError::Malformed(_))));
    }
}
