//! Conversion between atomic integer amounts and decimal strings.
//!
//! Amounts travel through the KV store and webhook payloads as strings, so
//! the codec has to be exact: no floats anywhere, trailing zeros trimmed,
//! and `decimals = 0` producing a bare integer.

/// Format an atomic amount as a fixed-point decimal string.
pub fn format_atomic(atomic: u128, decimals: u32) -> String {
    let scale = match 10u128.checked_pow(decimals) {
        Some(s) => s,
        None => return atomic.to_string(),
    };
    if decimals == 0 {
        return atomic.to_string();
    }
    let whole = atomic / scale;
    let frac = atomic % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let mut frac_s = format!("{:0width$}", frac, width = decimals as usize);
    while frac_s.ends_with('0') {
        frac_s.pop();
    }
    format!("{whole}.{frac_s}")
}

/// Parse an integer or decimal string into an atomic amount.
///
/// Returns `None` for negative, signed, malformed, or overflowing input, and
/// for fractions with more digits than `decimals` allows.
pub fn parse_atomic(s: &str, decimals: u32) -> Option<u128> {
    let s = s.trim();
    if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
        return None;
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if frac.len() > decimals as usize {
        return None;
    }
    let scale = 10u128.checked_pow(decimals)?;
    let whole_part = if whole.is_empty() { 0 } else { whole.parse::<u128>().ok()? };
    let frac_part = if frac.is_empty() {
        0
    } else {
        let raw = frac.parse::<u128>().ok()?;
        raw.checked_mul(10u128.checked_pow(decimals - frac.len() as u32)?)?
    };
    whole_part.checked_mul(scale)?.checked_add(frac_part)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_trimmed_zeros() {
        assert_eq!(format_atomic(60_000_000_000_000, 12), "60");
        assert_eq!(format_atomic(60_500_000_000_000, 12), "60.5");
        assert_eq!(format_atomic(1, 12), "0.000000000001");
        assert_eq!(format_atomic(0, 12), "0");
    }

    #[test]
    fn zero_decimals_is_bare_integer() {
        assert_eq!(format_atomic(42, 0), "42");
        assert_eq!(parse_atomic("42", 0), Some(42));
        assert_eq!(parse_atomic("42.0", 0), None);
    }

    #[test]
    fn parses_integer_and_decimal_forms() {
        assert_eq!(parse_atomic("60", 12), Some(60_000_000_000_000));
        assert_eq!(parse_atomic("60.5", 12), Some(60_500_000_000_000));
        assert_eq!(parse_atomic("0.000000000001", 12), Some(1));
        assert_eq!(parse_atomic(".5", 2), Some(50));
    }

    #[test]
    fn rejects_negative_and_malformed() {
        assert_eq!(parse_atomic("-1", 12), None);
        assert_eq!(parse_atomic("+1", 12), None);
        assert_eq!(parse_atomic("1e3", 12), None);
        assert_eq!(parse_atomic("NaN", 12), None);
        assert_eq!(parse_atomic("", 12), None);
        assert_eq!(parse_atomic(".", 12), None);
        assert_eq!(parse_atomic("1.2.3", 12), None);
    }

    #[test]
    fn rejects_excess_fraction_digits() {
        assert_eq!(parse_atomic("1.123", 2), None);
    }

    #[test]
    fn round_trips_valid_decimals() {
        // P6: format(parse(s)) == normalize(s)
        for s in ["60", "60.5", "0.000000000001", "123.456", "7"] {
            let atomic = parse_atomic(s, 12).unwrap();
            assert_eq!(format_atomic(atomic, 12), s);
        }
    }

    #[test]
    fn round_trips_beyond_u64() {
        let big = u128::from(u64::MAX) * 1000;
        let s = format_atomic(big, 12);
        assert_eq!(parse_atomic(&s, 12), Some(big));
    }
}
