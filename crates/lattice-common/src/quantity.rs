//! Kubernetes quantity and duration helpers
//!
//! Storage sizes are handled as exact byte counts (`u128`). Parsing accepts
//! the same suffixes as the API server: binary (`Ki`..`Ei`), decimal
//! (`k`..`E`), and decimal exponents (`1e9`). Fractions are rounded up to
//! the next whole byte so a parsed maximum is never undershot.
//!
//! Durations use the Go-style `1h30m10s` form that users already write in
//! other Kubernetes resources; a bare number is seconds.

use std::time::Duration;

/// One kibibyte
pub const KI: u128 = 1 << 10;
/// One mebibyte
pub const MI: u128 = 1 << 20;
/// One gibibyte
pub const GI: u128 = 1 << 30;
/// One tebibyte
pub const TI: u128 = 1 << 40;

const BINARY_SUFFIXES: &[(&str, u128)] = &[
    ("Ei", 1 << 60),
    ("Pi", 1 << 50),
    ("Ti", TI),
    ("Gi", GI),
    ("Mi", MI),
    ("Ki", KI),
];

const DECIMAL_SUFFIXES: &[(&str, u128)] = &[
    ("E", 1_000_000_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("T", 1_000_000_000_000),
    ("G", 1_000_000_000),
    ("M", 1_000_000),
    ("k", 1_000),
];

/// Parse a Kubernetes quantity string into bytes.
///
/// Accepts "10Gi" → 10737418240, "1.5Gi" → 1610612736, "500M" → 500000000,
/// "1e3" → 1000, bare integer → bytes.
pub fn parse_quantity(input: &str) -> Result<u128, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("quantity cannot be empty".to_string());
    }
    if s.starts_with('-') {
        return Err(format!("quantity must not be negative: {input}"));
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let (multiplier, divisor) = suffix_scale(suffix)
        .ok_or_else(|| format!("invalid quantity suffix in {input:?}"))?;

    let (whole, frac) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(format!("quantity has no digits: {input:?}"));
    }
    if frac.contains('.') {
        return Err(format!("quantity has more than one decimal point: {input:?}"));
    }

    let digits = format!("{whole}{frac}");
    let mantissa: u128 = if digits.is_empty() {
        0
    } else {
        digits
            .parse()
            .map_err(|_| format!("quantity out of range: {input:?}"))?
    };
    let scale = 10u128
        .checked_pow(frac.len() as u32)
        .and_then(|p| p.checked_mul(divisor))
        .ok_or_else(|| format!("quantity has too many fractional digits: {input:?}"))?;

    let numerator = mantissa
        .checked_mul(multiplier)
        .ok_or_else(|| format!("quantity out of range: {input:?}"))?;
    Ok(numerator.div_ceil(scale))
}

/// Returns (multiplier, divisor) for a quantity suffix.
fn suffix_scale(suffix: &str) -> Option<(u128, u128)> {
    if suffix.is_empty() {
        return Some((1, 1));
    }
    if let Some(&(_, m)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some((m, 1));
    }
    if let Some(&(_, m)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some((m, 1));
    }
    if suffix == "m" {
        // milli-units only make sense for CPU, but the grammar allows them
        return Some((1, 1000));
    }
    let exponent = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))?;
    let exponent: u32 = exponent.parse().ok()?;
    Some((10u128.checked_pow(exponent)?, 1))
}

/// Format a byte count as a Kubernetes quantity.
///
/// Uses the largest binary suffix that represents the value exactly, so
/// the round trip through [`parse_quantity`] is lossless.
pub fn format_quantity(bytes: u128) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, multiplier) in BINARY_SUFFIXES {
        if bytes % multiplier == 0 {
            return format!("{}{}", bytes / multiplier, suffix);
        }
    }
    bytes.to_string()
}

/// Parse a Go-style duration ("60s", "5m", "1h30m") or bare seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return Err(format!("invalid duration unit '{c}' in {input:?}")),
        };
        if digits.is_empty() {
            return Err(format!("duration unit '{c}' without a value in {input:?}"));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("duration out of range: {input:?}"))?;
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| format!("duration out of range: {input:?}"))?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("duration {input:?} has a trailing number without a unit"));
    }
    Ok(Duration::from_secs(total))
}

/// Format a duration compactly ("4m12s"), for messages and events.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 {
        out.push_str(&format!("{s}s"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_suffixes() {
        assert_eq!(parse_quantity("10Gi").unwrap(), 10 * GI);
        assert_eq!(parse_quantity("512Mi").unwrap(), 512 * MI);
        assert_eq!(parse_quantity("1Ti").unwrap(), TI);
        assert_eq!(parse_quantity("4Ki").unwrap(), 4096);
    }

    #[test]
    fn parses_decimal_suffixes_and_plain_bytes() {
        assert_eq!(parse_quantity("500M").unwrap(), 500_000_000);
        assert_eq!(parse_quantity("2G").unwrap(), 2_000_000_000);
        assert_eq!(parse_quantity("1k").unwrap(), 1000);
        assert_eq!(parse_quantity("10737418240").unwrap(), 10 * GI);
    }

    #[test]
    fn parses_exponents() {
        assert_eq!(parse_quantity("1e3").unwrap(), 1000);
        assert_eq!(parse_quantity("5E9").unwrap(), 5_000_000_000);
        // bare E is the exa suffix, not an exponent
        assert_eq!(parse_quantity("1E").unwrap(), 1_000_000_000_000_000_000);
    }

    #[test]
    fn fractions_round_up_to_whole_bytes() {
        assert_eq!(parse_quantity("1.5Gi").unwrap(), GI + GI / 2);
        assert_eq!(parse_quantity("0.5Ki").unwrap(), 512);
        assert_eq!(parse_quantity("1.5").unwrap(), 2);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("-1Gi").is_err());
        assert!(parse_quantity("10GB").is_err());
        assert!(parse_quantity("Gi").is_err());
        assert!(parse_quantity("1.2.3Gi").is_err());
    }

    #[test]
    fn formats_with_largest_exact_suffix() {
        assert_eq!(format_quantity(12 * GI), "12Gi");
        assert_eq!(format_quantity(GI + GI / 2), "1536Mi");
        assert_eq!(format_quantity(TI), "1Ti");
        assert_eq!(format_quantity(1000), "1000");
        assert_eq!(format_quantity(0), "0");
    }

    #[test]
    fn format_then_parse_is_lossless_for_odd_sizes() {
        let odd = 10 * GI + 12_345;
        assert_eq!(parse_quantity(&format_quantity(odd)).unwrap(), odd);
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("1h30").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::from_secs(252)), "4m12s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
