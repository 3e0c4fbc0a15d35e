//! Host implementations of the guest utility helpers.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use rand::distributions::Alphanumeric;

/// Random alphanumeric string of the given length.
pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Random integer in `[min, max]`. Reversed bounds are swapped rather than
/// rejected, matching what loose guest code expects.
pub fn random_int(min: f64, max: f64) -> i64 {
    let (min, max) = if min <= max { (min, max) } else { (max, min) };
    let lo = if min.is_finite() { min.ceil() as i64 } else { i64::MIN };
    let hi = if max.is_finite() { max.floor() as i64 } else { i64::MAX };
    if lo >= hi {
        return lo;
    }
    rand::thread_rng().gen_range(lo..=hi)
}

/// Decode a base64 string into a latin-1 ("binary") string.
pub fn atob(data: &str) -> Result<String, String> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|_| "The string to be decoded is not correctly encoded".to_string())?;
    Ok(bytes.into_iter().map(|b| b as char).collect())
}

/// Encode a latin-1 string as base64. Characters above U+00FF are invalid
/// input, as in the browser API.
pub fn btoa(data: &str) -> Result<String, String> {
    let mut bytes = Vec::with_capacity(data.len());
    for ch in data.chars() {
        let code = ch as u32;
        if code > 0xff {
            return Err(
                "The string to be encoded contains characters outside of the Latin1 range"
                    .to_string(),
            );
        }
        bytes.push(code as u8);
    }
    Ok(STANDARD.encode(bytes))
}

/// Render a millisecond duration as a compact human string,
/// e.g. `1d 2h 3m 4s` or `850ms`.
pub fn humanize_duration(ms: f64) -> String {
    if !ms.is_finite() || ms < 0.0 {
        return "0ms".to_string();
    }
    let total_ms = ms as u64;
    if total_ms < 1000 {
        return format!("{total_ms}ms");
    }

    let mut seconds = total_ms / 1000;
    let days = seconds / 86_400;
    seconds %= 86_400;
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    seconds %= 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{seconds}s"));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_string_length_and_charset() {
        let s = random_string(32);
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(random_string(0).is_empty());
    }

    #[test]
    fn test_random_int_bounds() {
        for _ in 0..100 {
            let n = random_int(1.0, 6.0);
            assert!((1..=6).contains(&n));
        }
        assert_eq!(random_int(5.0, 5.0), 5);
        // Reversed bounds swap.
        for _ in 0..20 {
            let n = random_int(6.0, 1.0);
            assert!((1..=6).contains(&n));
        }
    }

    #[test]
    fn test_base64_roundtrip() {
        assert_eq!(btoa("hello").unwrap(), "aGVsbG8=");
        assert_eq!(atob("aGVsbG8=").unwrap(), "hello");
        assert!(btoa("héllo").is_ok()); // é is U+00E9, inside latin-1
        assert!(btoa("h€llo").is_err()); // € is not
        assert!(atob("!!not base64!!").is_err());
    }

    #[test]
    fn test_humanize_duration() {
        assert_eq!(humanize_duration(850.0), "850ms");
        assert_eq!(humanize_duration(1000.0), "1s");
        assert_eq!(humanize_duration(61_000.0), "1m 1s");
        assert_eq!(humanize_duration(90_061_000.0), "1d 1h 1m 1s");
        assert_eq!(humanize_duration(-5.0), "0ms");
        assert_eq!(humanize_duration(f64::NAN), "0ms");
    }
}
