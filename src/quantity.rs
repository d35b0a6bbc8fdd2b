//! CPU and memory quantity parsing
//!
//! Accepts the orchestrator-style notations challenge authors write in the
//! catalog ("0.5", "500m", "512Mi", "1Gi") as well as the Docker-style
//! shorthands ("2g", "256m").

/// Largest accepted CPU quantity, 1024 cores
pub const MAX_CPU_MILLIS: u64 = 1024 * 1000;

/// Largest accepted memory quantity, 1 TiB
pub const MAX_MEMORY_BYTES: u64 = 1 << 40;

/// Parse a CPU quantity into millicores
///
/// "0.5" -> 500, "500m" -> 500, "2" -> 2000. Zero, negative, malformed and
/// oversize values yield `None`.
pub fn parse_cpu_millis(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let millis = if let Some(num) = value.strip_suffix('m') {
        num.parse::<u64>().ok()?
    } else {
        let cores: f64 = value.parse().ok()?;
        if !cores.is_finite() || cores <= 0.0 || cores * 1000.0 > MAX_CPU_MILLIS as f64 {
            return None;
        }
        (cores * 1000.0).round() as u64
    };

    (millis > 0 && millis <= MAX_CPU_MILLIS).then_some(millis)
}

/// Parse a memory quantity into bytes
///
/// Binary suffixes (Ki, Mi, Gi, Ti), decimal suffixes (k, K, M, G, T) and
/// the Docker-style lowercase "m"/"g" (treated as MiB/GiB) are accepted.
/// Anything above `MAX_MEMORY_BYTES` yields `None`.
pub fn parse_memory_bytes(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    const SUFFIXES: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("m", 1 << 20),
        ("g", 1 << 30),
    ];

    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| value.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((value, 1));

    let bytes = if let Ok(n) = number.parse::<u64>() {
        n.checked_mul(multiplier)?
    } else {
        let n: f64 = number.parse().ok()?;
        let bytes = n * multiplier as f64;
        if !n.is_finite() || n <= 0.0 || bytes > MAX_MEMORY_BYTES as f64 {
            return None;
        }
        bytes as u64
    };

    (bytes > 0 && bytes <= MAX_MEMORY_BYTES).then_some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_cpu_millis("0.5"), Some(500));
        assert_eq!(parse_cpu_millis("500m"), Some(500));
        assert_eq!(parse_cpu_millis("2"), Some(2000));
        assert_eq!(parse_cpu_millis(" 1.25 "), Some(1250));
    }

    #[test]
    fn test_parse_cpu_invalid() {
        assert_eq!(parse_cpu_millis(""), None);
        assert_eq!(parse_cpu_millis("abc"), None);
        assert_eq!(parse_cpu_millis("0"), None);
        assert_eq!(parse_cpu_millis("-1"), None);
        assert_eq!(parse_cpu_millis("0m"), None);
        assert_eq!(parse_cpu_millis("1.5m"), None);
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory_bytes("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("1Gi"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("256M"), Some(256_000_000));
        assert_eq!(parse_memory_bytes("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("64m"), Some(64 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("1048576"), Some(1_048_576));
        assert_eq!(parse_memory_bytes("1.5Gi"), Some(1_610_612_736));
    }

    #[test]
    fn test_parse_memory_invalid() {
        assert_eq!(parse_memory_bytes(""), None);
        assert_eq!(parse_memory_bytes("lots"), None);
        assert_eq!(parse_memory_bytes("0Mi"), None);
        assert_eq!(parse_memory_bytes("Mi"), None);
    }

    #[test]
    fn test_oversize_quantities_rejected() {
        assert_eq!(parse_cpu_millis("1024"), Some(MAX_CPU_MILLIS));
        assert_eq!(parse_cpu_millis("1025"), None);
        assert_eq!(parse_cpu_millis("20000000000000m"), None);
        assert_eq!(parse_cpu_millis("1e300"), None);

        assert_eq!(parse_memory_bytes("1Ti"), Some(MAX_MEMORY_BYTES));
        assert_eq!(parse_memory_bytes("1025Gi"), None);
        assert_eq!(parse_memory_bytes("10000000T"), None);
        assert_eq!(parse_memory_bytes("1.5Ti"), None);
    }
}
