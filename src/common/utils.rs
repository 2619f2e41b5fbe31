//! Utility functions for rangeshift

use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else {
        let split = s.len() - 1;
        if !s.is_char_boundary(split) {
            return Err(crate::Error::InvalidConfig(format!(
                "invalid duration: {}",
                s
            )));
        }
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Retry with exponential backoff and jitter.
///
/// Only errors for which `is_retryable()` holds are retried.
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let max_retries = max_retries.max(1);
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2 + 1);
                tracing::warn!(
                    attempt = attempt + 1,
                    error = %e,
                    delay_ms = delay.as_millis() as u64 + jitter,
                    "retrying after transient error"
                );
                tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Validate a `db.collection` namespace
pub fn validate_namespace(ns: &str) -> crate::Result<()> {
    let Some((db, coll)) = ns.split_once('.') else {
        return Err(crate::Error::InvalidOptions(format!(
            "namespace must be <db>.<collection>: {}",
            ns
        )));
    };

    if db.is_empty() || coll.is_empty() {
        return Err(crate::Error::InvalidOptions(format!(
            "namespace must be <db>.<collection>: {}",
            ns
        )));
    }

    if ns.len() > 255 || ns.chars().any(|c| c.is_control() || c == '$') {
        return Err(crate::Error::InvalidOptions(format!(
            "namespace contains invalid characters: {}",
            ns
        )));
    }

    Ok(())
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
