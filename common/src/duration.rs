use anyhow::{anyhow, Result};
use std::time::Duration;

/// Parse a short human duration such as `"5s"`, `"2m"` or `"1h"`.
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("Empty duration"));
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num
        .parse()
        .map_err(|_| anyhow!("Invalid duration: {}", s))?;
    let seconds = match unit {
        "" | "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => return Err(anyhow!("Unknown unit: {}", unit)),
    };
    if seconds == 0 {
        return Err(anyhow!("Duration must be greater than zero"));
    }
    Ok(Duration::from_secs(seconds))
}
