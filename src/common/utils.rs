//! Utility functions for blocklease

use std::time::{SystemTime, UNIX_EPOCH};

/// Split a `tenant/volume` name into its two segments.
pub fn split_path(name: &str) -> crate::Result<(String, String)> {
    let parts: Vec<&str> = name.split('/').collect();
    match parts.as_slice() {
        [tenant, volume] if !tenant.is_empty() && !volume.is_empty() => {
            Ok((tenant.to_string(), volume.to_string()))
        }
        _ => Err(crate::Error::InvalidName {
            name: name.to_string(),
            reason: "expected <tenant>/<volume>".into(),
        }),
    }
}

/// Join tenant and volume into the public `tenant/volume` name.
pub fn join_path(tenant: &str, volume: &str) -> String {
    format!("{}/{}", tenant, volume)
}

/// Encode `tenant/volume` into the flat `tenant.volume` form used for image names.
pub fn internal_name(name: &str) -> crate::Result<String> {
    let parts: Vec<&str> = name.split('/').collect();
    if parts.len() != 2 {
        return Err(crate::Error::InvalidName {
            name: name.to_string(),
            reason: "must contain exactly one '/'".into(),
        });
    }
    if parts[0].contains('.') {
        return Err(crate::Error::InvalidName {
            name: name.to_string(),
            reason: "tenant may not contain '.'".into(),
        });
    }
    Ok(format!("{}.{}", parts[0], parts[1]))
}

/// Reverse of [`internal_name`]: the first `.` becomes `/`.
pub fn external_name(internal: &str) -> String {
    internal.replacen('.', "/", 1)
}

/// Substitute the device path for every lone `%` in a filesystem command.
/// `%%` is left as is.
pub fn template_fs_cmd(template: &str, device: &str) -> String {
    let mut out = String::with_capacity(template.len() + device.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push_str("%%");
        } else {
            out.push_str(device);
        }
    }

    out
}

/// Hostname used as lease holder identity.
pub fn local_hostname() -> crate::Result<String> {
    nix::unistd::gethostname()
        .map_err(|e| crate::Error::Internal(format!("Retrieving hostname: {}", e)))?
        .into_string()
        .map_err(|_| crate::Error::Internal("hostname is not valid UTF-8".into()))
}

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else {
        s.split_at(s.len() - s.chars().last().map_or(0, char::len_utf8))
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let secs = match unit {
        "ms" => return Ok(std::time::Duration::from_millis(num)),
        "s" => Some(num),
        "m" => num.checked_mul(60),
        "h" => num.checked_mul(3600),
        "d" => num.checked_mul(86400),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    secs.map(std::time::Duration::from_secs)
        .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", s)))
}

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: std::time::Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}
