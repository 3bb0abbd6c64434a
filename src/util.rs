//! Small shared helpers

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Current wall-clock time as fractional seconds since the Unix epoch.
///
/// All trace timestamps (`created`, `sent`, `done`) use this representation.
pub fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Returns a random UUID as string.
pub fn uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Short random suffix used in generated ids.
pub fn short_uuid() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// The name of the host this process runs on, used as the default worker name.
pub fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }

    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Extracts `host[:port]` from a URL, the way traces report the serving host.
pub fn host_of_url(url: &str) -> String {
    let rest = url.split("//").nth(1).unwrap_or(url);
    let host = rest.split('/').next().unwrap_or(rest);
    host.split('?').next().unwrap_or(host).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_monotonic_enough() {
        let a = timestamp();
        let b = timestamp();
        assert!(b >= a);
        assert!(a > 1.0e9);
    }

    #[test]
    fn host_of_url_strips_scheme_path_and_query() {
        assert_eq!(host_of_url("http://localhost:31523/api?x=1"), "localhost:31523");
        assert_eq!(host_of_url("http://10.0.0.1/"), "10.0.0.1");
        assert_eq!(host_of_url("host:8080/path"), "host:8080");
    }

    #[test]
    fn short_uuid_has_eight_chars() {
        assert_eq!(short_uuid().len(), 8);
    }
}
