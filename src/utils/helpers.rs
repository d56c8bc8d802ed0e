/// Helper utilities for volback

use anyhow::{anyhow, Result};
use regex::Regex;

/// Hostname of the container (or host) this process runs in.
///
/// Docker sets a container's hostname to its short id unless overridden,
/// which is how we find our own container among the listed ones.
pub fn my_hostname() -> Result<String> {
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return Ok(hostname);
        }
    }
    sysinfo::System::host_name().ok_or_else(|| anyhow!("unable to determine own hostname"))
}

/// Match a pattern anchored at the start of the name.
///
/// The ignore pattern is applied like a prefix match: a match anywhere
/// later in the name does not count. Keeps patterns like
/// `[0-9a-f]{64}$` meaning "the whole name is a hex id" instead of
/// "ends in 64 hex digits".
pub fn matches_at_start(pattern: &Regex, name: &str) -> bool {
    pattern.find(name).is_some_and(|m| m.start() == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::constants::DEFAULT_IGNORE_REGEX;

    #[test]
    fn test_default_ignore_pattern() {
        let re = Regex::new(DEFAULT_IGNORE_REGEX).unwrap();
        assert!(matches_at_start(&re, "app_tmp_data"));
        assert!(matches_at_start(&re, "nginx_cache"));
        assert!(matches_at_start(
            &re,
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        ));
        assert!(!matches_at_start(&re, "app_data"));
        assert!(!matches_at_start(&re, "postgres"));
    }

    #[test]
    fn test_match_must_start_at_zero() {
        let re = Regex::new("[0-9a-f]{64}$").unwrap();
        let suffixed = format!("prefix-{}", "a".repeat(64));
        assert!(!matches_at_start(&re, &suffixed));
        assert!(matches_at_start(&re, &"a".repeat(64)));
    }
}
