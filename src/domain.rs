//! Domain canonicalization.
//!
//! The canonical domain is the sole equality rule used across the crate:
//! two URLs refer to the same site iff they canonicalize to the same
//! string. A leading `www.` is normalized away so `www.example.com` and
//! `example.com` share one whitelist entry; subdomains are distinct sites.

use chrono::Utc;

/// Expiry sentinel meaning "never expires".
pub const FOREVER: i64 = -1;

/// Scheme prefixes accepted at the start of a URL, matched ASCII
/// case-insensitively. The lax `http//` forms mirror what browsers hand
/// over for half-typed omnibox input.
const SCHEME_PREFIXES: [&str; 4] = ["https://", "http://", "https//", "http//"];

/// Extract the canonical domain from a URL.
///
/// Returns `None` when the input is not URL-shaped (no recognized scheme
/// prefix) or has an empty authority component.
pub fn canonical_domain(url: &str) -> Option<String> {
    let rest = SCHEME_PREFIXES.iter().find_map(|prefix| {
        let head = url.get(..prefix.len())?;
        if head.eq_ignore_ascii_case(prefix) {
            url.get(prefix.len()..)
        } else {
            None
        }
    })?;

    // Authority runs until the path or query begins.
    let end = rest.find(['/', '?']).unwrap_or(rest.len());
    let mut domain = &rest[..end];

    if let Some(stripped) = domain.strip_prefix("www.") {
        domain = stripped;
    }

    if domain.is_empty() {
        return None;
    }

    Some(domain.to_string())
}

/// Convert an unblock duration in hours to an absolute expiry timestamp
/// (milliseconds since epoch). Negative hours mean "forever" and yield
/// [`FOREVER`]. `None` yields the minimal grant of one second from now.
///
/// The one-second base keeps a zero-hour grant open long enough for the
/// navigation that requested it to complete.
pub fn timestamp_from_hours(hours: Option<f64>) -> i64 {
    let base = Utc::now().timestamp_millis() + 1000;
    match hours {
        None => base,
        Some(h) if h < 0.0 => FOREVER,
        Some(h) => base + (h * 3_600_000.0).round() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_domain_from_http_and_https() {
        assert_eq!(
            canonical_domain("https://example.com/path"),
            Some("example.com".to_string())
        );
        assert_eq!(
            canonical_domain("http://example.com"),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn strips_www_prefix() {
        assert_eq!(
            canonical_domain("https://www.example.com/path"),
            Some("example.com".to_string())
        );
        assert_eq!(
            canonical_domain("https://www.example.com"),
            canonical_domain("http://example.com/other?q=1")
        );
    }

    #[test]
    fn subdomains_are_distinct() {
        assert_ne!(
            canonical_domain("https://sub.example.com"),
            canonical_domain("https://example.com")
        );
    }

    #[test]
    fn stops_at_path_and_query() {
        assert_eq!(
            canonical_domain("https://example.com?q=1"),
            Some("example.com".to_string())
        );
        assert_eq!(
            canonical_domain("https://example.com/a/b?q=1"),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn accepts_scheme_case_insensitively() {
        assert_eq!(
            canonical_domain("HTTPS://example.com"),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn accepts_missing_scheme_colon() {
        assert_eq!(
            canonical_domain("https//example.com"),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn rejects_non_urls() {
        assert_eq!(canonical_domain("not a url"), None);
        assert_eq!(canonical_domain("ftp://example.com"), None);
        assert_eq!(canonical_domain(""), None);
    }

    #[test]
    fn tolerates_non_ascii_input() {
        assert_eq!(canonical_domain("héllo wörld"), None);
        assert_eq!(
            canonical_domain("https://bücher.example/path"),
            Some("bücher.example".to_string())
        );
    }

    #[test]
    fn rejects_empty_authority() {
        assert_eq!(canonical_domain("https://"), None);
        assert_eq!(canonical_domain("https://www."), None);
        assert_eq!(canonical_domain("https:///path"), None);
    }

    #[test]
    fn timestamp_from_hours_negative_means_forever() {
        assert_eq!(timestamp_from_hours(Some(-1.0)), FOREVER);
        assert_eq!(timestamp_from_hours(Some(-0.5)), FOREVER);
    }

    #[test]
    fn timestamp_from_hours_is_in_the_future() {
        let now = Utc::now().timestamp_millis();
        let ts = timestamp_from_hours(Some(2.0));
        let expected = now + 1000 + 2 * 3_600_000;
        assert!((ts - expected).abs() < 1000, "ts={ts} expected≈{expected}");
    }

    #[test]
    fn timestamp_from_hours_none_grants_one_second() {
        let now = Utc::now().timestamp_millis();
        let ts = timestamp_from_hours(None);
        assert!(ts >= now + 1000);
        assert!(ts < now + 2000);
    }

    #[test]
    fn timestamp_from_hours_supports_fractions() {
        let now = Utc::now().timestamp_millis();
        let ts = timestamp_from_hours(Some(0.5));
        let expected = now + 1000 + 1_800_000;
        assert!((ts - expected).abs() < 1000);
    }
}
