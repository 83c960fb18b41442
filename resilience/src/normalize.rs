use std::sync::OnceLock;

use regex::Regex;

use common::utils::hashing::key_digest;

fn uuid_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
            .expect("uuid regex")
    })
}

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z][a-z0-9+.-]*://[^\s]+").expect("url regex"))
}

fn path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:/[\w.-]+){2,}").expect("path regex"))
}

fn digits_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("digits regex"))
}

fn whitespace_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

/// Normalize an error message so that structurally identical failures
/// fingerprint the same: variable parts (ids, numbers, paths, urls) are
/// replaced with placeholders, whitespace collapsed, case folded.
pub fn normalize_error_message(message: &str) -> String {
    let lowered = message.to_lowercase();
    let no_urls = url_pattern().replace_all(&lowered, "<url>");
    let no_uuids = uuid_pattern().replace_all(&no_urls, "<uuid>");
    let no_paths = path_pattern().replace_all(&no_uuids, "<path>");
    let no_digits = digits_pattern().replace_all(&no_paths, "<n>");
    whitespace_pattern()
        .replace_all(no_digits.trim(), " ")
        .into_owned()
}

/// Stable fingerprint of a normalized message.
pub fn fingerprint(message: &str) -> String {
    key_digest(&[&normalize_error_message(message)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_failures_with_different_ids_share_a_fingerprint() {
        let a = "connection to node 10.2.3.4:8080 refused after 3000 ms";
        let b = "Connection to node 10.9.8.7:9090 refused after 1500 ms";
        assert_eq!(fingerprint(a), fingerprint(b));
    }

    #[test]
    fn uuids_are_stripped() {
        let a = "task 0b4f9f5e-6f3a-4e8e-9b5b-0dbb21f1c1aa not claimable";
        let b = "task 9a1c2d3e-0000-4e8e-9b5b-aaaaaaaaaaaa not claimable";
        assert_eq!(
            normalize_error_message(a),
            normalize_error_message(b)
        );
        assert!(normalize_error_message(a).contains("<uuid>"));
    }

    #[test]
    fn urls_and_paths_are_stripped() {
        let normalized =
            normalize_error_message("failed to fetch https://api.example.com/v1/embed: 503");
        assert!(normalized.contains("<url>"));

        let normalized = normalize_error_message("cannot open /var/lib/engram/data.db");
        assert!(normalized.contains("<path>"));
    }

    #[test]
    fn whitespace_and_case_are_folded() {
        assert_eq!(
            normalize_error_message("Timeout   While\tWaiting"),
            "timeout while waiting"
        );
    }

    #[test]
    fn different_failures_fingerprint_differently() {
        assert_ne!(
            fingerprint("connection refused"),
            fingerprint("permission denied")
        );
    }
}
