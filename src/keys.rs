//! Pure extraction of S3 storage keys from arbitrary column values observed
//! by the CDC ingestor. Kept dependency-free of the rest of the crate so it
//! can be fuzz-tested in isolation.

use regex::Regex;
use std::sync::OnceLock;

struct UrlPattern {
    regex: Regex,
}

fn url_patterns() -> &'static [UrlPattern] {
    static PATTERNS: OnceLock<Vec<UrlPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            // https://bucket.s3.region.amazonaws.com/key
            UrlPattern {
                regex: Regex::new(r"^https?://[\w.-]+\.s3\.[\w.-]+\.amazonaws\.com/(.+)$").unwrap(),
            },
            // https://s3.region.amazonaws.com/bucket/key
            UrlPattern {
                regex: Regex::new(r"^https?://s3\.[\w.-]+\.amazonaws\.com/[\w.-]+/(.+)$").unwrap(),
            },
            // s3://bucket/key
            UrlPattern {
                regex: Regex::new(r"^s3://[\w.-]+/(.+)$").unwrap(),
            },
        ]
    })
}

/// Extracts zero or more S3 keys from a single observed column value.
///
/// Tries, in order: a JSON array (recursing into each element), the three
/// known S3 URL shapes, then a plain-path heuristic. Never panics on
/// arbitrary input.
pub fn extract_keys(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }

    if value.starts_with('[') {
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(value) {
            let mut keys = Vec::new();
            for item in items {
                let as_str = match item {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                keys.extend(extract_keys(&as_str));
            }
            return keys;
        }
    }

    for pattern in url_patterns() {
        if let Some(caps) = pattern.regex.captures(value) {
            if let Some(m) = caps.get(1) {
                return vec![m.as_str().to_string()];
            }
        }
    }

    if (value.contains('/') || value.contains('.'))
        && !value.starts_with("http")
        && !value.starts_with("//")
    {
        return vec![value.to_string()];
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_path() {
        assert_eq!(extract_keys("avatars/user123.jpg"), vec!["avatars/user123.jpg"]);
    }

    #[test]
    fn extracts_s3_uri() {
        assert_eq!(
            extract_keys("s3://my-bucket/avatars/user123.jpg"),
            vec!["avatars/user123.jpg"]
        );
    }

    #[test]
    fn extracts_virtual_hosted_url() {
        assert_eq!(
            extract_keys("https://my-bucket.s3.us-east-1.amazonaws.com/avatars/user123.jpg"),
            vec!["avatars/user123.jpg"]
        );
    }

    #[test]
    fn extracts_path_style_url() {
        assert_eq!(
            extract_keys("https://s3.us-east-1.amazonaws.com/my-bucket/avatars/user123.jpg"),
            vec!["avatars/user123.jpg"]
        );
    }

    #[test]
    fn extracts_json_array() {
        let mut keys = extract_keys(r#"["a/1.jpg", "a/2.jpg"]"#);
        keys.sort();
        assert_eq!(keys, vec!["a/1.jpg", "a/2.jpg"]);
    }

    #[test]
    fn rejects_bare_http_url_without_known_shape() {
        assert!(extract_keys("http://example.com/not-s3").is_empty());
    }

    #[test]
    fn rejects_values_with_no_path_shape() {
        assert!(extract_keys("plainvalue").is_empty());
        assert!(extract_keys("42").is_empty());
    }

    #[test]
    fn empty_value_yields_no_keys() {
        assert!(extract_keys("").is_empty());
    }

    #[test]
    fn never_panics_on_adversarial_input() {
        let adversarial = [
            "[",
            "[[[[",
            "]",
            "s3://",
            "s3:///",
            "\u{0}\u{1}\u{2}",
            "{\"not\":\"an array\"}",
            "[1, 2, {\"nested\": true}]",
            "//etc/passwd",
            &"a".repeat(10_000),
            "s3://bucket-with-no-key",
        ];
        for input in adversarial {
            let _ = extract_keys(input);
        }
    }
}
