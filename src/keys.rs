//! Hashing, URL canonicalization, and cache key derivation.
//!
//! Two deterministic key families come out of this module:
//!
//! - The **KV key** (`build_kv_key`) identifies the index record for a
//!   canonical URL: `to_html:<version>:<host>:<path[?sorted-query]>`.
//!   Internal query parameters are dropped and the remaining pairs sorted,
//!   so cosmetic URL variation (param injection, reordering) maps to one key.
//! - The **object key** (`build_object_key`) names one published blob:
//!   `<version>/<safe-host>/<safe-path>_<digest16>_<timestamp>.html`.
//!   The digest prefix and timestamp make successive publishes of the same
//!   URL distinct, which is what lets the synchronizer garbage-collect the
//!   previous blob after flipping the index record.

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use url::Url;

/// Cache key schema version, stamped into every key and record.
pub const CACHE_VERSION: &str = "v1";

/// Prefix shared by all index record keys.
const KV_KEY_PREFIX: &str = "to_html";

/// Query parameters injected by the render infrastructure itself. They are
/// dropped before canonicalization so an instrumented URL and its clean
/// counterpart share one cache entry.
const INTERNAL_QUERY_PARAMS: &[&str] = &["to_html", "cache_invalidate", "x-lovablehtml-render"];

/// Compute the lowercase hex SHA-256 of a string's UTF-8 bytes.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonical path-plus-query form of a URL.
///
/// The path is preserved as-is (trailing slashes included). Query pairs are
/// decoded, filtered against the internal-param blocklist, sorted by
/// `(name, value)`, and joined without re-encoding.
pub fn canonical_path(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !INTERNAL_QUERY_PARAMS.contains(&name.as_ref()))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    if pairs.is_empty() {
        return url.path().to_string();
    }

    pairs.sort();
    let query = pairs
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}?{}", url.path(), query)
}

/// Build the index record key for a URL.
///
/// # Errors
///
/// Fails if the URL has no host (e.g. `unix:` or `data:` URLs).
pub fn build_kv_key(url: &Url) -> Result<String> {
    let Some(host) = url.host_str() else {
        bail!("URL has no host: {}", url);
    };

    Ok(format!(
        "{}:{}:{}:{}",
        KV_KEY_PREFIX,
        CACHE_VERSION,
        host,
        canonical_path(url)
    ))
}

/// Build the blob object key for one publish of a URL.
///
/// The caller supplies the creation instant so the key and the index record
/// carry the same timestamp. Keys for the same URL and body are distinct
/// whenever the instants differ by at least a millisecond.
///
/// # Errors
///
/// Fails if the URL has no host.
pub fn build_object_key(url: &Url, digest: &str, created_at: DateTime<Utc>) -> Result<String> {
    let Some(host) = url.host_str() else {
        bail!("URL has no host: {}", url);
    };

    let path_part = safe_path(url.path());
    let path_part = if path_part.is_empty() {
        "root".to_string()
    } else {
        path_part
    };

    let timestamp = created_at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "");

    let digest_prefix: String = digest.chars().take(16).collect();

    Ok(format!(
        "{}/{}/{}_{}_{}.html",
        CACHE_VERSION,
        safe_host(host),
        path_part,
        digest_prefix,
        timestamp
    ))
}

/// Lowercase the host and replace anything outside `[a-z0-9.-]` with `-`.
fn safe_host(host: &str) -> String {
    host.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Sanitize a URL path into a flat object-key segment: strip the leading
/// slash, replace anything outside `[A-Za-z0-9._/-]` with `-`, collapse
/// slash runs, then flatten the remaining slashes to underscores.
fn safe_path(path: &str) -> String {
    let trimmed = path.strip_prefix('/').unwrap_or(path);

    let sanitized: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();

    let mut collapsed = String::with_capacity(sanitized.len());
    let mut prev_slash = false;
    for c in sanitized.chars() {
        if c == '/' {
            if !prev_slash {
                collapsed.push(c);
            }
            prev_slash = true;
        } else {
            collapsed.push(c);
            prev_slash = false;
        }
    }

    collapsed.replace('/', "_")
}

/// Normalize a raw target URL for the pipeline: must parse, must be
/// http(s), must have a host. The fragment is dropped. Returns `None` for
/// anything that fails, which the caller treats as "skip this URL".
pub fn normalize_target_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()?;
    url.set_fragment(None);
    Some(url.to_string())
}

/// Deduplicate a target list, preserving first-seen order.
pub fn dedupe_targets(urls: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    urls.into_iter()
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sha256_known_vectors() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_kv_key_canonical_form() {
        let url = Url::parse("https://example.com/p?b=2&a=1&to_html=1").unwrap();
        assert_eq!(
            build_kv_key(&url).unwrap(),
            "to_html:v1:example.com:/p?a=1&b=2"
        );

        let clean = Url::parse("https://example.com/p?a=1&b=2").unwrap();
        assert_eq!(build_kv_key(&url).unwrap(), build_kv_key(&clean).unwrap());
    }

    #[test]
    fn test_kv_key_drops_all_internal_params() {
        let url = Url::parse(
            "https://example.com/x?cache_invalidate=1&x-lovablehtml-render=true&to_html=yes",
        )
        .unwrap();
        assert_eq!(build_kv_key(&url).unwrap(), "to_html:v1:example.com:/x");
    }

    #[test]
    fn test_kv_key_sorts_by_name_then_value() {
        let a = Url::parse("https://example.com/p?tag=zebra&tag=apple&id=2&id=1").unwrap();
        let b = Url::parse("https://example.com/p?id=1&id=2&tag=apple&tag=zebra").unwrap();
        assert_eq!(build_kv_key(&a).unwrap(), build_kv_key(&b).unwrap());
        assert_eq!(
            build_kv_key(&a).unwrap(),
            "to_html:v1:example.com:/p?id=1&id=2&tag=apple&tag=zebra"
        );
    }

    #[test]
    fn test_kv_key_preserves_trailing_slash() {
        let with = Url::parse("https://example.com/docs/").unwrap();
        let without = Url::parse("https://example.com/docs").unwrap();
        assert_eq!(build_kv_key(&with).unwrap(), "to_html:v1:example.com:/docs/");
        assert_ne!(build_kv_key(&with).unwrap(), build_kv_key(&without).unwrap());
    }

    #[test]
    fn test_object_key_shape() {
        let url = Url::parse("https://Example.com/blog/post-1").unwrap();
        let digest = sha256_hex("<html></html>");
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let key = build_object_key(&url, &digest, at).unwrap();

        assert!(key.starts_with("v1/example.com/blog_post-1_"));
        assert!(key.ends_with(".html"));
        assert!(key.contains(&digest[..16]));
        assert!(!key.contains(':'));
    }

    #[test]
    fn test_object_key_root_path() {
        let url = Url::parse("https://example.com/").unwrap();
        let key = build_object_key(&url, &sha256_hex("x"), Utc::now()).unwrap();
        assert!(key.starts_with("v1/example.com/root_"));
    }

    #[test]
    fn test_object_key_distinct_across_instants() {
        let url = Url::parse("https://example.com/page").unwrap();
        let digest = sha256_hex("same body");
        let t1 = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let t2 = t1 + chrono::Duration::milliseconds(1);

        let k1 = build_object_key(&url, &digest, t1).unwrap();
        let k2 = build_object_key(&url, &digest, t2).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_safe_path_collapses_and_flattens() {
        assert_eq!(safe_path("/a//b///c"), "a_b_c");
        assert_eq!(safe_path("/über/päge"), "-ber_p-ge");
        assert_eq!(safe_path("/"), "");
    }

    #[test]
    fn test_safe_host_replaces_invalid_chars() {
        assert_eq!(safe_host("Sub.Example.com"), "sub.example.com");
        assert_eq!(safe_host("exa_mple.com"), "exa-mple.com");
    }

    #[test]
    fn test_normalize_target_url() {
        assert_eq!(
            normalize_target_url("https://example.com/a#section"),
            Some("https://example.com/a".to_string())
        );
        assert_eq!(normalize_target_url("ftp://example.com/a"), None);
        assert_eq!(normalize_target_url("not a url"), None);
    }

    #[test]
    fn test_dedupe_preserves_order() {
        let urls = vec![
            "https://example.com/b".to_string(),
            "https://example.com/a".to_string(),
            "https://example.com/b".to_string(),
        ];
        assert_eq!(
            dedupe_targets(urls),
            vec![
                "https://example.com/b".to_string(),
                "https://example.com/a".to_string(),
            ]
        );
    }
}
