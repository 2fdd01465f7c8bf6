use sha2::{Digest, Sha256};
use url::Url;

/// Query parameters that carry no identity: two URLs differing only in these
/// point at the same upstream page.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "ref",
    "referrer",
    "fbclid",
    "gclid",
];

/// Canonicalize a source URL for identity comparison.
///
/// Normalization rules:
/// - lowercase scheme and host
/// - strip a leading `www.`
/// - drop tracking query parameters, keep the rest in their original order
/// - strip the trailing slash from non-root paths
/// - drop fragments
///
/// Unparseable input is returned trimmed and lowercased so the caller still
/// gets a deterministic key out of garbage.
pub fn normalize_source_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw.trim()) else {
        return raw.trim().to_lowercase();
    };

    url.set_fragment(None);

    if let Some(host) = url.host_str() {
        let lowered = host.to_lowercase();
        let stripped = lowered.strip_prefix("www.").unwrap_or(&lowered).to_string();
        let _ = url.set_host(Some(&stripped));
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let query = kept
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }

    let mut out = url.to_string();
    if out.ends_with('/') && url.path() != "/" {
        out.pop();
    }
    out
}

/// Stable fingerprint of a source URL, suitable as a dedup key.
///
/// Equal for any two URLs that normalize to the same canonical form.
pub fn url_fingerprint(raw: &str) -> String {
    let normalized = normalize_source_url(raw);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn www_prefix_is_ignored() {
        assert_eq!(
            url_fingerprint("https://www.mangahost.example/series/123"),
            url_fingerprint("https://mangahost.example/series/123"),
        );
    }

    #[test]
    fn trailing_slash_is_ignored() {
        assert_eq!(
            url_fingerprint("https://mangahost.example/series/123/"),
            url_fingerprint("https://mangahost.example/series/123"),
        );
    }

    #[test]
    fn tracking_params_are_ignored() {
        assert_eq!(
            url_fingerprint("https://mangahost.example/series/123?utm_source=feed&utm_medium=rss"),
            url_fingerprint("https://mangahost.example/series/123"),
        );
    }

    #[test]
    fn meaningful_params_are_kept() {
        assert_ne!(
            url_fingerprint("https://mangahost.example/series?id=123"),
            url_fingerprint("https://mangahost.example/series?id=456"),
        );
    }

    #[test]
    fn host_case_is_ignored() {
        assert_eq!(
            url_fingerprint("HTTPS://MangaHost.Example/series/123"),
            url_fingerprint("https://mangahost.example/series/123"),
        );
    }

    #[test]
    fn root_path_keeps_its_slash() {
        assert_eq!(
            normalize_source_url("https://mangahost.example/"),
            "https://mangahost.example/",
        );
    }

    #[test]
    fn garbage_input_is_still_deterministic() {
        assert_eq!(url_fingerprint("  not a url  "), url_fingerprint("NOT A URL"));
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let hash = url_fingerprint("https://mangahost.example/series/123");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
