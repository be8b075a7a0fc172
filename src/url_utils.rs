//! URL extraction for pasted download requests, one session per URL.

use std::collections::HashSet;

use regex::Regex;
use url::Url;

/// Anything from `http(s)://` up to the next whitespace; `Url::parse` does the validating.
const URL_PATTERN: &str = r"https?://\S+";

/// Extract http(s) URLs from free text, in order of first appearance.
///
/// Trailing punctuation from prose or markdown is trimmed, each URL is normalized
/// with [`normalize_http_url`], and duplicates after normalization are dropped.
pub fn extract_urls(text: &str) -> Vec<String> {
    let re = match Regex::new(URL_PATTERN) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };

    let mut seen = HashSet::new();
    re.find_iter(text)
        .map(|m| trim_trailing_punct(m.as_str()))
        .filter_map(normalize_http_url)
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Canonical form of an http(s) URL, or `None` for anything else.
///
/// Parsing already lowercases scheme and host and drops default ports; the fragment
/// is removed on top of that. Path and query are left alone since track ids live there.
pub fn normalize_http_url(input: &str) -> Option<String> {
    let mut url = Url::parse(input.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

fn trim_trailing_punct(s: &str) -> &str {
    s.trim_end_matches(|c: char| {
        matches!(
            c,
            ')' | ']' | '}' | '>' | ',' | '.' | ';' | ':' | '!' | '?' | '"' | '\''
        )
    })
}
