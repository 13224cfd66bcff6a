//! Link normalization and stable identity derivation.
//!
//! Feeds rotate tracking decorations on the same deal URL, so equality on the
//! raw link over-counts. Canonicalization strips the known tracking noise and
//! normalizes the parts that never change a deal's identity; the identity key
//! prefers the feed GUID when one is present.

use url::Url;

const DROP_PARAMS: &[&str] = &[
    "fbclid", "gclid", "igshid", "mc_cid", "mc_eid", "ref", "ref_src", "src",
];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || DROP_PARAMS.contains(&key.as_str())
}

/// Normalize a deal link into its canonical form.
///
/// Lowercases scheme and host, drops a leading `www.`, removes the trailing
/// slash (except on the root path), strips tracking query parameters, sorts
/// the surviving pairs, and discards any fragment. Unparseable input is
/// returned trimmed, unchanged. Idempotent.
pub fn canonicalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut parsed = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => return trimmed.to_string(),
    };

    if let Some(host) = parsed.host_str() {
        if let Some(stripped) = host.strip_prefix("www.") {
            let bare = stripped.to_string();
            if parsed.set_host(Some(&bare)).is_err() {
                return trimmed.to_string();
            }
        }
    }

    let path = parsed.path();
    if path != "/" && path.ends_with('/') {
        let shortened = path.trim_end_matches('/').to_string();
        parsed.set_path(&shortened);
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed
            .query_pairs_mut()
            .clear()
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }

    parsed.set_fragment(None);
    parsed.to_string()
}

/// Derive the deduplication key for an entry.
///
/// The feed GUID is the more stable identity when the publisher provides one;
/// otherwise the canonical link stands in.
pub fn identity_key(guid: Option<&str>, canonical_link: &str) -> String {
    match guid.map(str::trim) {
        Some(guid) if !guid.is_empty() => guid.to_string(),
        _ => canonical_link.to_string(),
    }
}

/// Lowercased host with any `www.` prefix removed; empty for unparseable input.
pub fn host_of(raw: &str) -> String {
    Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
        .unwrap_or_default()
}
