//! Cache Key construction and reversal. A pure function of
//! `(request, key_headers)` — no I/O beyond reading the already-cloned
//! request body once.

use url::Url;

use crate::error::Result;
use crate::policy::normalize_path;
use crate::request::InterceptedRequest;

const RESERVED_PREFIX: &str = "__";

/// Compute the canonical body string used in cache-key construction.
fn canonical_body(request: &InterceptedRequest) -> String {
    if request.method.eq_ignore_ascii_case("GET")
        || request.method.eq_ignore_ascii_case("HEAD")
    {
        return String::new();
    }

    let content_type = request.header("content-type").unwrap_or("");

    if content_type.contains("application/json") {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&request.body) {
            // `serde_json::Map` is backed by a `BTreeMap` by default (the
            // `preserve_order` feature is not enabled), so object keys are
            // already lexicographically sorted on re-serialization.
            if let Ok(s) = serde_json::to_string(&value) {
                return s;
            }
        }
        return String::from_utf8_lossy(&request.body).into_owned();
    }

    if content_type.contains("application/x-www-form-urlencoded") {
        let mut pairs: Vec<(String, String)> =
            url::form_urlencoded::parse(&request.body).into_owned().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        return url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
    }

    String::from_utf8_lossy(&request.body).into_owned()
}

/// Construct the Cache Key URL for a request given its merged
/// `key_headers`.
pub fn build_cache_key(
    request: &InterceptedRequest,
    key_headers: &[String],
) -> Result<Url> {
    let mut key_url = request.url.clone();
    key_url.set_path(&format!("/{}", normalize_path(request.url.path())));

    let mut params: Vec<(String, String)> = key_url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let body = canonical_body(request);
    params.push((
        format!("{RESERVED_PREFIX}body"),
        if body.is_empty() { "none".to_string() } else { body },
    ));
    params.push((format!("{RESERVED_PREFIX}method"), request.method.clone()));
    for h in key_headers {
        let value = request.header(h).unwrap_or("none").to_string();
        params.push((format!("{RESERVED_PREFIX}header-{h}"), value));
    }

    params.sort_by(|a, b| a.0.cmp(&b.0));

    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(&params)
        .finish();
    key_url.set_query(if query.is_empty() { None } else { Some(&query) });

    Ok(key_url)
}

/// Reverse a Cache Key back to the original lookup URL by stripping every
/// `__`-prefixed query parameter.
pub fn revert_cache_key(cache_key: &Url) -> Result<Url> {
    let mut reverted = cache_key.clone();
    let remaining: Vec<(String, String)> = cache_key
        .query_pairs()
        .filter(|(k, _)| !k.starts_with(RESERVED_PREFIX))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if remaining.is_empty() {
        reverted.set_query(None);
    } else {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&remaining)
            .finish();
        reverted.set_query(Some(&query));
    }
    Ok(reverted)
}

/// Recover the method a Cache Key was built with (used when reconstructing
/// an original request purely from its stored key).
pub fn revert_cache_key_method(cache_key: &Url) -> Option<String> {
    cache_key
        .query_pairs()
        .find(|(k, _)| k == "__method")
        .map(|(_, v)| v.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(method: &str, url: &str) -> InterceptedRequest {
        InterceptedRequest::new(method, Url::parse(url).unwrap())
    }

    #[test]
    fn query_param_order_does_not_affect_key() {
        let a = build_cache_key(&req("GET", "https://api.example.com/users?b=2&a=1"), &[]).unwrap();
        let b = build_cache_key(&req("GET", "https://api.example.com/users?a=1&b=2"), &[]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn json_body_key_order_does_not_affect_key() {
        let r1 = req("POST", "https://api.example.com/items")
            .with_header("content-type", "application/json")
            .with_body(br#"{"a":1,"b":2}"#.to_vec());
        let r2 = req("POST", "https://api.example.com/items")
            .with_header("content-type", "application/json")
            .with_body(br#"{"b":2,"a":1}"#.to_vec());
        assert_eq!(
            build_cache_key(&r1, &[]).unwrap(),
            build_cache_key(&r2, &[]).unwrap()
        );
    }

    #[test]
    fn differing_key_header_value_changes_key() {
        let headers = vec!["authorization".to_string()];
        let r1 = req("GET", "https://api.example.com/me").with_header("authorization", "a");
        let r2 = req("GET", "https://api.example.com/me").with_header("authorization", "b");
        assert_ne!(
            build_cache_key(&r1, &headers).unwrap(),
            build_cache_key(&r2, &headers).unwrap()
        );
    }

    #[test]
    fn revert_strips_reserved_params_only() {
        let original = req("GET", "https://api.example.com/users?sort=asc");
        let key = build_cache_key(&original, &[]).unwrap();
        let reverted = revert_cache_key(&key).unwrap();
        assert_eq!(reverted.path(), "/users");
        assert_eq!(reverted.query(), Some("sort=asc"));
    }

    #[test]
    fn get_requests_ignore_body() {
        let r1 = req("GET", "https://api.example.com/x").with_body(b"one".to_vec());
        let r2 = req("GET", "https://api.example.com/x").with_body(b"two".to_vec());
        assert_eq!(
            build_cache_key(&r1, &[]).unwrap(),
            build_cache_key(&r2, &[]).unwrap()
        );
    }
}
