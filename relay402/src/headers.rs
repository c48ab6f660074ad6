//! Outbound request header derivation.
//!
//! [`translate`] turns the caller's headers into the headers sent upstream:
//! hop-by-hop and credential headers are dropped, the protocol revision is
//! stamped, and `accept` is widened to the media types the proxy needs for
//! the method. It cannot fail; values it cannot interpret are passed through.

use http::header::{ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::config::ProxyConfig;
use crate::constants::{
    EVENT_STREAM_MEDIA_TYPE, JSON_MEDIA_TYPE, PROTOCOL_VERSION_HEADER, STRIPPED_REQUEST_HEADERS,
};

/// Builds the upstream header map for a request with the given method.
///
/// GET is treated as a streaming pull and gets `text/event-stream` added to
/// `accept`; POST and DELETE are commands and get both `application/json`
/// and `text/event-stream`.
pub fn translate(inbound: &HeaderMap, method: &Method, config: &ProxyConfig) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 4);

    // The caller's Authorization carried the proxy's own secret; it is not ours to forward.
    let drop_authorization = config.inbound_bearer_token().is_some();

    for (name, value) in inbound {
        if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if drop_authorization && name == AUTHORIZATION {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    if let Some(auth) = config.upstream_authorization() {
        headers.insert(AUTHORIZATION, auth.clone());
    }

    let version_header = HeaderName::from_static(PROTOCOL_VERSION_HEADER);
    if !headers.contains_key(&version_header) {
        if let Ok(version) = HeaderValue::from_str(config.protocol_version()) {
            headers.insert(version_header, version);
        }
    }

    if *method == Method::GET {
        merge_accept(&mut headers, &[EVENT_STREAM_MEDIA_TYPE]);
    } else if *method == Method::POST || *method == Method::DELETE {
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_MEDIA_TYPE));
        }
        merge_accept(&mut headers, &[JSON_MEDIA_TYPE, EVENT_STREAM_MEDIA_TYPE]);
    }

    headers
}

/// Rewrites `accept` as the de-duplicated union of its existing values
/// followed by `required`, joined with `", "`.
fn merge_accept(headers: &mut HeaderMap, required: &[&str]) {
    let mut parts: Vec<String> = Vec::new();
    for value in headers.get_all(ACCEPT) {
        let Ok(value) = value.to_str() else { continue };
        for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            push_unique(&mut parts, part);
        }
    }
    for media_type in required {
        push_unique(&mut parts, media_type);
    }

    if let Ok(merged) = HeaderValue::from_str(&parts.join(", ")) {
        headers.insert(ACCEPT, merged);
    }
}

fn push_unique(parts: &mut Vec<String>, candidate: &str) {
    if !parts.iter().any(|p| p.eq_ignore_ascii_case(candidate)) {
        parts.push(candidate.to_owned());
    }
}
