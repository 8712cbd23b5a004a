//! Response handling and transformation.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers in both directions
//! - Enforce declared attributes on response cookies
//!
//! # Design Decisions
//! - Streaming responses avoid buffering entire body
//! - Hop-by-hop headers stripped automatically, including the ones a
//!   `Connection` header names
//! - Cookie attributes a route leaves unspecified are passed through

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::routing::fields::FieldMap;
use crate::routing::schema::CookieSpec;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Rewrite `Set-Cookie` headers for cookies the route declares.
pub fn enforce_cookie_attributes(headers: &mut HeaderMap, fields: &FieldMap) {
    if !headers.contains_key(header::SET_COOKIE) {
        return;
    }
    let original: Vec<HeaderValue> = headers.get_all(header::SET_COOKIE).iter().cloned().collect();
    headers.remove(header::SET_COOKIE);

    for value in original {
        let rewritten = value
            .to_str()
            .ok()
            .and_then(|s| {
                let name = s.split(';').next()?.split_once('=')?.0.trim();
                let spec = fields.cookie(name)?;
                HeaderValue::from_str(&rewrite_set_cookie(s, spec)).ok()
            })
            .unwrap_or(value);
        headers.append(header::SET_COOKIE, rewritten);
    }
}

fn rewrite_set_cookie(value: &str, spec: &CookieSpec) -> String {
    let mut parts = value.split(';').map(str::trim);
    let pair = parts.next().unwrap_or_default();

    let declared: Vec<(&str, Option<String>)> = [
        ("Expires", spec.expires.clone().map(Some)),
        ("Max-Age", spec.max_age.map(|v| Some(v.to_string()))),
        ("Domain", spec.domain.clone().map(Some)),
        ("Path", spec.path.clone().map(Some)),
        ("SameSite", spec.same_site.map(|s| Some(s.as_str().to_string()))),
    ]
    .into_iter()
    .filter_map(|(k, v)| v.map(|v| (k, v)))
    .chain(
        [
            ("Secure", spec.secure),
            ("HttpOnly", spec.http_only),
            ("Partitioned", spec.partitioned),
        ]
        .into_iter()
        .filter_map(|(k, flag)| flag.map(|on| (k, if on { Some(String::new()) } else { None }))),
    )
    .collect();

    let mut out = vec![pair.to_string()];
    for attr in parts {
        let key = attr.split('=').next().unwrap_or_default().trim();
        if !declared.iter().any(|(k, _)| k.eq_ignore_ascii_case(key)) && !attr.is_empty() {
            out.push(attr.to_string());
        }
    }
    for (key, value) in declared {
        match value {
            Some(v) if v.is_empty() => out.push(key.to_string()),
            Some(v) => out.push(format!("{}={}", key, v)),
            None => {}
        }
    }
    out.join("; ")
}
