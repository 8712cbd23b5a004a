//! Field maps: where each declared field of a request or response travels.

use axum::http::{HeaderMap, Method};
use serde_json::{Map, Value};

use crate::routing::schema::{CookieSpec, FieldLocation, FieldSchema};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireLoc {
    Body,
    Query,
    Path,
    Header(String),
    Cookie(String),
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub loc: WireLoc,
    /// Attributes enforced on response cookies.
    pub cookie: Option<CookieSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct FieldMap {
    fields: Vec<FieldSpec>,
}

/// Methods whose requests carry a body.
pub fn method_has_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

impl FieldMap {
    fn build(fields: &[FieldSchema], default: WireLoc) -> Self {
        let fields = fields
            .iter()
            .map(|f| {
                let (loc, cookie) = match &f.location {
                    None => (default.clone(), None),
                    Some(FieldLocation::Body) => (WireLoc::Body, None),
                    Some(FieldLocation::Query) => (WireLoc::Query, None),
                    Some(FieldLocation::Path) => (WireLoc::Path, None),
                    Some(FieldLocation::Header(name)) => (
                        WireLoc::Header(name.clone().unwrap_or_else(|| f.name.clone())),
                        None,
                    ),
                    Some(FieldLocation::Cookie(spec)) => (
                        WireLoc::Cookie(spec.name.clone().unwrap_or_else(|| f.name.clone())),
                        Some(spec.clone()),
                    ),
                };
                FieldSpec {
                    name: f.name.clone(),
                    loc,
                    cookie,
                }
            })
            .collect();
        Self { fields }
    }

    /// Request fields without a location go in the body for POST, PUT and
    /// PATCH, and in the query string otherwise.
    pub fn for_request(fields: &[FieldSchema], method: &Method) -> Self {
        let default = if method_has_body(method) {
            WireLoc::Body
        } else {
            WireLoc::Query
        };
        Self::build(fields, default)
    }

    pub fn for_response(fields: &[FieldSchema]) -> Self {
        Self::build(fields, WireLoc::Body)
    }

    /// Auth handler parameters never come from a body.
    pub fn for_auth(fields: &[FieldSchema]) -> Self {
        Self::build(fields, WireLoc::Query)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn header_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter_map(|f| match &f.loc {
            WireLoc::Header(h) => Some(h.as_str()),
            _ => None,
        })
    }

    pub fn path_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.loc == WireLoc::Path)
            .map(|f| f.name.as_str())
    }

    /// Declared response cookie with the given name.
    pub fn cookie(&self, name: &str) -> Option<&CookieSpec> {
        self.fields.iter().find_map(|f| match (&f.loc, &f.cookie) {
            (WireLoc::Cookie(n), Some(spec)) if n == name => Some(spec),
            _ => None,
        })
    }

    /// Collect the query, header and cookie fields present in a request.
    /// Missing fields are omitted.
    pub fn extract(&self, headers: &HeaderMap, query: Option<&str>) -> Map<String, Value> {
        let mut out = Map::new();
        let pairs: Vec<(String, String)> = query
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        let cookies = parse_cookies(headers);

        for field in &self.fields {
            let value = match &field.loc {
                WireLoc::Query => {
                    let mut values: Vec<Value> = pairs
                        .iter()
                        .filter(|(k, _)| *k == field.name)
                        .map(|(_, v)| Value::String(v.clone()))
                        .collect();
                    match values.len() {
                        0 => None,
                        1 => values.pop(),
                        _ => Some(Value::Array(values)),
                    }
                }
                WireLoc::Header(name) => headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .map(|v| Value::String(v.to_string())),
                WireLoc::Cookie(name) => cookies
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| Value::String(v.clone())),
                WireLoc::Body | WireLoc::Path => None,
            };
            if let Some(v) = value {
                out.insert(field.name.clone(), v);
            }
        }
        out
    }
}

/// Parse every `Cookie` header into name/value pairs.
pub fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().trim_matches('"').to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn field(name: &str, location: Option<FieldLocation>) -> FieldSchema {
        FieldSchema {
            name: name.into(),
            location,
        }
    }

    #[test]
    fn test_default_location_depends_on_method() {
        let fields = vec![field("title", None)];
        assert_eq!(FieldMap::for_request(&fields, &Method::POST).fields()[0].loc, WireLoc::Body);
        assert_eq!(FieldMap::for_request(&fields, &Method::PATCH).fields()[0].loc, WireLoc::Body);
        assert_eq!(FieldMap::for_request(&fields, &Method::GET).fields()[0].loc, WireLoc::Query);
        assert_eq!(FieldMap::for_request(&fields, &Method::DELETE).fields()[0].loc, WireLoc::Query);
    }

    #[test]
    fn test_names_default_to_field_name() {
        let fields = vec![
            field("x_token", Some(FieldLocation::Header(None))),
            field("sid", Some(FieldLocation::Cookie(CookieSpec::default()))),
        ];
        let map = FieldMap::for_request(&fields, &Method::GET);
        assert_eq!(map.fields()[0].loc, WireLoc::Header("x_token".into()));
        assert_eq!(map.fields()[1].loc, WireLoc::Cookie("sid".into()));
    }

    #[test]
    fn test_extract() {
        let fields = vec![
            field("tag", None),
            field("page", Some(FieldLocation::Query)),
            field("token", Some(FieldLocation::Header(Some("authorization".into())))),
            field(
                "session",
                Some(FieldLocation::Cookie(CookieSpec {
                    name: Some("sid".into()),
                    ..Default::default()
                })),
            ),
            field("missing", Some(FieldLocation::Query)),
        ];
        let map = FieldMap::for_auth(&fields);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        headers.insert("cookie", HeaderValue::from_static("theme=dark; sid=s%201"));

        let out = map.extract(&headers, Some("tag=a&tag=b&page=2"));
        assert_eq!(out["tag"], serde_json::json!(["a", "b"]));
        assert_eq!(out["page"], "2");
        assert_eq!(out["token"], "Bearer abc");
        assert_eq!(out["session"], "s%201");
        assert!(!out.contains_key("missing"));
    }
}
