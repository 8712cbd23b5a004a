//! Route schema emitted for each service.
//!
//! ```json
//! {
//!   "service": "blog",
//!   "endpoints": [{
//!     "name": "GetPost",
//!     "method": "GET",
//!     "path": "/blog/:id",
//!     "auth": true,
//!     "expose": true,
//!     "request": [{"name": "id", "location": "path"},
//!                 {"name": "lang", "location": {"header": "Accept-Language"}}],
//!     "response": [{"name": "session", "location": {"cookie": {"http_only": true}}}]
//!   }],
//!   "auth_handler": {"name": "AuthHandler", "params": [{"name": "token", "location": {"header": "Authorization"}}]}
//! }
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceSchema {
    pub service: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointSchema>,
    #[serde(default)]
    pub auth_handler: Option<AuthHandlerSchema>,
}

impl ServiceSchema {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointSchema {
    pub name: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    pub path: String,
    /// Requires authentication through the service's auth handler.
    #[serde(default)]
    pub auth: bool,
    /// Reachable from outside the fleet. Unexposed endpoints only accept
    /// calls carrying an inter-service auth key.
    #[serde(default)]
    pub expose: bool,
    #[serde(default)]
    pub request: Vec<FieldSchema>,
    #[serde(default)]
    pub response: Vec<FieldSchema>,
}

impl EndpointSchema {
    /// Declared methods, upper-cased and deduplicated. None declared means `*`.
    pub fn method_list(&self) -> Vec<String> {
        let mut set: BTreeSet<String> = self
            .method
            .iter()
            .chain(self.methods.iter())
            .map(|m| m.trim().to_ascii_uppercase())
            .collect();
        if set.is_empty() {
            set.insert("*".to_string());
        }
        set.into_iter().collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthHandlerSchema {
    pub name: String,
    #[serde(default)]
    pub params: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(default)]
    pub location: Option<FieldLocation>,
}

/// Where a field travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldLocation {
    Body,
    Query,
    Path,
    /// Header name; defaults to the field name.
    Header(Option<String>),
    Cookie(CookieSpec),
}

/// A cookie and the attributes the gateway enforces on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CookieSpec {
    /// Cookie name; defaults to the field name.
    pub name: Option<String>,
    pub expires: Option<String>,
    pub max_age: Option<i64>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: Option<bool>,
    pub http_only: Option<bool>,
    pub same_site: Option<SameSite>,
    pub partitioned: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}
