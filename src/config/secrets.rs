//! Secret indirections and resolved secret values.
//!
//! # Design Decisions
//! - Secrets are never written literally in configuration; they are written as
//!   `{"$env": "NAME"}` and resolved against the process environment at startup
//! - A bare string still parses, so resolution can reject it with a field path
//!   instead of an opaque deserialization error
//! - Resolved values are wrapped in [`Secret`], whose `Debug`/`Display` never
//!   print the value

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

/// A reference to a secret value held outside the configuration document.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SecretRef {
    /// Read the value from the named environment variable.
    Env {
        #[serde(rename = "$env")]
        env: String,
    },
    /// A literal value. Always rejected during resolution.
    Literal(String),
}

impl SecretRef {
    /// Shorthand for an environment indirection.
    pub fn env(name: impl Into<String>) -> Self {
        SecretRef::Env { env: name.into() }
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretRef::Env { env } => f.debug_struct("Env").field("env", env).finish(),
            SecretRef::Literal(_) => f.write_str("Literal(<redacted>)"),
        }
    }
}

/// A resolved secret value.
///
/// Serializes to its plain value: serialization is only used to hand the
/// value to the owning service process through its environment.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the plain value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Compare with a presented credential in constant time.
    pub fn matches(&self, candidate: &str) -> bool {
        let (a, b) = (self.0.as_bytes(), candidate.as_bytes());
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Source of values for `$env` indirections.
pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads from the supervisor's own process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Why a single indirection could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    /// The referenced variable is unset or empty.
    Unresolved(String),
    /// The value was written literally.
    Literal,
}

impl fmt::Display for SecretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretError::Unresolved(name) => {
                write!(f, "environment variable {} is not set or empty", name)
            }
            SecretError::Literal => write!(
                f,
                "secret values must be indirected (use {{\"$env\": \"NAME\"}}), not written literally"
            ),
        }
    }
}

/// Resolve one indirection. Empty values count as unresolved.
pub fn resolve_secret(reference: &SecretRef, env: &dyn EnvSource) -> Result<Secret, SecretError> {
    match reference {
        SecretRef::Env { env: name } => match env.var(name) {
            Some(value) if !value.is_empty() => Ok(Secret::new(value)),
            _ => Err(SecretError::Unresolved(name.clone())),
        },
        SecretRef::Literal(_) => Err(SecretError::Literal),
    }
}
