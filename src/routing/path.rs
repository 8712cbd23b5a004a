//! Path patterns.
//!
//! # Syntax
//! ```text
//! /blog/:id/*path     literal, single-segment parameter, trailing wildcard
//! /!fallback          trailing fallback, used only when nothing else matches
//! ```
//!
//! # Design Decisions
//! - A wildcard or fallback may only appear as the final segment
//! - Parameter names are unique within a pattern
//! - Paths are split on `/` without normalization; `/a/` has an empty
//!   trailing segment and does not match `/a`

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    /// `:name`, matches exactly one non-empty segment.
    Param(String),
    /// `*name`, matches zero or more trailing segments.
    Wildcard(String),
    /// `!name`, like a wildcard but with the lowest priority of all.
    Fallback(String),
}

impl Segment {
    pub fn param_name(&self) -> Option<&str> {
        match self {
            Segment::Literal(_) => None,
            Segment::Param(n) | Segment::Wildcard(n) | Segment::Fallback(n) => Some(n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("path must start with '/'")]
    MissingLeadingSlash,
    #[error("empty path segment")]
    EmptySegment,
    #[error("invalid parameter name '{0}'")]
    InvalidName(String),
    #[error("'{0}' must be the final segment")]
    NotLast(String),
    #[error("duplicate parameter '{0}'")]
    DuplicateParam(String),
}

/// A parsed route path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let rest = raw.strip_prefix('/').ok_or(PatternError::MissingLeadingSlash)?;
        let mut segments = Vec::new();
        if !rest.is_empty() {
            let parts: Vec<&str> = rest.split('/').collect();
            let last = parts.len() - 1;
            for (i, part) in parts.iter().enumerate() {
                let segment = parse_segment(part)?;
                if matches!(segment, Segment::Wildcard(_) | Segment::Fallback(_)) && i != last {
                    return Err(PatternError::NotLast((*part).to_string()));
                }
                if let Some(name) = segment.param_name() {
                    if segments.iter().any(|s: &Segment| s.param_name() == Some(name)) {
                        return Err(PatternError::DuplicateParam(name.to_string()));
                    }
                }
                segments.push(segment);
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(Segment::param_name)
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Fallback(_)))
    }
}

fn parse_segment(part: &str) -> Result<Segment, PatternError> {
    if part.is_empty() {
        return Err(PatternError::EmptySegment);
    }
    let (ctor, name): (fn(String) -> Segment, &str) = match part.as_bytes()[0] {
        b':' => (Segment::Param, &part[1..]),
        b'*' => (Segment::Wildcard, &part[1..]),
        b'!' => (Segment::Fallback, &part[1..]),
        _ => return Ok(Segment::Literal(part.to_string())),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(PatternError::InvalidName(part.to_string()));
    }
    Ok(ctor(name.to_string()))
}

impl FromStr for PathPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Split a request path into segments. `/` has none.
pub fn split_path(path: &str) -> Vec<&str> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    if rest.is_empty() {
        Vec::new()
    } else {
        rest.split('/').collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segments() {
        let p = PathPattern::parse("/blog/:id/*path").unwrap();
        assert_eq!(
            p.segments(),
            &[
                Segment::Literal("blog".into()),
                Segment::Param("id".into()),
                Segment::Wildcard("path".into()),
            ]
        );
        assert_eq!(p.param_names().collect::<Vec<_>>(), vec!["id", "path"]);
        assert!(PathPattern::parse("/!fallback").unwrap().is_fallback());
        assert!(PathPattern::parse("/").unwrap().segments().is_empty());
    }

    #[test]
    fn test_rejects_invalid() {
        assert_eq!(PathPattern::parse("blog"), Err(PatternError::MissingLeadingSlash));
        assert_eq!(PathPattern::parse("/blog//x"), Err(PatternError::EmptySegment));
        assert_eq!(PathPattern::parse("/blog/"), Err(PatternError::EmptySegment));
        assert_eq!(
            PathPattern::parse("/*rest/more"),
            Err(PatternError::NotLast("*rest".into()))
        );
        assert_eq!(
            PathPattern::parse("/!rest/more"),
            Err(PatternError::NotLast("!rest".into()))
        );
        assert_eq!(
            PathPattern::parse("/:id/:id"),
            Err(PatternError::DuplicateParam("id".into()))
        );
        assert_eq!(PathPattern::parse("/:"), Err(PatternError::InvalidName(":".into())));
    }

    #[test]
    fn test_split_path() {
        assert!(split_path("/").is_empty());
        assert_eq!(split_path("/a/b"), vec!["a", "b"]);
        assert_eq!(split_path("/a/"), vec!["a", ""]);
    }
}
