//! SignalK path parsing and matching.
//!
//! SignalK paths are dot-separated strings like "navigation.speedOverGround".
//! The aggregator walks parsed [`Path`]s when merging values, and the
//! provider path filter drops values matching a [`PathPattern`].

use thiserror::Error;

/// Errors produced while parsing paths and patterns.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PathError {
    #[error("Empty pattern")]
    EmptyPattern,

    #[error("Empty segment in path '{0}'")]
    EmptySegment(String),
}

/// A parsed SignalK path.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    raw: String,
    segments: Vec<String>,
}

impl Path {
    /// Parse a non-empty path. Every dot-separated segment must be non-empty.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let segments: Vec<String> = path.split('.').map(String::from).collect();
        if segments.iter().any(String::is_empty) {
            return Err(PathError::EmptySegment(path.to_string()));
        }
        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Split off the last segment.
    pub fn split_last(&self) -> (&[String], &str) {
        let (last, parents) = self
            .segments
            .split_last()
            .map(|(last, parents)| (last.as_str(), parents))
            .unwrap_or(("", &[]));
        (parents, last)
    }

    pub fn starts_with(&self, prefix: &Path) -> bool {
        prefix.segments.len() <= self.segments.len()
            && self.segments.iter().zip(&prefix.segments).all(|(a, b)| a == b)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PatternSegment {
    Literal(String),
    /// `*`: one segment mid-path, any suffix at the end
    Wildcard,
}

/// A path pattern that may contain wildcards.
///
/// - Exact: "navigation.speedOverGround"
/// - Suffix wildcard: "notifications.*"
/// - Mid-path wildcard: "propulsion.*.revolutions"
/// - Full wildcard: "*"
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<PatternSegment>,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self, PathError> {
        if pattern.is_empty() {
            return Err(PathError::EmptyPattern);
        }
        let segments = pattern
            .split('.')
            .map(|s| match s {
                "*" => PatternSegment::Wildcard,
                literal => PatternSegment::Literal(literal.to_string()),
            })
            .collect();
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('.').collect();
        let trailing = matches!(self.segments.last(), Some(PatternSegment::Wildcard));
        let fixed = if trailing {
            &self.segments[..self.segments.len() - 1]
        } else {
            &self.segments[..]
        };

        if trailing {
            if parts.len() < fixed.len() {
                return false;
            }
        } else if parts.len() != fixed.len() {
            return false;
        }

        fixed.iter().zip(&parts).all(|(segment, part)| match segment {
            PatternSegment::Literal(lit) => lit == part,
            PatternSegment::Wildcard => !part.is_empty(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_parsing() {
        let path = Path::parse("navigation.speedOverGround").unwrap();
        assert_eq!(path.segments(), &["navigation", "speedOverGround"]);
        assert_eq!(path.split_last().1, "speedOverGround");
    }

    #[test]
    fn test_path_rejects_empty_segments() {
        assert!(matches!(
            Path::parse("navigation..position"),
            Err(PathError::EmptySegment(_))
        ));
        assert!(Path::parse("").is_err());
    }

    #[test]
    fn test_path_starts_with() {
        let path = Path::parse("navigation.speedOverGround").unwrap();
        assert!(path.starts_with(&Path::parse("navigation").unwrap()));
        assert!(!path.starts_with(&Path::parse("propulsion").unwrap()));
    }

    #[test]
    fn test_exact_pattern() {
        let pattern = PathPattern::new("navigation.speedOverGround").unwrap();
        assert!(pattern.matches("navigation.speedOverGround"));
        assert!(!pattern.matches("navigation.courseOverGroundTrue"));
        assert!(!pattern.matches("navigation"));
    }

    #[test]
    fn test_suffix_wildcard() {
        let pattern = PathPattern::new("notifications.*").unwrap();
        assert!(pattern.matches("notifications.propulsion.0.overTemperature"));
        assert!(!pattern.matches("navigation.position"));
    }

    #[test]
    fn test_mid_path_wildcard() {
        let pattern = PathPattern::new("propulsion.*.revolutions").unwrap();
        assert!(pattern.matches("propulsion.port.revolutions"));
        assert!(!pattern.matches("propulsion.port.oilPressure"));
        assert!(!pattern.matches("propulsion.revolutions"));
    }

    #[test]
    fn test_full_wildcard() {
        let pattern = PathPattern::new("*").unwrap();
        assert!(pattern.matches("anything.at.all"));
        assert!(PathPattern::new("").is_err());
    }
}
