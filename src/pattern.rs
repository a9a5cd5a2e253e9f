//! Route pattern parsing.
//!
//! Patterns are plain path strings with `:name` parameter segments and an
//! optional trailing `*` wildcard. The engine performs the actual matching;
//! this module only records which positional capture slot each named
//! parameter occupies so request contexts can translate positional values
//! back into names.

use crate::error::ConfigError;

/// A parsed, immutable route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    /// `(name, positional_index)` in declaration order.
    params: Vec<(String, usize)>,
    wildcard: bool,
}

impl RoutePattern {
    /// Parses a pattern string, validating parameter and wildcard placement.
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        if pattern.is_empty() || !pattern.starts_with('/') {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern must begin with '/'".to_string(),
            });
        }

        let segments: Vec<&str> = pattern.split('/').skip(1).collect();
        let mut params = Vec::new();
        let mut wildcard = false;
        for segment in &segments {
            if wildcard {
                return Err(ConfigError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "wildcard is only allowed as the final segment".to_string(),
                });
            }
            if *segment == "*" {
                wildcard = true;
                continue;
            }
            if segment.contains('*') {
                return Err(ConfigError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "'*' may only form a whole segment".to_string(),
                });
            }
            // A parameter segment needs at least two characters after ':'.
            // Duplicate names are legal (mounted prefixes can repeat them);
            // each occurrence owns its own capture slot.
            if segment.starts_with(':') && segment.len() > 2 {
                let index = params.len();
                params.push((segment[1..].to_string(), index));
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            params,
            wildcard,
        })
    }

    /// The original pattern string, as handed to the engine.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Named parameters with their positional capture indices.
    #[must_use]
    pub fn params(&self) -> &[(String, usize)] {
        &self.params
    }

    /// Whether the final segment is a `*` wildcard.
    #[must_use]
    pub fn has_wildcard(&self) -> bool {
        self.wildcard
    }
}

/// Merges a mount prefix with a child pattern, normalizing the joining slash.
#[must_use]
pub fn merge_relative(base: &str, child: &str) -> String {
    if base == "/" && child == "/" {
        return "/".to_string();
    }
    if child == "/" {
        return base.to_string();
    }
    if base == "/" {
        return child.to_string();
    }
    let base = base.strip_suffix('/').unwrap_or(base);
    if child.starts_with('/') {
        format!("{base}{child}")
    } else {
        format!("{base}/{child}")
    }
}
