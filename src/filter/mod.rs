//! Allow/block request filtering.
//!
//! Decisions are case-sensitive substring checks over the raw URL string;
//! there is no scheme/host/path decomposition. The empty-rule asymmetry is
//! deliberate policy: an empty allow-list denies everything, an empty
//! block-list allows everything.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Filtering policy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Only URLs matching at least one pattern pass.
    Allow,
    /// URLs matching any pattern are rejected.
    Block,
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterMode::Allow => write!(f, "allow"),
            FilterMode::Block => write!(f, "block"),
        }
    }
}

/// Rejected filter-mode text, carrying what was supplied.
#[derive(Error, Debug)]
#[error("unknown filter mode '{0}' (expected allow or block)")]
pub struct InvalidFilterMode(String);

impl FromStr for FilterMode {
    type Err = InvalidFilterMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(FilterMode::Allow),
            "block" => Ok(FilterMode::Block),
            _ => Err(InvalidFilterMode(s.to_string())),
        }
    }
}

/// A pattern list plus its mode. Immutable for the lifetime of the engine
/// built from it; configuration changes construct a new engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub mode: FilterMode,
    pub patterns: Vec<String>,
}

impl FilterRule {
    pub fn allow(patterns: Vec<String>) -> Self {
        FilterRule {
            mode: FilterMode::Allow,
            patterns,
        }
    }

    pub fn block(patterns: Vec<String>) -> Self {
        FilterRule {
            mode: FilterMode::Block,
            patterns,
        }
    }
}

/// Evaluates request targets against one immutable rule set.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    rule: FilterRule,
}

impl FilterEngine {
    pub fn new(rule: FilterRule) -> Self {
        FilterEngine { rule }
    }

    pub fn mode(&self) -> FilterMode {
        self.rule.mode
    }

    pub fn pattern_count(&self) -> usize {
        self.rule.patterns.len()
    }

    /// Returns true when the request may proceed.
    pub fn decide(&self, url: &str) -> bool {
        let matched = self
            .rule
            .patterns
            .iter()
            .any(|pattern| url.contains(pattern.as_str()));
        match self.rule.mode {
            FilterMode::Allow => matched,
            FilterMode::Block => !matched,
        }
    }
}
