// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Key Patterns
//!
//! Topic-exchange binding patterns. Keys are split into words on `.`; in a
//! pattern `*` stands for exactly one word and `#` for zero or more words.

use std::fmt;

pub const ROUTING_KEY_DELIMITER: char = '.';
pub const SINGLE_WORD_WILDCARD: &str = "*";
pub const MULTI_WORD_WILDCARD: &str = "#";

/// A binding pattern such as `orders.*` or `audit.#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingPattern(String);

impl RoutingPattern {
    /// Wraps a pattern. Words are split on `.`; no validation is done.
    pub fn new(pattern: impl Into<String>) -> Self {
        RoutingPattern(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a message published with `routing_key` would be routed
    /// through a topic binding with this pattern.
    pub fn matches(&self, routing_key: &str) -> bool {
        let pattern: Vec<&str> = self.0.split(ROUTING_KEY_DELIMITER).collect();
        let key: Vec<&str> = routing_key.split(ROUTING_KEY_DELIMITER).collect();

        matches_words(&pattern, &key)
    }
}

/// Table-driven match: `next[j]` holds whether the remaining pattern words
/// match `key[j..]`. Runs in `pattern.len() * key.len()` steps.
fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    let mut next = vec![false; key.len() + 1];
    next[key.len()] = true;

    for word in pattern.iter().rev() {
        let mut current = vec![false; key.len() + 1];

        for j in (0..=key.len()).rev() {
            current[j] = match *word {
                MULTI_WORD_WILDCARD => next[j] || (j < key.len() && current[j + 1]),
                SINGLE_WORD_WILDCARD => j < key.len() && next[j + 1],
                literal => j < key.len() && key[j] == literal && next[j + 1],
            };
        }

        next = current;
    }

    next[0]
}

impl fmt::Display for RoutingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoutingPattern {
    fn from(value: &str) -> Self {
        RoutingPattern::new(value)
    }
}

impl From<String> for RoutingPattern {
    fn from(value: String) -> Self {
        RoutingPattern(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_exactly_one_word() {
        let pattern = RoutingPattern::new("test.*");

        assert!(pattern.matches("test.created"));
        assert!(!pattern.matches("test.created.extra"));
        assert!(!pattern.matches("other.created"));
        assert!(!pattern.matches("test"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        let pattern = RoutingPattern::new("audit.#");

        assert!(pattern.matches("audit"));
        assert!(pattern.matches("audit.user"));
        assert!(pattern.matches("audit.user.deleted"));
        assert!(!pattern.matches("billing.user"));
    }

    #[test]
    fn hash_in_the_middle_backtracks() {
        let pattern = RoutingPattern::new("a.#.z");

        assert!(pattern.matches("a.z"));
        assert!(pattern.matches("a.b.c.z"));
        assert!(!pattern.matches("a.b.c"));
    }

    #[test]
    fn literal_patterns_need_an_exact_key() {
        let pattern = RoutingPattern::new("orders.created");

        assert!(pattern.matches("orders.created"));
        assert!(!pattern.matches("orders.created.v2"));
        assert!(RoutingPattern::new("#").matches("anything.at.all"));
    }

    #[test]
    fn repeated_hashes_match_long_keys_quickly() {
        let pattern = RoutingPattern::new("#.#.#.#.#.#.#.#.#.z");
        let miss = vec!["a"; 40].join(".");
        let hit = format!("{}.z", miss);

        let started = std::time::Instant::now();
        assert!(!pattern.matches(&miss));
        assert!(pattern.matches(&hit));
        assert!(started.elapsed() < std::time::Duration::from_millis(100));
    }

    #[test]
    fn adjacent_wildcards_combine() {
        let pattern = RoutingPattern::new("*.#.*");

        assert!(!pattern.matches("a"));
        assert!(pattern.matches("a.b"));
        assert!(pattern.matches("a.b.c.d"));
        assert!(RoutingPattern::new("#.#").matches("x"));
    }
}
