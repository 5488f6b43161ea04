//! Key Patterns
//!
//! Glob-style key patterns (`*` any run, `?` any single char) shared by every
//! backend. In-process backends match through a compiled regex; remote
//! backends receive the pattern translated into their own glob dialect.

use regex::Regex;

use crate::error::{CacheError, Result};

/// Pattern matching every key.
pub const MATCH_ALL: &str = "*";

// == Key Pattern ==
/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    regex: Regex,
}

impl KeyPattern {
    /// Compiles a glob pattern.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&glob_to_regex(pattern))
            .map_err(|e| CacheError::InvalidRequest(format!("bad key pattern: {}", e)))?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_match_all(&self) -> bool {
        self.raw == MATCH_ALL
    }

    pub fn matches(&self, key: &str) -> bool {
        self.is_match_all() || self.regex.is_match(key)
    }

    /// Pattern for Redis `SCAN MATCH`, where `[`, `]` and `\` are special.
    pub fn to_redis_glob(&self) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for c in self.raw.chars() {
            if matches!(c, '[' | ']' | '\\') {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }

    /// Pattern for the SQLite `GLOB` operator, where only `[` needs escaping.
    pub fn to_sqlite_glob(&self) -> String {
        self.raw.replace('[', "[[]")
    }
}

/// Convert a glob pattern to an anchored regex
fn glob_to_regex(pattern: &str) -> String {
    let mut regex_str = String::with_capacity(pattern.len() * 2 + 2);
    regex_str.push('^');

    for c in pattern.chars() {
        match c {
            '*' => regex_str.push_str(".*"),
            '?' => regex_str.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\' => {
                regex_str.push('\\');
                regex_str.push(c);
            }
            _ => regex_str.push(c),
        }
    }

    regex_str.push('$');
    regex_str
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_all() {
        let pattern = KeyPattern::new("*").unwrap();
        assert!(pattern.is_match_all());
        assert!(pattern.matches("anything:at:all"));
        assert!(pattern.matches(""));
    }

    #[test]
    fn test_prefix_pattern() {
        let pattern = KeyPattern::new("temp:*").unwrap();
        assert!(pattern.matches("temp:upload:1"));
        assert!(!pattern.matches("session:temp:1"));
    }

    #[test]
    fn test_single_char_wildcard() {
        let pattern = KeyPattern::new("node-?").unwrap();
        assert!(pattern.matches("node-1"));
        assert!(!pattern.matches("node-12"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pattern = KeyPattern::new("search:(rust)+.v1").unwrap();
        assert!(pattern.matches("search:(rust)+.v1"));
        assert!(!pattern.matches("search:rustt.v1"));
    }

    #[test]
    fn test_dialect_translation() {
        let pattern = KeyPattern::new("tech:[a]*").unwrap();
        assert_eq!(pattern.to_redis_glob(), "tech:\\[a\\]*");
        assert_eq!(pattern.to_sqlite_glob(), "tech:[[]a]*");
    }
}
