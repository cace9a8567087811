//! Glob patterns over keys and topic names.

use crate::error::{Error, Result};
use regex::Regex;

/// A `*`/`?` glob compiled to an anchored regex. Every other character,
/// regex metacharacters included, matches itself.
#[derive(Debug, Clone)]
pub(crate) struct GlobPattern {
    glob: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(glob: &str) -> Result<Self> {
        let mut re = String::with_capacity(glob.len() + 8);
        re.push('^');
        let mut literal = String::new();
        for c in glob.chars() {
            match c {
                '*' | '?' => {
                    re.push_str(&regex::escape(&literal));
                    literal.clear();
                    re.push_str(if c == '*' { ".*" } else { "." });
                }
                other => literal.push(other),
            }
        }
        re.push_str(&regex::escape(&literal));
        re.push('$');
        let regex = Regex::new(&re)
            .map_err(|e| Error::Config(format!("invalid pattern {:?}: {}", glob, e)))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    /// Whether `s` contains any wildcard.
    pub fn is_glob(s: &str) -> bool {
        s.contains(['*', '?'])
    }

    pub fn matches(&self, s: &str) -> bool {
        self.regex.is_match(s)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards() {
        let p = GlobPattern::new("orders.*").unwrap();
        assert!(p.matches("orders.created"));
        assert!(p.matches("orders."));
        assert!(!p.matches("order.created"));

        let p = GlobPattern::new("user:?").unwrap();
        assert!(p.matches("user:1"));
        assert!(!p.matches("user:12"));
        assert!(GlobPattern::new("*").unwrap().matches("anything"));
    }

    #[test]
    fn test_metacharacters_are_literal() {
        let p = GlobPattern::new("a.b+(c)").unwrap();
        assert!(p.matches("a.b+(c)"));
        assert!(!p.matches("axb+(c)"));
        assert!(!GlobPattern::is_glob("a.b"));
        assert!(GlobPattern::is_glob("a.*"));
    }
}
