//! Glob matching for permission patterns.
//!
//! `*` matches any run of characters (including none), `?` exactly one.
//! Everything else is literal. Matching is anchored and case-sensitive.

use log::warn;
use regex::Regex;

fn to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?s)^");
    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if ch == '*' { ".*" } else { "." });
            }
            _ => literal.push(ch),
        }
    }
    out.push_str(&regex::escape(&literal));
    out.push('$');
    out
}

pub fn matches(input: &str, pattern: &str) -> bool {
    match Regex::new(&to_regex(pattern)) {
        Ok(re) => re.is_match(input),
        Err(e) => {
            warn!("Invalid wildcard pattern: pattern={}, error={}", pattern, e);
            false
        }
    }
}

/// True when `input` matches at least one of `patterns`.
pub fn matches_any<'a>(input: &str, patterns: impl IntoIterator<Item = &'a String>) -> bool {
    patterns.into_iter().any(|p| matches(input, p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_and_question_mark() {
        assert!(matches("git status", "git *"));
        assert!(matches("git ", "git *"));
        assert!(!matches("git", "git *"));
        assert!(matches("ls -a", "ls -?"));
        assert!(!matches("ls -al", "ls -?"));
        assert!(matches("anything", "*"));
    }

    #[test]
    fn metacharacters_are_literal() {
        assert!(matches("a.b", "a.b"));
        assert!(!matches("axb", "a.b"));
        assert!(matches("rm (x)+[y]", "rm (x)+[y]"));
        assert!(matches("cost $5 ^", "cost $* ^"));
    }

    #[test]
    fn anchored_and_case_sensitive() {
        assert!(!matches("sudo git push", "git *"));
        assert!(!matches("Git push", "git *"));
        assert!(matches("line1\nline2", "line1*"));
    }
}
