//! Core utilities and shared types for the looking glass.

pub mod ratelimiter;
pub mod runner;

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Longest accepted target, in bytes, after trimming.
pub const MAX_TARGET_LEN: usize = 255;
/// Most whitespace-separated words a target may carry.
pub const MAX_TARGET_WORDS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("target is empty")]
    Empty,
    #[error("target is longer than {MAX_TARGET_LEN} bytes")]
    TooLong,
    #[error("target has more than {MAX_TARGET_WORDS} words")]
    TooManyWords,
    #[error("target must be a single word")]
    NotSingleWord,
    #[error("invalid characters in {0:?}")]
    InvalidWord(String),
    #[error("{0:?} looks like a command-line option")]
    OptionLike(String),
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._:@+/=-]+$").expect("static regex"))
}

/// A user-supplied diagnostic target that passed validation.
///
/// Surrounding whitespace is trimmed; inner whitespace separates words. Every
/// word is restricted to hostname/address/query characters and may not start
/// with `-`, so a target can be handed to a program as argv without being
/// mistaken for a flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target(String);

impl Target {
    pub fn parse(raw: &str) -> Result<Self, TargetError> {
        let t = raw.trim();
        if t.is_empty() { return Err(TargetError::Empty); }
        if t.len() > MAX_TARGET_LEN { return Err(TargetError::TooLong); }
        let words: Vec<&str> = t.split_whitespace().collect();
        if words.len() > MAX_TARGET_WORDS { return Err(TargetError::TooManyWords); }
        for w in &words {
            if w.starts_with('-') { return Err(TargetError::OptionLike(w.to_string())); }
            if !word_re().is_match(w) { return Err(TargetError::InvalidWord(w.to_string())); }
        }
        Ok(Target(words.join(" ")))
    }

    /// Like [`Target::parse`] but rejects anything with more than one word.
    pub fn parse_single(raw: &str) -> Result<Self, TargetError> {
        let t = Self::parse(raw)?;
        if t.0.contains(' ') { return Err(TargetError::NotSingleWord); }
        Ok(t)
    }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn words(&self) -> impl Iterator<Item = &str> { self.0.split(' ') }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }

    #[test]
    fn trims_and_normalizes_whitespace() {
        let t = Target::parse("  example.com   MX \n").unwrap();
        assert_eq!(t.as_str(), "example.com MX");
        assert_eq!(t.words().collect::<Vec<_>>(), vec!["example.com", "MX"]);
    }

    #[test]
    fn accepts_addresses_and_dig_syntax() {
        assert!(Target::parse_single("2001:db8::1").is_ok());
        assert!(Target::parse_single("192.0.2.10").is_ok());
        assert!(Target::parse("@1.1.1.1 example.org AAAA +short").is_ok());
    }

    #[test]
    fn rejects_empty_and_blank() {
        assert_eq!(Target::parse(""), Err(TargetError::Empty));
        assert_eq!(Target::parse("   \t"), Err(TargetError::Empty));
    }

    #[test]
    fn rejects_option_injection_and_shell_chars() {
        assert!(matches!(Target::parse("-f /etc/passwd"), Err(TargetError::OptionLike(_))));
        assert!(matches!(Target::parse("example.com;reboot"), Err(TargetError::InvalidWord(_))));
        assert!(matches!(Target::parse("$(id)"), Err(TargetError::InvalidWord(_))));
    }

    #[test]
    fn enforces_limits() {
        assert_eq!(Target::parse(&"a".repeat(MAX_TARGET_LEN + 1)), Err(TargetError::TooLong));
        assert_eq!(Target::parse("a b c d e f g h i"), Err(TargetError::TooManyWords));
        assert_eq!(Target::parse_single("example.com MX"), Err(TargetError::NotSingleWord));
    }
}
