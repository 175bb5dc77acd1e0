use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use std::fmt;

/// Random bytes per token.
pub const TOKEN_BYTES: usize = 6;
/// Length of a token's hex form.
pub const TOKEN_LEN: usize = TOKEN_BYTES * 2;

/// Identifier of one stored result: 12 lowercase hex characters drawn from
/// the operating system's CSPRNG.
///
/// Tokens act as unauthenticated share links, so they must be unpredictable.
/// Uniqueness rests on the 2^48 space alone; nothing checks for collisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Draw a fresh token. Fails only if the OS entropy source fails; there is
    /// no fallback to a weaker generator.
    pub fn generate() -> Result<Self, rand::Error> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(Token(hex::encode(bytes)))
    }

    /// Accept only the exact form `generate` produces.
    pub fn parse(s: &str) -> Option<Self> {
        let well_formed = s.len() == TOKEN_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        well_formed.then(|| Token(s.to_string()))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_tokens_are_well_formed() {
        let t = Token::generate().unwrap();
        assert_eq!(t.as_str().len(), TOKEN_LEN);
        assert_eq!(Token::parse(t.as_str()), Some(t));
    }

    #[test]
    fn no_collisions_in_large_sample() {
        let mut seen = HashSet::with_capacity(100_000);
        for _ in 0..100_000 {
            assert!(seen.insert(Token::generate().unwrap()));
        }
    }

    #[test]
    fn parse_rejects_other_shapes() {
        assert!(Token::parse("").is_none());
        assert!(Token::parse("0123456789a").is_none());
        assert!(Token::parse("0123456789abc").is_none());
        assert!(Token::parse("0123456789AB").is_none());
        assert!(Token::parse("../../etc/pa").is_none());
        assert!(Token::parse("0123456789ab").is_some());
    }
}
