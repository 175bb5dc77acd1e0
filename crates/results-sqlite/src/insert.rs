use crate::{Db, StoreError, Token};
use rusqlite::params;
use time::OffsetDateTime;
use tracing::debug;

/// `category ++ token`; tokens are fixed-width so no separator is needed.
pub(crate) fn result_key(category: &str, token: &Token) -> Vec<u8> {
    let mut key = Vec::with_capacity(category.len() + token.as_str().len());
    key.extend_from_slice(category.as_bytes());
    key.extend_from_slice(token.as_str().as_bytes());
    key
}

pub(crate) fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

impl Db {
    /// Store `payload` under a freshly generated token and return the token.
    /// The write is committed before this returns.
    ///
    /// A token collision is not retried: the insert fails with a constraint
    /// error instead of replacing the earlier result.
    pub fn put(&self, category: &str, payload: &[u8]) -> Result<Token, StoreError> {
        let token = Token::generate()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO results(key, category, payload, stored_ms) VALUES (?1, ?2, ?3, ?4)",
                params![result_key(category, &token), category, payload, now_ms()],
            )?;
            Ok(())
        })?;
        debug!(category, token = %token, size = payload.len(), "stored result");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn identical_payloads_get_distinct_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path()).unwrap();
        let a = db.put("ping", b"same").unwrap();
        let b = db.put("ping", b"same").unwrap();
        assert_ne!(a, b);
        assert_eq!(db.count("ping").unwrap(), 2);
    }

    #[test]
    fn concurrent_writers_do_not_cross_talk() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open_or_create(dir.path()).unwrap());
        let written: Vec<(Token, Vec<u8>)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let db = db.clone();
                    s.spawn(move || {
                        (0..25)
                            .map(|j| {
                                let payload = format!("writer {i} result {j}").into_bytes();
                                (db.put("dig", &payload).unwrap(), payload)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        let tokens: HashSet<_> = written.iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(tokens.len(), written.len());
        for (token, payload) in &written {
            assert_eq!(db.get("dig", token.as_str()).unwrap().as_deref(), Some(payload.as_slice()));
        }
    }

    #[test]
    fn put_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path()).unwrap();
        db.close();
        assert!(db.is_closed());
        assert!(matches!(db.put("ping", b"x"), Err(StoreError::Closed)));
    }
}
