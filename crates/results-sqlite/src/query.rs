use crate::insert::result_key;
use crate::{Db, ResultSummary, StoreError, Token};
use rusqlite::{params, OptionalExtension};

impl Db {
    /// Fetch a stored payload. Unknown or malformed identifiers are `Ok(None)`;
    /// errors mean the store itself failed.
    pub fn get(&self, category: &str, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(token) = Token::parse(id) else { return Ok(None) };
        self.with_conn(|conn| {
            let payload = conn
                .query_row(
                    "SELECT payload FROM results WHERE key = ?1",
                    [result_key(category, &token)],
                    |r| r.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(payload)
        })
    }

    /// Most recent results in a category, newest first.
    pub fn list(&self, category: &str, limit: usize) -> Result<Vec<ResultSummary>, StoreError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT substr(key, ?1), length(payload), stored_ms FROM results
                 WHERE category = ?2 ORDER BY stored_ms DESC, rowid DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![category.len() as i64 + 1, category, limit as i64], |r| {
                    Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        let mut out = Vec::with_capacity(rows.len());
        for (raw, size, stored_ms) in rows {
            let Some(token) = std::str::from_utf8(&raw).ok().and_then(Token::parse) else { continue };
            out.push(ResultSummary { token, size: size as usize, stored_ms });
        }
        Ok(out)
    }

    pub fn count(&self, category: &str) -> Result<u64, StoreError> {
        let n: i64 = self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(1) FROM results WHERE category = ?1", [category], |r| r.get(0))?)
        })?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path()).unwrap();
        let token = db.put("ping", b"4 packets transmitted, 4 received").unwrap();
        assert_eq!(db.get("ping", token.as_str()).unwrap().unwrap(), b"4 packets transmitted, 4 received");
    }

    #[test]
    fn missing_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path()).unwrap();
        assert_eq!(db.get("ping", "0123456789ab").unwrap(), None);
        assert_eq!(db.get("ping", "not-a-token").unwrap(), None);
    }

    #[test]
    fn empty_payload_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path()).unwrap();
        let token = db.put("host", b"").unwrap();
        assert_eq!(db.get("host", token.as_str()).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn categories_do_not_share_keys() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path()).unwrap();
        let token = db.put("whois", b"registrar").unwrap();
        assert_eq!(db.get("dig", token.as_str()).unwrap(), None);
        assert!(db.list("dig", 10).unwrap().is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let token = {
            let db = Db::open_or_create(dir.path()).unwrap();
            let t = db.put("traceroute", b"1. 192.0.2.1").unwrap();
            db.close();
            t
        };
        let db = Db::open_or_create(dir.path()).unwrap();
        assert_eq!(db.get("traceroute", token.as_str()).unwrap().unwrap(), b"1. 192.0.2.1");
    }

    #[test]
    fn list_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path()).unwrap();
        let first = db.put("ping", b"one").unwrap();
        let second = db.put("ping", b"three").unwrap();
        db.put("dig", b"other").unwrap();
        let listed = db.list("ping", 10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].token, second);
        assert_eq!(listed[0].size, 5);
        assert_eq!(listed[1].token, first);
        assert_eq!(db.list("ping", 1).unwrap().len(), 1);
    }

    #[test]
    fn get_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path()).unwrap();
        let token = db.put("ping", b"x").unwrap();
        db.close();
        assert!(matches!(db.get("ping", token.as_str()), Err(StoreError::Closed)));
    }
}
