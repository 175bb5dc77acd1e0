use crate::schema::MIG_0001_INIT;
use crate::{StoreError, Token};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const DB_FILE: &str = "results.db";
const MAX_IDLE_CONNS: usize = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the result store.
///
/// Holds a small pool of SQLite connections. The pool lock only guards
/// checkout and return; concurrent statements run on separate connections and
/// SQLite's own locking orders the writers.
pub struct Db {
    path: PathBuf,
    pool: Mutex<Option<Vec<Connection>>>,
}

impl Db {
    /// Open (creating if needed) the store inside directory `dir`.
    pub fn open_or_create(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        // Refuse to start if tokens cannot be drawn.
        Token::generate()?;
        let path = dir.join(DB_FILE);
        let conn = connect(&path)?;
        migrate(&conn)?;
        info!(path = %path.display(), "opened result store");
        Ok(Db { path, pool: Mutex::new(Some(vec![conn])) })
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Release every pooled connection. Later calls fail with [`StoreError::Closed`];
    /// a statement already running finishes and its connection is dropped.
    pub fn close(&self) {
        let Some(conns) = self.pool.lock().take() else { return };
        for conn in conns {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "error closing store connection");
            }
        }
        info!(path = %self.path.display(), "closed result store");
    }

    pub fn is_closed(&self) -> bool { self.pool.lock().is_none() }

    /// Run `f` on a pooled connection and return the connection to the pool.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let idle = {
            let mut pool = self.pool.lock();
            pool.as_mut().ok_or(StoreError::Closed)?.pop()
        };
        let conn = match idle {
            Some(c) => c,
            None => {
                debug!("opening additional store connection");
                connect(&self.path)?
            }
        };
        let res = f(&conn);
        self.checkin(conn);
        res
    }

    // A connection checked out across `close` is dropped instead of pooled.
    fn checkin(&self, conn: Connection) {
        let mut pool = self.pool.lock();
        if let Some(idle) = pool.as_mut() {
            if idle.len() < MAX_IDLE_CONNS { idle.push(conn); }
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_connections(&self) -> usize {
        self.pool.lock().as_ref().map_or(0, Vec::len)
    }
}

impl Drop for Db {
    fn drop(&mut self) { self.close(); }
}

fn connect(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    apply_pragmas(&conn)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0))?;
    // FULL: a committed put survives power loss, not only a process crash.
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "cache_size", -16384i64)?; // 16 MiB
    Ok(())
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name='results'",
        [],
        |r| r.get(0),
    )?;
    if exists == 0 {
        conn.execute_batch(MIG_0001_INIT)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connections_return_to_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path()).unwrap();
        for _ in 0..3 {
            db.put("ping", b"ok").unwrap();
            assert!(db.count("ping").unwrap() > 0);
        }
        assert_eq!(db.idle_connections(), 1);
        let nested = db.with_conn(|_| db.with_conn(|_| Ok(db.idle_connections()))).unwrap();
        assert_eq!(nested, 0);
        assert_eq!(db.idle_connections(), 2);
    }

    #[test]
    fn closed_store_refuses_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path()).unwrap();
        db.close();
        assert!(matches!(db.with_conn(|_| Ok(())), Err(StoreError::Closed)));
        assert_eq!(db.idle_connections(), 0);
    }
}
