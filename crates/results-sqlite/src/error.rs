#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("entropy source failed: {0}")]
    Entropy(#[from] rand::Error),
    #[error("result store is closed")]
    Closed,
}
