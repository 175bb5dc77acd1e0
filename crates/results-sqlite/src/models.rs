use serde::Serialize;

use crate::Token;

/// Listing entry for a stored result; the payload is fetched separately.
#[derive(Debug, Clone, Serialize)]
pub struct ResultSummary {
    pub token: Token,
    pub size: usize,
    pub stored_ms: i64,
}
