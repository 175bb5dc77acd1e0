//! Durable storage of diagnostic output keyed by category and a random token.

mod error;
mod open;
mod models;
mod insert;
mod query;
mod schema;
mod token;

pub use error::StoreError;
pub use open::Db;
pub use models::*;
pub use token::{Token, TOKEN_BYTES, TOKEN_LEN};
