//! A network looking glass: run fixed diagnostics against a target and keep
//! the output behind an unguessable share link.

pub mod config;
pub mod http;
pub mod jobs;

pub use jobs::{JobError, Jobs};
