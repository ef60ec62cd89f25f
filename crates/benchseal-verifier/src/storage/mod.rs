//! `SQLite` storage for the verifier.
//!
//! Provides persistence for upload processing state and accepted results.

mod db;
mod models;
mod queries;

pub use db::{DatabaseError, ResultDatabase};
pub use models::*;
pub use queries::SavedResult;
