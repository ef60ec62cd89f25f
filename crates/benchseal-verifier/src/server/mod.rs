//! HTTP surface of the verifier.

mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::{API_KEY_HEADER, AppState, build_router};
