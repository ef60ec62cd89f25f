//! `BenchSeal` CLI Library
//!
//! Client tooling for sealed benchmark results: key generation, sealing,
//! uploading to the verifier, local verification and offline packages.

pub mod client;
pub mod keys_cmd;
pub mod offline_cmd;
pub mod seal_cmd;
pub mod upload_cmd;
pub mod verify_cmd;
