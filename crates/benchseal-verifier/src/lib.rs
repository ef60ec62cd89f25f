//! `BenchSeal` verification server
//!
//! Opens sealed benchmark envelopes with the server private key and decides,
//! stage by stage, whether each one is authentic, fresh, bound to the
//! submitting API key and unmodified. Accepted results are stored once.

pub mod error;
pub mod keystore;
pub mod pipeline;
pub mod replay;
pub mod server;
pub mod service;
pub mod storage;

pub use error::{Result, VerifierError};
pub use keystore::{KeyHandle, KeyRing, PrivateKeyStore};
pub use pipeline::{Stage, StageOutcome, ValidationReport, Verification, VerificationPipeline};
pub use replay::{ReplayGuard, scope_identity};
pub use service::{UploadError, UploadService, UploadStatus};
pub use storage::{ProcessingStatus, ResultDatabase};
