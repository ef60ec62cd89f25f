//! `BenchSeal` Core Library
//!
//! Shared functionality for `BenchSeal` components:
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Clock source abstraction
//! - Common error types

pub mod clock;
pub mod config;
pub mod error;
pub mod tracing_init;

pub use clock::{ClockSource, FixedClock, SystemClock};
pub use config::{ClientConfig, Config, VerifierConfig};
pub use error::{Error, Result};
