//! Common types for certctl.
//!
//! Shared by the configuration crate and the lifecycle engine:
//!
//! - [`ids`]: identity and operation id newtypes
//! - [`errors`]: the error taxonomy and its exit codes
//! - [`backoff`]: bounded exponential retry policy
//! - [`types`]: key algorithms, challenge kinds, renewal thresholds

pub mod backoff;
pub mod errors;
pub mod ids;
pub mod types;

pub use backoff::{Backoff, BackoffStep, RetryPolicy};
pub use errors::{CertError, CertResult, ErrorKind};
pub use ids::{Identity, OperationId};
pub use types::{ChallengeKind, KeyAlgorithm, RenewalThreshold};
