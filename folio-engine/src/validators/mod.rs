//! Response validation for folio-engine
//!
//! Everything an AI provider returns passes through here before it can
//! enter the pipeline; garbage, truncated, and error-disguised-as-content
//! responses are rejected with machine-readable codes.

pub mod outline;
pub mod response;

pub use response::{KeywordErrorDetector, ResponseValidator};
