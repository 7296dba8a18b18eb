//! Vendor endpoint conventions. Each module knows how to address a model,
//! authenticate, and read a submission acknowledgement.

pub mod fal;
pub mod replicate;

use serde_json::Value;

/// A provider's acknowledgement of an accepted job
#[derive(Debug, Clone)]
pub struct Submission {
    pub upstream_id: String,
    pub status_url: String,
    pub response_url: Option<String>,
    /// The submission already carries the final result (Fal sync mode)
    pub terminal: bool,
    pub raw: Value,
}
