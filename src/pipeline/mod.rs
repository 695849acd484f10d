pub mod canonical;
pub mod client;
pub mod fhir;
pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod sanitize;
pub mod validate;

pub use client::{ClientConfig, HttpVisionClient, MockVisionClient};
pub use fhir::{build_bundle, ensure_interpretation_from_range, Bundle};
pub use orchestrator::{ImageAttachment, Orchestrator, RunOutcome, RunReport, VisionClient};
pub use parser::parse_extraction;
pub use sanitize::sanitize_record;
pub use validate::{validate_bundle, validate_record};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("missing configuration: {0}")]
    Config(String),

    #[error("model endpoint unreachable at {0}")]
    Connection(String),

    #[error("model endpoint returned error (status {status}): {body}")]
    Endpoint { status: u16, body: String },

    #[error("model request timed out after {0}s")]
    Timeout(u64),

    #[error("malformed model response: {0}")]
    ResponseParsing(String),

    #[error("extraction requires an image, but the image retry window is exhausted")]
    ImageRequired,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExtractionError {
    /// Transport-class failures are consumed by the retry loop as a
    /// `no_response` attempt; everything else aborts the run.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ExtractionError::Connection(_)
                | ExtractionError::Endpoint { .. }
                | ExtractionError::Timeout(_)
                | ExtractionError::ResponseParsing(_)
        )
    }
}
