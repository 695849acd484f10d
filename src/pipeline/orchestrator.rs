// Bounded retry loop driving the model through extraction attempts:
// plan image attachment, build the prompt (initial or repair), classify
// the response, and either assemble the bundle or try again.

use uuid::Uuid;

use crate::config::ExtractionConfig;
use crate::models::{AttemptStatus, CanonicalRecord, DocumentType, HistoryEntry};

use super::fhir::{self, Bundle};
use super::prompt::{build_extraction_prompt, build_repair_prompt, EXTRACTION_SYSTEM_PROMPT};
use super::{parser, sanitize, validate, ExtractionError};

/// Raw image bytes handed through to the model client untouched.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub data: Vec<u8>,
    pub mime: String,
}

/// Seam to the external vision model. Implementations own transport,
/// timeouts, and response cleanup (thinking-sentinel stripping).
pub trait VisionClient: Send + Sync {
    fn query(
        &self,
        prompt: &str,
        system: &str,
        image: Option<&ImageAttachment>,
    ) -> Result<String, ExtractionError>;
}

/// Terminal state of one extraction run.
#[derive(Debug)]
pub enum RunOutcome {
    /// Extraction validated and the bundle was assembled. Post-build
    /// defects, if any, are reported but never retried.
    Complete {
        record: CanonicalRecord,
        bundle: Bundle,
        bundle_defects: Vec<String>,
    },
    /// The retry budget ran out; `defects` holds the last attempt's
    /// failure reasons.
    Exhausted { defects: Vec<String> },
}

/// One extraction run's result plus its full audit trail.
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub history: Vec<HistoryEntry>,
}

pub struct Orchestrator {
    client: Box<dyn VisionClient>,
    config: ExtractionConfig,
}

impl Orchestrator {
    pub fn new(client: Box<dyn VisionClient>, config: ExtractionConfig) -> Self {
        Self { client, config }
    }

    /// Run the extraction loop to `done` or `exhausted`. Errors are
    /// reserved for fatal aborts (missing configuration, image required
    /// but the image window is spent); transport failures consume an
    /// attempt as `no_response` instead.
    pub fn run(
        &self,
        doc_type: DocumentType,
        image: Option<&ImageAttachment>,
    ) -> Result<RunReport, ExtractionError> {
        let run_id = Uuid::new_v4();
        let _span =
            tracing::info_span!("extraction_run", run = %run_id, doc_type = ?doc_type).entered();

        let mut history: Vec<HistoryEntry> = Vec::new();
        let mut last_response = String::new();
        let mut defects: Vec<String> = Vec::new();

        for attempt in 1..=self.config.max_attempts {
            let send_image = attempt <= self.config.image_retry_limit;
            if self.config.require_image && !send_image {
                tracing::error!(
                    attempt,
                    image_retry_limit = self.config.image_retry_limit,
                    "extraction requires an image but the retry window is exhausted"
                );
                return Err(ExtractionError::ImageRequired);
            }

            let prompt = if attempt == 1 {
                build_extraction_prompt(doc_type)
            } else {
                build_repair_prompt(
                    &last_response,
                    &defects,
                    &history,
                    self.config.extraction_format,
                )
            };

            tracing::info!(
                attempt,
                max_attempts = self.config.max_attempts,
                send_image,
                "requesting extraction"
            );

            let response = match self.client.query(
                &prompt,
                EXTRACTION_SYSTEM_PROMPT,
                if send_image { image } else { None },
            ) {
                Ok(response) => response,
                Err(e) if e.is_transport() => {
                    defects = vec![format!("no response from model on attempt {attempt}: {e}")];
                    tracing::warn!(attempt, error = %e, "model call failed");
                    history.push(HistoryEntry::new(
                        attempt,
                        AttemptStatus::NoResponse,
                        defects.clone(),
                        "",
                    ));
                    continue;
                }
                Err(e) => return Err(e),
            };

            if response.trim().is_empty() {
                defects = vec![format!("no response from model on attempt {attempt}.")];
                history.push(HistoryEntry::new(
                    attempt,
                    AttemptStatus::NoResponse,
                    defects.clone(),
                    "",
                ));
                continue;
            }
            last_response = response;

            let parsed = parser::parse_extraction(
                &last_response,
                doc_type,
                self.config.extraction_format,
            );
            let Some(mut record) = parsed else {
                defects = vec!["Invalid JSON/TSV: no parseable data found.".to_string()];
                tracing::warn!(attempt, "response did not parse");
                history.push(HistoryEntry::new(
                    attempt,
                    AttemptStatus::InvalidJson,
                    defects.clone(),
                    &last_response,
                ));
                continue;
            };

            if record.patient.modality.is_none() {
                record.patient.modality = Some(doc_type.modality().to_string());
            }

            let record = sanitize::sanitize_record(record, &self.config);
            defects = validate::validate_record(&record, &self.config);
            if !defects.is_empty() {
                tracing::warn!(
                    attempt,
                    defect_count = defects.len(),
                    "extraction failed validation: {}",
                    defects.join("; ")
                );
                history.push(HistoryEntry::new(
                    attempt,
                    AttemptStatus::InvalidExtraction,
                    defects.clone(),
                    &last_response,
                ));
                continue;
            }

            history.push(HistoryEntry::new(attempt, AttemptStatus::Ok, Vec::new(), ""));
            tracing::info!(attempt, "extraction passed, building bundle");

            // The retry budget governs extraction only: a bundle that
            // fails post-build validation is reported, not retried.
            let mut bundle = fhir::build_bundle(&record, &self.config);
            fhir::ensure_interpretation_from_range(&mut bundle);
            let bundle_defects = validate::validate_bundle(&bundle.to_value(), &self.config);
            if !bundle_defects.is_empty() {
                tracing::error!(
                    defect_count = bundle_defects.len(),
                    "bundle failed post-build validation: {}",
                    bundle_defects.join("; ")
                );
            }

            return Ok(RunReport {
                outcome: RunOutcome::Complete {
                    record,
                    bundle,
                    bundle_defects,
                },
                history,
            });
        }

        tracing::error!(
            max_attempts = self.config.max_attempts,
            "failed to extract structured data within the retry budget"
        );
        Ok(RunReport {
            outcome: RunOutcome::Exhausted { defects },
            history,
        })
    }
}
