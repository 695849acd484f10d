//! Pipeline configuration.
//!
//! Every runtime toggle lives in one explicit struct that is passed into
//! each component call. Nothing in the pipeline reads the environment ad
//! hoc; `from_env` is the single place `MEDBRIDGE_*` variables are
//! consulted, so tests can construct two configs and assert two outcomes.

use std::env;

use crate::models::OutputFormat;

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Format the model is asked for and parsed with first.
    pub extraction_format: OutputFormat,
    /// Minimum data rows for a record to pass pre-build validation.
    pub min_observations: usize,
    /// Minimum Observation resources for a bundle to pass post-build
    /// validation. Kept separate from `min_observations`: the record
    /// floor gates retries, the bundle floor only gates reporting.
    pub bundle_min_observations: usize,
    /// Require patient name and identifier in pre-build validation.
    pub require_patient: bool,
    /// Enforce the full CBC checklist in pre-build validation.
    pub require_expected_tests: bool,
    /// Retain gender and other inferred demographic fields.
    pub allow_inferred_demographics: bool,
    /// Retain the report date (normalized, year-first only).
    pub allow_report_date: bool,
    /// Derive interpretation flags from reference ranges at build time.
    pub compute_flags: bool,
    /// Permit system/code inside valueQuantity.
    pub allow_vq_codes: bool,
    /// Permit a comparator inside valueQuantity.
    pub allow_vq_comparator: bool,
    /// Reject template placeholder patient names (John/Jane Doe).
    pub strict_placeholders: bool,
    /// Retry budget for the extraction loop.
    pub max_attempts: u32,
    /// The image is re-attached for this many initial attempts.
    pub image_retry_limit: u32,
    /// Abort instead of continuing text-only once the image window is
    /// exhausted.
    pub require_image: bool,
    /// Platelet counts below this (unscaled per-microliter) are treated
    /// as thousands shorthand and rescaled. Zero disables the
    /// correction.
    pub platelet_scale_ceiling: f64,
    /// Relative divergence of an absolute differential count from
    /// WBC × percent before a correction is considered.
    pub differential_divergence: f64,
    /// Relative tolerance within which a ×10 rescale must land for the
    /// correction to apply.
    pub differential_tolerance: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            extraction_format: OutputFormat::Tsv,
            min_observations: 1,
            bundle_min_observations: 3,
            require_patient: true,
            require_expected_tests: false,
            allow_inferred_demographics: false,
            allow_report_date: false,
            compute_flags: true,
            allow_vq_codes: false,
            allow_vq_comparator: false,
            strict_placeholders: true,
            max_attempts: 10,
            image_retry_limit: 1,
            require_image: false,
            platelet_scale_ceiling: 1000.0,
            differential_divergence: 0.25,
            differential_tolerance: 0.10,
        }
    }
}

impl ExtractionConfig {
    /// Build a config from `MEDBRIDGE_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            extraction_format: env::var("MEDBRIDGE_EXTRACTION_FORMAT")
                .map(|v| OutputFormat::parse(&v))
                .unwrap_or(defaults.extraction_format),
            min_observations: env_parse("MEDBRIDGE_MIN_OBSERVATIONS", defaults.min_observations),
            bundle_min_observations: env_parse(
                "MEDBRIDGE_BUNDLE_MIN_OBSERVATIONS",
                defaults.bundle_min_observations,
            ),
            require_patient: env_flag("MEDBRIDGE_REQUIRE_PATIENT", defaults.require_patient),
            require_expected_tests: env_flag(
                "MEDBRIDGE_REQUIRE_EXPECTED_TESTS",
                defaults.require_expected_tests,
            ),
            allow_inferred_demographics: env_flag(
                "MEDBRIDGE_ALLOW_DEMOGRAPHICS",
                defaults.allow_inferred_demographics,
            ),
            allow_report_date: env_flag("MEDBRIDGE_ALLOW_REPORT_DATE", defaults.allow_report_date),
            compute_flags: env_flag("MEDBRIDGE_COMPUTE_FLAGS", defaults.compute_flags),
            allow_vq_codes: env_flag("MEDBRIDGE_ALLOW_VQ_CODES", defaults.allow_vq_codes),
            allow_vq_comparator: env_flag(
                "MEDBRIDGE_ALLOW_VQ_COMPARATOR",
                defaults.allow_vq_comparator,
            ),
            strict_placeholders: env_flag(
                "MEDBRIDGE_STRICT_PLACEHOLDERS",
                defaults.strict_placeholders,
            ),
            max_attempts: env_parse("MEDBRIDGE_MAX_ATTEMPTS", defaults.max_attempts),
            image_retry_limit: env_parse(
                "MEDBRIDGE_IMAGE_RETRY_LIMIT",
                defaults.image_retry_limit,
            ),
            require_image: env_flag("MEDBRIDGE_REQUIRE_IMAGE", defaults.require_image),
            platelet_scale_ceiling: env_parse(
                "MEDBRIDGE_PLATELET_SCALE_CEILING",
                defaults.platelet_scale_ceiling,
            ),
            differential_divergence: env_parse(
                "MEDBRIDGE_DIFFERENTIAL_DIVERGENCE",
                defaults.differential_divergence,
            ),
            differential_tolerance: env_parse(
                "MEDBRIDGE_DIFFERENTIAL_TOLERANCE",
                defaults.differential_tolerance,
            ),
        }
    }
}

/// Truthy values accepted for boolean toggles.
fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
