use serde::{Deserialize, Serialize};

/// Document-type hint produced by the upstream classification step.
/// Selects the prompt template and the expected TSV column layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    LabReport,
    RadiologyReport,
    Prescription,
    Vitals,
}

impl DocumentType {
    /// Parse a free-form classifier response into a document type.
    /// Unrecognized input defaults to a lab report, the most common case.
    pub fn from_hint(hint: &str) -> Self {
        let upper = hint.trim().to_uppercase();
        if upper.contains("RADIOLOGY") || upper.contains("X-RAY") || upper.contains("MRI") {
            DocumentType::RadiologyReport
        } else if upper.contains("PRESCRIPTION") || upper.contains("MEDICATION") {
            DocumentType::Prescription
        } else if upper.contains("VITALS") {
            DocumentType::Vitals
        } else {
            DocumentType::LabReport
        }
    }

    /// Modality tag injected into the patient record when the model
    /// omitted an explicit MODALITY metadata line.
    pub fn modality(&self) -> &'static str {
        match self {
            DocumentType::LabReport => "LAB",
            DocumentType::RadiologyReport => "X-RAY",
            DocumentType::Prescription => "MEDS",
            DocumentType::Vitals => "VITALS",
        }
    }
}

/// Which format the model was asked to emit. TSV is the primary format;
/// JSON is kept as a legacy fallback. The parser always tries both,
/// starting with the preferred one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Tsv,
    Json,
}

impl OutputFormat {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Tsv,
        }
    }
}

/// Administrative gender, restricted to the FHIR value set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
    Unknown,
}

impl Gender {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "male" => Some(Gender::Male),
            "female" => Some(Gender::Female),
            "other" => Some(Gender::Other),
            "unknown" => Some(Gender::Unknown),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
            Gender::Unknown => "unknown",
        }
    }
}

/// Abnormal-result flag on an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbnormalFlag {
    #[serde(rename = "H")]
    High,
    #[serde(rename = "L")]
    Low,
}

impl AbnormalFlag {
    /// Fold the many spellings models emit ("High", "[H]", "ABN", "lo", …)
    /// into the two canonical flags. Anything else is treated as no flag.
    pub fn from_token(raw: &str) -> Option<Self> {
        let token = raw.replace(['[', ']'], "");
        match token.trim().to_uppercase().as_str() {
            "H" | "HIGH" | "HI" | "A" | "ABN" | "ABNORMAL" => Some(AbnormalFlag::High),
            "L" | "LOW" | "LO" => Some(AbnormalFlag::Low),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AbnormalFlag::High => "H",
            AbnormalFlag::Low => "L",
        }
    }
}

/// Outcome classification of one extraction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Ok,
    NoResponse,
    InvalidJson,
    InvalidExtraction,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Ok => "ok",
            AttemptStatus::NoResponse => "no_response",
            AttemptStatus::InvalidJson => "invalid_json",
            AttemptStatus::InvalidExtraction => "invalid_extraction",
        }
    }
}
