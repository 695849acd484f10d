use serde::{Deserialize, Deserializer, Serialize};

use super::enums::{AbnormalFlag, AttemptStatus, Gender};

/// Maximum raw model output kept per audit entry.
const MAX_AUDIT_OUTPUT: usize = 1000;

/// An observation value as the model reported it: numeric when it parses,
/// free text otherwise (radiology findings, "Verified", …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObsValue {
    Number(f64),
    Text(String),
}

impl ObsValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ObsValue::Number(n) => Some(*n),
            ObsValue::Text(_) => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            ObsValue::Number(_) => false,
            ObsValue::Text(t) => t.trim().is_empty(),
        }
    }
}

impl std::fmt::Display for ObsValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObsValue::Number(n) => write!(f, "{n}"),
            ObsValue::Text(t) => write!(f, "{t}"),
        }
    }
}

impl From<f64> for ObsValue {
    fn from(n: f64) -> Self {
        ObsValue::Number(n)
    }
}

impl From<&str> for ObsValue {
    fn from(t: &str) -> Self {
        ObsValue::Text(t.to_string())
    }
}

/// A single measurement in canonical form. Field aliases cover both the
/// full and the abbreviated JSON schemas the model may emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(alias = "test", alias = "analyte", alias = "n")]
    pub name: String,
    #[serde(alias = "result", alias = "v")]
    pub value: ObsValue,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "u")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "low", alias = "lo")]
    pub ref_low: Option<ObsValue>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "high", alias = "hi")]
    pub ref_high: Option<ObsValue>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "fl",
        deserialize_with = "de_flag"
    )]
    pub flag: Option<AbnormalFlag>,
}

impl Observation {
    pub fn new(name: &str, value: impl Into<ObsValue>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            unit: None,
            ref_low: None,
            ref_high: None,
            flag: None,
        }
    }
}

/// Patient name: a raw string straight out of metadata, or the structured
/// form. Sanitization always leaves the structured form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HumanName {
    Structured(StructuredName),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructuredName {
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "de_string_or_seq"
    )]
    pub given: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    #[serde(default = "default_patient_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<HumanName>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_gender"
    )]
    pub gender: Option<Gender>,
    #[serde(default, rename = "birthDate", skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "id2")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modality: Option<String>,
}

impl Default for Patient {
    fn default() -> Self {
        Self {
            id: default_patient_id(),
            name: None,
            gender: None,
            birth_date: None,
            identifier: None,
            modality: None,
        }
    }
}

fn default_patient_id() -> String {
    "patient-1".to_string()
}

/// The pipeline's normalized in-memory representation, prior to FHIR
/// bundle assembly. Lives only for the duration of one extraction run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalRecord {
    #[serde(default, alias = "p")]
    pub patient: Patient,
    #[serde(default, alias = "obs")]
    pub observations: Vec<Observation>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "d")]
    pub report_date: Option<String>,
}

/// One entry of the per-run audit trail, consumed by the repair-prompt
/// builder. Never persisted beyond the run.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub attempt: u32,
    pub status: AttemptStatus,
    pub errors: Vec<String>,
    pub output: String,
}

impl HistoryEntry {
    pub fn new(attempt: u32, status: AttemptStatus, errors: Vec<String>, output: &str) -> Self {
        Self {
            attempt,
            status,
            errors,
            output: output.chars().take(MAX_AUDIT_OUTPUT).collect(),
        }
    }
}

/// Lenient flag decoding: any unrecognized token becomes "no flag"
/// rather than a decode failure.
fn de_flag<'de, D>(deserializer: D) -> Result<Option<AbnormalFlag>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(AbnormalFlag::from_token))
}

/// Lenient gender decoding against the fixed FHIR value set.
fn de_gender<'de, D>(deserializer: D) -> Result<Option<Gender>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(Gender::parse))
}

/// Accept `"given": "John"` as well as `"given": ["John"]`.
fn de_string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrSeq {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<StringOrSeq>::deserialize(deserializer)? {
        Some(StringOrSeq::One(s)) => vec![s],
        Some(StringOrSeq::Many(v)) => v,
        None => vec![],
    })
}
