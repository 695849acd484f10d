// Turns raw model text (TSV or JSON) plus a document-type hint into an
// unvalidated canonical record. The sanitizer owns all repair logic; this
// module only recovers structure.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::models::{
    AbnormalFlag, CanonicalRecord, DocumentType, HumanName, Observation, ObsValue, OutputFormat,
    Patient,
};

use super::canonical::{extract_json_candidate, strip_code_fences, to_number};

/// First-column tokens that mark a header row.
const HEADER_TOKENS: &[&str] = &[
    "NAME", "TEST", "ANALYTE", "ANATOMY", "REGION", "FINDING", "OBSERVATION", "DRUG", "MEDICATION",
];

/// First-column keywords that identify a radiology finding when the model
/// dropped both the header and the MODALITY metadata line.
const ANATOMY_KEYWORDS: &[&str] = &[
    "lung", "chest", "heart", "mediastinum", "bone", "fracture", "opacity", "impression",
];

/// Fixed column order for a TSV data row, selected once per document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnLayout {
    /// `NAME  VALUE  UNIT  REF_RANGE|REF_LOW  [REF_HIGH]  FLAG`
    Lab,
    /// `ANATOMY  FINDING  FLAG`
    Radiology,
    /// `DRUG  DOSAGE  FREQUENCY`
    Medication,
}

impl ColumnLayout {
    fn from_header(first_cell: &str) -> Option<Self> {
        match first_cell.trim().to_uppercase().as_str() {
            "ANATOMY" | "REGION" | "FINDING" => Some(ColumnLayout::Radiology),
            "DRUG" | "MEDICATION" => Some(ColumnLayout::Medication),
            "NAME" | "TEST" | "ANALYTE" | "OBSERVATION" => Some(ColumnLayout::Lab),
            _ => None,
        }
    }

    fn from_modality(modality: &str) -> Self {
        match modality.trim().to_uppercase().as_str() {
            "IMAGING" | "RADIOLOGY" | "X-RAY" | "CT" | "MRI" => ColumnLayout::Radiology,
            "MEDS" => ColumnLayout::Medication,
            _ => ColumnLayout::Lab,
        }
    }

    fn from_hint(hint: DocumentType) -> Self {
        match hint {
            DocumentType::RadiologyReport => ColumnLayout::Radiology,
            DocumentType::Prescription => ColumnLayout::Medication,
            DocumentType::LabReport | DocumentType::Vitals => ColumnLayout::Lab,
        }
    }
}

/// Parse model output into a canonical record, trying the preferred
/// format first and falling back to the other. Returns `None` when no
/// data rows are recoverable.
pub fn parse_extraction(
    raw: &str,
    hint: DocumentType,
    format: OutputFormat,
) -> Option<CanonicalRecord> {
    match format {
        OutputFormat::Tsv => parse_tsv(raw, hint).or_else(|| parse_json(raw)),
        OutputFormat::Json => parse_json(raw).or_else(|| parse_tsv(raw, hint)),
    }
}

/// Split a `low - high` reference-range token into its bounds.
pub(crate) fn parse_range(value: &str) -> Option<(ObsValue, ObsValue)> {
    let (lo, hi) = value.trim().split_once('-')?;
    let (lo, hi) = (lo.trim(), hi.trim());
    if lo.is_empty() || hi.is_empty() {
        return None;
    }
    Some((to_number(lo), to_number(hi)))
}

fn double_space_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s{2,}").unwrap())
}

fn header_cell_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\t|]|\s{2,}").unwrap())
}

fn is_header_token(cell: &str) -> bool {
    HEADER_TOKENS.contains(&cell.trim().to_uppercase().as_str())
}

/// Split one data row into columns. Separators in priority order: tab,
/// pipe, double-space run, then a single colon as a last resort (the
/// colon guard keeps `12:30` timestamps intact by requiring that the
/// higher-priority separators produced fewer than two columns first).
fn split_columns(line: &str) -> Vec<String> {
    let parts: Vec<String> = if line.contains('\t') {
        line.split('\t').map(|p| p.trim().to_string()).collect()
    } else if line.contains('|') {
        line.split('|').map(|p| p.trim().to_string()).collect()
    } else {
        double_space_regex()
            .split(line)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    };
    if parts.len() >= 2 {
        return parts;
    }
    if let Some((head, tail)) = line.trim().split_once(':') {
        if !head.trim().is_empty() && !tail.trim().is_empty() {
            return vec![head.trim().to_string(), tail.trim().to_string()];
        }
    }
    parts
}

/// A `Key: value` line whose key ends in one of the metadata suffixes is
/// report metadata, never a data row.
fn is_metadata_like(line: &str) -> bool {
    match line.trim().split_once(':') {
        Some((key, _)) => {
            let k = key.trim().to_uppercase();
            ["NAME", "ID", "MRN", "DATE", "MODALITY"]
                .iter()
                .any(|suffix| k.ends_with(suffix))
        }
        None => false,
    }
}

fn metadata_value(line: &str) -> Option<String> {
    line.split_once(':')
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_tsv(raw: &str, hint: DocumentType) -> Option<CanonicalRecord> {
    // Models occasionally emit literal escapes instead of real control chars.
    let normalized = raw.replace("\\t", "\t").replace("\\n", "\n");
    let lines: Vec<&str> = normalized
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return None;
    }

    let mut patient = Patient::default();
    let mut report_date: Option<String> = None;
    let mut header_idx: Option<usize> = None;
    let mut layout_from_header: Option<ColumnLayout> = None;

    for (idx, line) in lines.iter().enumerate() {
        let upper = line.trim().to_uppercase();
        if upper == "TSV" {
            continue;
        }
        if upper.starts_with("PATIENT_NAME:") {
            patient.name = metadata_value(line).map(HumanName::Text);
            continue;
        }
        if upper.starts_with("SAMPLE_ID:") || upper.starts_with("ID:") || upper.starts_with("MRN:")
        {
            patient.identifier = metadata_value(line);
            continue;
        }
        if upper.starts_with("REPORT_DATE:") {
            report_date = metadata_value(line);
            continue;
        }
        if upper.starts_with("MODALITY:") {
            patient.modality = metadata_value(line).map(|m| m.to_uppercase());
            continue;
        }

        let cells: Vec<&str> = header_cell_regex()
            .split(line)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();
        if cells.len() >= 2 && is_header_token(cells[0]) {
            header_idx = Some(idx);
            layout_from_header = ColumnLayout::from_header(cells[0]);
            break;
        }
    }

    if layout_from_header == Some(ColumnLayout::Radiology) && patient.modality.is_none() {
        patient.modality = Some("RADIOLOGY".to_string());
    }

    // Without a header, data rows start right after whatever metadata the
    // scan above consumed.
    let start = header_idx.map(|i| i + 1).unwrap_or(0);

    let mut layout = layout_from_header
        .or_else(|| patient.modality.as_deref().map(ColumnLayout::from_modality))
        .unwrap_or_else(|| ColumnLayout::from_hint(hint));

    if layout_from_header.is_none() && patient.modality.is_none() {
        if let Some(first_col) = lines[start..]
            .iter()
            .filter(|l| !is_metadata_like(l))
            .find_map(|l| split_columns(l).into_iter().next())
        {
            let lower = first_col.to_lowercase();
            if ANATOMY_KEYWORDS.iter().any(|k| lower.contains(k)) {
                layout = ColumnLayout::Radiology;
                patient.modality = Some("X-RAY".to_string());
            }
        }
    }

    let mut observations = Vec::new();
    for line in &lines[start..] {
        let clean = line.trim();
        if clean.is_empty() || is_metadata_like(clean) {
            continue;
        }
        let parts = split_columns(line);
        if parts.len() < 2 || parts[0].is_empty() {
            continue;
        }
        if is_header_token(&parts[0]) {
            continue; // repeated header row
        }

        let mut obs = Observation::new(&parts[0], parts[1].as_str());
        match layout {
            ColumnLayout::Radiology => {
                obs.flag = parts.get(2).and_then(|f| AbnormalFlag::from_token(f));
            }
            ColumnLayout::Medication => {
                obs.unit = parts
                    .get(2)
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
            }
            ColumnLayout::Lab => {
                obs.unit = parts
                    .get(2)
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                let mut range_found = false;
                if let Some(range_cell) = parts.get(3) {
                    if let Some((lo, hi)) = parse_range(range_cell) {
                        obs.ref_low = Some(lo);
                        obs.ref_high = Some(hi);
                        range_found = true;
                    }
                }
                let mut flag_cell = parts.get(4).map(String::as_str);
                // Six-column layouts carry REF_LOW and REF_HIGH separately.
                if parts.len() >= 6 && !range_found {
                    obs.ref_low = some_nonblank(&parts[3]).map(to_number);
                    obs.ref_high = some_nonblank(&parts[4]).map(to_number);
                    flag_cell = Some(parts[5].as_str());
                }
                obs.flag = flag_cell.and_then(AbnormalFlag::from_token);
            }
        }
        observations.push(obs);
    }

    if observations.is_empty() {
        return None;
    }
    Some(CanonicalRecord {
        patient,
        observations,
        report_date,
    })
}

fn some_nonblank(cell: &str) -> Option<&str> {
    let trimmed = cell.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Structural decode of the legacy JSON format. Accepts the full and the
/// abbreviated schemas; undecodable observation items are skipped rather
/// than failing the whole response.
fn parse_json(raw: &str) -> Option<CanonicalRecord> {
    let candidate = extract_json_candidate(strip_code_fences(raw));
    let value: Value = serde_json::from_str(candidate).ok()?;
    let obj = value.as_object()?;

    let patient = obj
        .get("patient")
        .or_else(|| obj.get("p"))
        .and_then(|v| serde_json::from_value::<Patient>(v.clone()).ok())
        .unwrap_or_default();

    let observations: Vec<Observation> = match obj
        .get("observations")
        .or_else(|| obj.get("obs"))
        .and_then(Value::as_array)
    {
        Some(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        None => {
            // A bare top-level object that looks like a single observation
            // heals into a one-row record.
            const OBS_KEYS: &[&str] = &["name", "test", "analyte", "n", "value", "v"];
            if OBS_KEYS.iter().any(|k| obj.contains_key(*k)) {
                serde_json::from_value::<Observation>(value.clone())
                    .ok()
                    .into_iter()
                    .collect()
            } else {
                Vec::new()
            }
        }
    };

    if observations.is_empty() {
        return None;
    }

    let report_date = obj
        .get("report_date")
        .or_else(|| obj.get("d"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(CanonicalRecord {
        patient,
        observations,
        report_date,
    })
}
