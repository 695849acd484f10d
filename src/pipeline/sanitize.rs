// Deterministic repair of known systematic model failure modes. Never
// fails: whatever comes in, a well-formed (possibly empty) record comes
// out, so that validation stays the single source of truth for "usable".

use crate::config::ExtractionConfig;
use crate::models::{
    AbnormalFlag, CanonicalRecord, HumanName, Observation, ObsValue, Patient, StructuredName,
};

use super::canonical::{
    infer_unit_by_name, normalize_date, normalize_name, normalize_unit, split_value_unit,
};
use super::parser::parse_range;

/// Patient name strings the model substitutes when it found nothing.
const PLACEHOLDER_NAMES: &[&str] = &["<empty>", "unknown", "na", "n/a"];

/// Row names that echo the prompt's example table instead of the image.
const PLACEHOLDER_ROWS: &[&str] = &["test name", "<test name>", "example", "sample"];

/// Honorific tokens stripped out of name parts.
const HONORIFICS: &[&str] = &["dr.", "dr", "md", "mrs", "mr", "ms"];

/// The five standard differential cell types.
const DIFFERENTIAL_CELLS: &[&str] =
    &["neutrophils", "lymphocytes", "eosinophils", "monocytes", "basophils"];

/// Normalize a parsed record: patient identity cleanup, per-row unit and
/// value repair, scale corrections, flag resolution, deduplication.
pub fn sanitize_record(record: CanonicalRecord, config: &ExtractionConfig) -> CanonicalRecord {
    let patient = sanitize_patient(record.patient, config);

    let cleaned: Vec<Observation> = record
        .observations
        .into_iter()
        .filter_map(|obs| sanitize_observation(obs, config))
        .collect();

    let mut observations = dedupe_observations(cleaned);
    correct_differential_counts(&mut observations, config);

    let report_date = if config.allow_report_date {
        record.report_date.as_deref().and_then(normalize_date)
    } else {
        None
    };

    CanonicalRecord {
        patient,
        observations,
        report_date,
    }
}

fn sanitize_patient(mut patient: Patient, config: &ExtractionConfig) -> Patient {
    if patient.id.trim().is_empty() {
        patient.id = "patient-1".to_string();
    }

    if !config.allow_inferred_demographics {
        patient.gender = None;
    }

    // Identifiers are numeric strings; anything else was misread.
    patient.identifier = patient.identifier.and_then(|raw| {
        let trimmed = raw.trim().to_string();
        (!trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit())).then_some(trimmed)
    });

    patient.name = patient.name.and_then(sanitize_name);
    patient
}

fn clean_name_token(token: &str) -> Option<String> {
    let trimmed = token.trim();
    if trimmed.is_empty() || HONORIFICS.contains(&trimmed.to_lowercase().as_str()) {
        return None;
    }
    if trimmed.eq_ignore_ascii_case("<empty>") {
        return None;
    }
    Some(trimmed.to_string())
}

/// Split free-string names into given/family, strip honorifics, and
/// re-derive a missing family name from trailing given tokens.
fn sanitize_name(name: HumanName) -> Option<HumanName> {
    let mut structured = match name {
        HumanName::Text(raw) => {
            if PLACEHOLDER_NAMES.contains(&raw.trim().to_lowercase().as_str()) {
                return None;
            }
            let mut tokens: Vec<String> =
                raw.split_whitespace().map(str::to_string).collect();
            let family = if tokens.len() >= 2 { tokens.pop() } else { None };
            StructuredName {
                given: tokens,
                family,
            }
        }
        HumanName::Structured(s) => s,
    };

    structured.given = structured
        .given
        .iter()
        .filter_map(|t| clean_name_token(t))
        .collect();

    structured.family = structured.family.and_then(|f| {
        let cleaned: Vec<String> = f.split_whitespace().filter_map(clean_name_token).collect();
        (!cleaned.is_empty()).then(|| cleaned.join(" "))
    });

    if structured.family.is_none() && structured.given.len() >= 2 {
        structured.family = structured.given.pop();
    }

    if structured.given.is_empty() && structured.family.is_none() {
        return None;
    }
    Some(HumanName::Structured(structured))
}

/// Resolve one observation: name cleanup, value/unit splitting, unit
/// inference, forced units, platelet scale correction, flag resolution.
fn sanitize_observation(obs: Observation, config: &ExtractionConfig) -> Option<Observation> {
    let mut name = normalize_name(&obs.name);
    if name.is_empty() || PLACEHOLDER_ROWS.contains(&name.to_lowercase().as_str()) {
        return None;
    }
    if matches!(name.trim().to_lowercase().as_str(), "platelets" | "platelet") {
        name = "Platelet Count".to_string();
    }

    let mut unit = obs.unit.as_deref().and_then(normalize_unit);
    let mut flag = obs.flag;
    let mut value = obs.value;

    if let ObsValue::Text(raw) = &value {
        let parts = split_value_unit(raw);
        if let Some(v) = parts.value {
            value = v;
        }
        if parts.flag.is_some() {
            flag = parts.flag;
        }
        if unit.is_none() {
            unit = parts.unit.as_deref().and_then(normalize_unit);
        }
    }

    // A "Platelet Count" measured in femtoliters is really the MPV row.
    if name.to_lowercase().contains("platelet count") && unit.as_deref() == Some("fL") {
        name = "MPV".to_string();
    }

    if let Some(expected) = infer_unit_by_name(&name) {
        if unit.as_deref() != Some(expected) {
            unit = Some(expected.to_string());
        }
    }
    // High-confidence deterministic facts, regardless of what was parsed.
    let lower = name.to_lowercase();
    if lower.contains("mpv") {
        unit = Some("fL".to_string());
    }
    if lower.contains("immature platelet fraction") {
        unit = Some("%".to_string());
    }

    let (ref_low, ref_high, range_unit) = resolve_range(obs.ref_low, obs.ref_high);
    if unit.is_none() {
        unit = range_unit;
    }

    let mut obs = Observation {
        name,
        value,
        unit,
        ref_low: ref_low.map(ObsValue::Number),
        ref_high: ref_high.map(ObsValue::Number),
        flag,
    };

    correct_platelet_scale(&mut obs, config);
    resolve_flag(&mut obs);
    Some(obs)
}

/// Coerce reference bounds to numbers. A single bound carrying a full
/// "low - high" token is split; non-numeric bounds are dropped. Returns
/// (low, high, unit recovered from a bound string, if any).
fn resolve_range(
    ref_low: Option<ObsValue>,
    ref_high: Option<ObsValue>,
) -> (Option<f64>, Option<f64>, Option<String>) {
    for bound in [&ref_low, &ref_high].into_iter().flatten() {
        if let ObsValue::Text(raw) = bound {
            if raw.contains('-') {
                if let Some((lo, hi)) = parse_range(raw) {
                    return (lo.as_f64(), hi.as_f64(), None);
                }
            }
        }
    }

    let mut range_unit = None;
    let mut resolve = |bound: Option<ObsValue>| -> Option<f64> {
        match bound? {
            ObsValue::Number(n) => Some(n),
            ObsValue::Text(raw) => {
                let parts = split_value_unit(&raw);
                if range_unit.is_none() {
                    range_unit = parts.unit.as_deref().and_then(normalize_unit);
                }
                parts.value.and_then(|v| v.as_f64())
            }
        }
    };

    let low = resolve(ref_low);
    let high = resolve(ref_high);
    (low, high, range_unit)
}

/// Platelet counts reported in thousands ("370" for 370,000/uL) are a
/// recurring model shorthand. Rescale value and matching bounds, and
/// clear the flag so it is recomputed against the corrected range.
fn correct_platelet_scale(obs: &mut Observation, config: &ExtractionConfig) {
    let ceiling = config.platelet_scale_ceiling;
    if ceiling <= 0.0 {
        return;
    }
    if !obs.name.to_lowercase().contains("platelet count") {
        return;
    }
    if !matches!(obs.unit.as_deref(), Some("/uL") | None) {
        return;
    }
    let Some(v) = obs.value.as_f64() else { return };
    if v <= 0.0 || v >= ceiling {
        return;
    }

    tracing::warn!(value = v, "rescaling platelet count reported in thousands");
    obs.value = ObsValue::Number(v * 1000.0);
    for bound in [&mut obs.ref_low, &mut obs.ref_high] {
        if let Some(ObsValue::Number(b)) = bound {
            if *b < ceiling {
                *b *= 1000.0;
            }
        }
    }
    obs.flag = None;
}

/// Keep a well-formed explicit flag; otherwise derive H/L from the value
/// against the reference bounds. Non-numeric values are left unflagged.
fn resolve_flag(obs: &mut Observation) {
    if obs.flag.is_some() {
        return;
    }
    let Some(v) = obs.value.as_f64() else { return };
    if let Some(low) = obs.ref_low.as_ref().and_then(ObsValue::as_f64) {
        if v < low {
            obs.flag = Some(AbnormalFlag::Low);
        }
    }
    if let Some(high) = obs.ref_high.as_ref().and_then(ObsValue::as_f64) {
        if v > high {
            obs.flag = Some(AbnormalFlag::High);
        }
    }
}

/// Collapse rows sharing a normalized name, preferring whichever
/// duplicate's unit matches the expected unit for that test.
fn dedupe_observations(observations: Vec<Observation>) -> Vec<Observation> {
    let mut deduped: Vec<Observation> = Vec::with_capacity(observations.len());
    for obs in observations {
        match deduped.iter().position(|kept| kept.name == obs.name) {
            None => deduped.push(obs),
            Some(idx) => {
                if let Some(expected) = infer_unit_by_name(&obs.name) {
                    let kept_matches = deduped[idx].unit.as_deref() == Some(expected);
                    let new_matches = obs.unit.as_deref() == Some(expected);
                    if !kept_matches && new_matches {
                        deduped[idx] = obs;
                    }
                }
                // Otherwise the first-seen row wins.
            }
        }
    }
    deduped
}

/// Cross-check absolute differential counts against WBC × percentage.
/// When an absolute count is off by a factor of ten, replace it with the
/// computed value.
fn correct_differential_counts(observations: &mut [Observation], config: &ExtractionConfig) {
    let wbc = observations.iter().find_map(|o| {
        let n = o.name.to_lowercase();
        if n.contains("w.b.c") || n.contains("wbc") {
            o.value.as_f64()
        } else {
            None
        }
    });
    let Some(wbc) = wbc.filter(|w| *w > 0.0) else {
        return;
    };

    for cell in DIFFERENTIAL_CELLS {
        let percent = observations.iter().find_map(|o| {
            (o.name.to_lowercase() == *cell).then(|| o.value.as_f64()).flatten()
        });
        let Some(percent) = percent else { continue };

        let abs_idx = observations.iter().position(|o| {
            let n = o.name.to_lowercase();
            n.contains("abs") && n.contains(cell) && o.value.as_f64().is_some()
        });
        let Some(abs_idx) = abs_idx else { continue };

        let expected = wbc * percent / 100.0;
        if expected <= 0.0 {
            continue;
        }
        let actual = observations[abs_idx].value.as_f64().unwrap_or(0.0);
        let divergence = (actual - expected).abs() / expected;
        let rescaled = (actual * 10.0 - expected).abs() / expected;
        if divergence > config.differential_divergence && rescaled < config.differential_tolerance
        {
            let corrected = (expected * 100.0).round() / 100.0;
            tracing::warn!(
                cell,
                actual,
                corrected,
                "absolute differential count off by a decimal place, replacing with computed value"
            );
            observations[abs_idx].value = ObsValue::Number(corrected);
        }
    }
}
