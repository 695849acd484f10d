// Completeness checks on both sides of bundle assembly. Validators never
// mutate and never raise: they return human-readable defect lists that
// the orchestrator feeds back into the repair prompt.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::config::ExtractionConfig;
use crate::models::{CanonicalRecord, Gender};

/// Checklist of the standard CBC rows, grouped by accepted aliases.
/// Keys are compared after folding to lowercase alphanumerics.
const EXPECTED_CBC_GROUPS: &[&[&str]] = &[
    &["haemoglobin", "hemoglobin"],
    &["totalrbccount", "totalrbc"],
    &["haematocritpcvhct", "hematocritpcvhct", "haematocritpcv", "hematocritpcv"],
    &["meancorpuscularvolumemcv", "mcv"],
    &["meancorpuscularhbmch", "mch"],
    &["meancorpuscularhbconcmchc", "meancorpuscularhbcmchc", "mchc"],
    &["redcelldistributionwidthrdw", "redcelldistributionwidthrdwcv", "rdwcv", "rdw"],
    &["totalwbccount", "totalwbc", "wbccount"],
    &["neutrophils"],
    &["lymphocytes"],
    &["eosinophils"],
    &["monocytes"],
    &["basophils"],
    &["plateletcount", "platelets"],
    &["mpv"],
    &["immatureplateletfraction"],
    &["neutrophilsabs"],
    &["lymphocytesabs"],
    &["eosinophilsabs"],
    &["monocytesabs"],
    &["basophilsabs"],
];

const ALLOWED_QUANTITY_KEYS: &[&str] = &["value", "unit", "system", "code", "comparator"];

fn key_fold_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").unwrap())
}

fn fold_key(value: &str) -> String {
    key_fold_regex()
        .replace_all(&value.to_lowercase(), "")
        .into_owned()
}

/// Pre-build validation of a sanitized canonical record. Empty result
/// means the record is complete enough for bundle assembly.
pub fn validate_record(record: &CanonicalRecord, config: &ExtractionConfig) -> Vec<String> {
    let mut defects = Vec::new();

    if record.observations.is_empty() {
        defects.push("observations must be a non-empty array.".to_string());
        return defects;
    }
    if record.observations.len() < config.min_observations {
        defects.push(format!(
            "observations must include at least {} rows (found {}).",
            config.min_observations,
            record.observations.len()
        ));
    }

    if config.require_patient {
        if record.patient.name.is_none() {
            defects.push("patient.name is required when patient identity is mandatory.".to_string());
        }
        if record.patient.identifier.is_none() {
            defects.push(
                "patient.identifier is required when patient identity is mandatory.".to_string(),
            );
        }
    }

    for (i, obs) in record.observations.iter().enumerate() {
        let idx = i + 1;
        if obs.name.trim().is_empty() {
            defects.push(format!("observations[{idx}].name is required."));
        }
        if obs.value.is_blank() {
            defects.push(format!("observations[{idx}].value is required."));
        }
    }

    if config.require_expected_tests {
        let got: Vec<String> = record
            .observations
            .iter()
            .map(|o| fold_key(&o.name))
            .collect();
        let missing: Vec<String> = EXPECTED_CBC_GROUPS
            .iter()
            .filter(|group| !group.iter().any(|alias| got.iter().any(|g| g == alias)))
            .map(|group| {
                let mut aliases: Vec<&str> = group.to_vec();
                aliases.sort_unstable();
                aliases.join("/")
            })
            .collect();
        if !missing.is_empty() {
            let shown = missing.iter().take(8).cloned().collect::<Vec<_>>().join(", ");
            let ellipsis = if missing.len() > 8 { "..." } else { "" };
            defects.push(format!("missing expected CBC rows: {shown}{ellipsis}"));
        }
    }

    defects
}

/// Post-build validation of an assembled bundle, run over its JSON form
/// so it applies equally to bundles built elsewhere. Defects are logged
/// by the caller, never retried.
pub fn validate_bundle(bundle: &Value, config: &ExtractionConfig) -> Vec<String> {
    let mut defects = Vec::new();

    let Some(root) = bundle.as_object() else {
        return vec!["Top-level JSON must be an object.".to_string()];
    };

    if root.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        defects.push("Bundle.resourceType must be 'Bundle'.".to_string());
    }
    if root.get("type").and_then(Value::as_str) != Some("collection") {
        defects.push("Bundle.type must be 'collection'.".to_string());
    }

    let entries = match root.get("entry").and_then(Value::as_array) {
        Some(entries) if !entries.is_empty() => entries,
        _ => {
            defects.push("Bundle.entry must be a non-empty array.".to_string());
            return defects;
        }
    };

    let mut observation_count = 0usize;
    for (i, item) in entries.iter().enumerate() {
        let idx = i + 1;
        let Some(resource) = item.get("resource").and_then(Value::as_object) else {
            defects.push(format!("entry[{idx}].resource must be an object."));
            continue;
        };

        let resource_type = resource.get("resourceType").and_then(Value::as_str);
        match resource_type {
            Some("Patient") => validate_patient_resource(resource, idx, config, &mut defects),
            Some("Observation") => {
                observation_count += 1;
                validate_observation_resource(resource, idx, config, &mut defects);
            }
            Some("MedicationRequest") => {
                validate_medication_request_resource(resource, idx, &mut defects)
            }
            _ => {
                defects.push(format!(
                    "entry[{idx}].resourceType must be Patient, Observation, or MedicationRequest."
                ));
                continue;
            }
        }

        if resource.contains_key("meta") {
            defects.push(format!("entry[{idx}] contains meta (omit meta for concise output)."));
        }
    }

    if observation_count < config.bundle_min_observations {
        defects.push(format!(
            "Bundle must include at least {} Observation resources (found {observation_count}).",
            config.bundle_min_observations
        ));
    }

    defects
}

fn validate_patient_resource(
    resource: &serde_json::Map<String, Value>,
    idx: usize,
    config: &ExtractionConfig,
    defects: &mut Vec<String>,
) {
    if !resource.contains_key("id") {
        defects.push(format!("Patient in entry[{idx}] must include id."));
    }
    if let Some(gender) = resource.get("gender") {
        let valid = gender
            .as_str()
            .and_then(Gender::parse)
            .is_some();
        if !valid {
            defects.push(format!(
                "Patient.gender in entry[{idx}] must be one of [female, male, other, unknown]."
            ));
        }
    }

    let Some(names) = resource.get("name").and_then(Value::as_array) else {
        return;
    };
    for name in names {
        let Some(name) = name.as_object() else { continue };
        let given = name.get("given");
        if let Some(given) = given {
            if !given.is_array() {
                defects.push(format!(
                    "Patient.name.given in entry[{idx}] must be an array of strings."
                ));
            }
        }
        if config.strict_placeholders {
            let family = name
                .get("family")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_lowercase();
            let given_list: Vec<String> = given
                .and_then(Value::as_array)
                .map(|g| {
                    g.iter()
                        .filter_map(Value::as_str)
                        .map(|s| s.trim().to_lowercase())
                        .collect()
                })
                .unwrap_or_default();
            if family == "doe" && given_list.iter().any(|g| g == "john" || g == "jane") {
                defects.push(format!(
                    "Patient.name in entry[{idx}] looks like placeholder (John/Jane Doe)."
                ));
            }
        }
    }
}

fn validate_observation_resource(
    resource: &serde_json::Map<String, Value>,
    idx: usize,
    config: &ExtractionConfig,
    defects: &mut Vec<String>,
) {
    if !resource.get("code").map(Value::is_object).unwrap_or(false) {
        defects.push(format!(
            "Observation.code in entry[{idx}] must be an object (CodeableConcept)."
        ));
    }

    let has_subject = resource
        .get("subject")
        .and_then(Value::as_object)
        .map(|s| s.contains_key("reference"))
        .unwrap_or(false);
    if !has_subject {
        defects.push(format!(
            "Observation.subject.reference in entry[{idx}] is required."
        ));
    }

    if let Some(vq) = resource.get("valueQuantity") {
        let Some(vq) = vq.as_object() else {
            defects.push(format!(
                "Observation.valueQuantity in entry[{idx}] must be an object."
            ));
            return;
        };
        let mut extra: Vec<&str> = vq
            .keys()
            .map(String::as_str)
            .filter(|k| !ALLOWED_QUANTITY_KEYS.contains(k))
            .collect();
        extra.sort_unstable();
        if !extra.is_empty() {
            defects.push(format!(
                "Observation.valueQuantity in entry[{idx}] has invalid keys: {extra:?}."
            ));
        }
        if !config.allow_vq_codes && (vq.contains_key("system") || vq.contains_key("code")) {
            defects.push(format!(
                "Observation.valueQuantity in entry[{idx}] must not include system/code unless visible."
            ));
        }
        if !config.allow_vq_comparator && vq.contains_key("comparator") {
            defects.push(format!(
                "Observation.valueQuantity in entry[{idx}] must not include comparator unless visible."
            ));
        }
        if vq.get("system").map(|v| !v.is_string()).unwrap_or(false) {
            defects.push(format!(
                "Observation.valueQuantity.system in entry[{idx}] must be a string."
            ));
        }
        if vq.get("code").map(|v| !v.is_string()).unwrap_or(false) {
            defects.push(format!(
                "Observation.valueQuantity.code in entry[{idx}] must be a string."
            ));
        }
    }

    if resource
        .get("referenceRange")
        .map(|r| !r.is_array())
        .unwrap_or(false)
    {
        defects.push(format!(
            "Observation.referenceRange in entry[{idx}] must be an array."
        ));
    }
}

fn validate_medication_request_resource(
    resource: &serde_json::Map<String, Value>,
    idx: usize,
    defects: &mut Vec<String>,
) {
    let has_subject = resource
        .get("subject")
        .and_then(Value::as_object)
        .map(|s| s.contains_key("reference"))
        .unwrap_or(false);
    if !has_subject {
        defects.push(format!(
            "MedicationRequest.subject.reference in entry[{idx}] is required."
        ));
    }
    if !resource
        .get("medicationCodeableConcept")
        .map(Value::is_object)
        .unwrap_or(false)
    {
        defects.push(format!(
            "MedicationRequest.medicationCodeableConcept in entry[{idx}] must be an object."
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HumanName, Observation, Patient};
    use serde_json::json;

    fn config() -> ExtractionConfig {
        ExtractionConfig::default()
    }

    fn minimal_record() -> CanonicalRecord {
        CanonicalRecord {
            patient: Patient {
                name: Some(HumanName::Text("John Carter".into())),
                identifier: Some("445566".into()),
                ..Patient::default()
            },
            observations: vec![Observation::new("Haemoglobin", 13.7)],
            report_date: None,
        }
    }

    // ── Pre-build record validation ─────────────────────────────────

    #[test]
    fn complete_record_passes() {
        assert!(validate_record(&minimal_record(), &config()).is_empty());
    }

    #[test]
    fn empty_observations_short_circuit() {
        let mut record = minimal_record();
        record.observations.clear();
        let defects = validate_record(&record, &config());
        assert_eq!(defects, vec!["observations must be a non-empty array.".to_string()]);
    }

    #[test]
    fn minimum_observation_count_enforced() {
        let mut cfg = config();
        cfg.min_observations = 3;
        let defects = validate_record(&minimal_record(), &cfg);
        assert!(defects.iter().any(|d| d.contains("at least 3 rows")));
    }

    #[test]
    fn missing_patient_identity_reported() {
        let mut record = minimal_record();
        record.patient.name = None;
        record.patient.identifier = None;
        let defects = validate_record(&record, &config());
        assert!(defects.iter().any(|d| d.contains("patient.name is required")));
        assert!(defects.iter().any(|d| d.contains("patient.identifier is required")));
    }

    #[test]
    fn patient_identity_optional_when_disabled() {
        let mut cfg = config();
        cfg.require_patient = false;
        let mut record = minimal_record();
        record.patient.name = None;
        record.patient.identifier = None;
        assert!(validate_record(&record, &cfg).is_empty());
    }

    #[test]
    fn blank_name_and_value_reported_with_index() {
        let mut record = minimal_record();
        record.observations.push(Observation::new("  ", ""));
        let defects = validate_record(&record, &config());
        assert!(defects.iter().any(|d| d.contains("observations[2].name is required")));
        assert!(defects.iter().any(|d| d.contains("observations[2].value is required")));
    }

    #[test]
    fn cbc_checklist_reports_missing_groups() {
        let mut cfg = config();
        cfg.require_expected_tests = true;
        let defects = validate_record(&minimal_record(), &cfg);
        let missing = defects
            .iter()
            .find(|d| d.contains("missing expected CBC rows"))
            .expect("checklist defect expected");
        // Haemoglobin is present; its group must not be listed.
        assert!(!missing.contains("haemoglobin"));
        assert!(missing.contains("..."));
    }

    #[test]
    fn cbc_checklist_matches_aliases() {
        let mut cfg = config();
        cfg.require_expected_tests = true;
        let mut record = minimal_record();
        for name in [
            "Total R.B.C. Count",
            "Haematocrit (PCV)",
            "Mean Corpuscular Volume (MCV)",
            "Mean Corpuscular Hb (MCH)",
            "Mean Corpuscular Hb Conc (MCHC)",
            "Red Cell Distribution Width (RDW-CV)",
            "Total WBC Count",
            "Neutrophils",
            "Lymphocytes",
            "Eosinophils",
            "Monocytes",
            "Basophils",
            "Platelet Count",
            "MPV",
            "Immature Platelet Fraction",
            "Neutrophils Abs",
            "Lymphocytes Abs",
            "Eosinophils Abs",
            "Monocytes Abs",
            "Basophils Abs",
        ] {
            record.observations.push(Observation::new(name, 1.0));
        }
        assert!(validate_record(&record, &cfg).is_empty());
    }

    // ── Post-build bundle validation ────────────────────────────────

    fn minimal_bundle() -> Value {
        json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [
                {"resource": {"resourceType": "Patient", "id": "patient-1"}},
                {"resource": {
                    "resourceType": "Observation",
                    "id": "obs-1",
                    "status": "final",
                    "code": {"text": "Haemoglobin"},
                    "subject": {"reference": "Patient/patient-1"},
                    "valueQuantity": {"value": 13.7, "unit": "g/dL"}
                }}
            ]
        })
    }

    fn permissive() -> ExtractionConfig {
        ExtractionConfig {
            bundle_min_observations: 1,
            ..ExtractionConfig::default()
        }
    }

    #[test]
    fn minimal_bundle_passes() {
        assert!(validate_bundle(&minimal_bundle(), &permissive()).is_empty());
    }

    #[test]
    fn non_object_top_level_rejected() {
        let defects = validate_bundle(&json!([1, 2]), &permissive());
        assert_eq!(defects, vec!["Top-level JSON must be an object.".to_string()]);
    }

    #[test]
    fn bundle_markers_required() {
        let defects = validate_bundle(&json!({"entry": [{"resource": {"resourceType": "Patient", "id": "x"}}]}), &permissive());
        assert!(defects.iter().any(|d| d.contains("Bundle.resourceType")));
        assert!(defects.iter().any(|d| d.contains("Bundle.type")));
    }

    #[test]
    fn empty_entry_rejected() {
        let defects = validate_bundle(
            &json!({"resourceType": "Bundle", "type": "collection", "entry": []}),
            &permissive(),
        );
        assert!(defects.iter().any(|d| d.contains("non-empty array")));
    }

    #[test]
    fn unknown_resource_type_rejected() {
        let mut bundle = minimal_bundle();
        bundle["entry"][1]["resource"]["resourceType"] = json!("Device");
        let defects = validate_bundle(&bundle, &permissive());
        assert!(defects
            .iter()
            .any(|d| d.contains("entry[2].resourceType must be Patient, Observation, or MedicationRequest")));
    }

    #[test]
    fn meta_forbidden() {
        let mut bundle = minimal_bundle();
        bundle["entry"][0]["resource"]["meta"] = json!({"versionId": "1"});
        let defects = validate_bundle(&bundle, &permissive());
        assert!(defects.iter().any(|d| d.contains("contains meta")));
    }

    #[test]
    fn missing_subject_reference_names_entry_index() {
        let mut bundle = minimal_bundle();
        bundle["entry"][1]["resource"]
            .as_object_mut()
            .unwrap()
            .remove("subject");
        let defects = validate_bundle(&bundle, &permissive());
        assert!(defects
            .iter()
            .any(|d| d == "Observation.subject.reference in entry[2] is required."));
    }

    #[test]
    fn missing_code_rejected() {
        let mut bundle = minimal_bundle();
        bundle["entry"][1]["resource"]
            .as_object_mut()
            .unwrap()
            .remove("code");
        let defects = validate_bundle(&bundle, &permissive());
        assert!(defects.iter().any(|d| d.contains("Observation.code in entry[2]")));
    }

    #[test]
    fn invalid_quantity_keys_rejected() {
        let mut bundle = minimal_bundle();
        bundle["entry"][1]["resource"]["valueQuantity"]["interpretation"] = json!("H");
        let defects = validate_bundle(&bundle, &permissive());
        assert!(defects.iter().any(|d| d.contains("invalid keys")));
    }

    #[test]
    fn quantity_codes_gated_by_config() {
        let mut bundle = minimal_bundle();
        bundle["entry"][1]["resource"]["valueQuantity"]["system"] = json!("http://unitsofmeasure.org");
        bundle["entry"][1]["resource"]["valueQuantity"]["code"] = json!("g/dL");
        let defects = validate_bundle(&bundle, &permissive());
        assert!(defects.iter().any(|d| d.contains("must not include system/code")));

        let mut cfg = permissive();
        cfg.allow_vq_codes = true;
        assert!(validate_bundle(&bundle, &cfg).is_empty());
    }

    #[test]
    fn comparator_gated_by_config() {
        let mut bundle = minimal_bundle();
        bundle["entry"][1]["resource"]["valueQuantity"]["comparator"] = json!("<");
        let defects = validate_bundle(&bundle, &permissive());
        assert!(defects.iter().any(|d| d.contains("comparator")));

        let mut cfg = permissive();
        cfg.allow_vq_comparator = true;
        assert!(validate_bundle(&bundle, &cfg).is_empty());
    }

    #[test]
    fn invalid_gender_rejected() {
        let mut bundle = minimal_bundle();
        bundle["entry"][0]["resource"]["gender"] = json!("robot");
        let defects = validate_bundle(&bundle, &permissive());
        assert!(defects.iter().any(|d| d.contains("Patient.gender")));
    }

    #[test]
    fn placeholder_patient_name_rejected() {
        let mut bundle = minimal_bundle();
        bundle["entry"][0]["resource"]["name"] =
            json!([{"given": ["John"], "family": "Doe"}]);
        let defects = validate_bundle(&bundle, &permissive());
        assert!(defects.iter().any(|d| d.contains("placeholder")));

        let mut cfg = permissive();
        cfg.strict_placeholders = false;
        assert!(validate_bundle(&bundle, &cfg).is_empty());
    }

    #[test]
    fn minimum_observation_count_in_bundle() {
        let defects = validate_bundle(&minimal_bundle(), &config());
        assert!(defects
            .iter()
            .any(|d| d.contains("at least 3 Observation resources (found 1)")));
    }

    #[test]
    fn medication_request_requires_subject_and_medication() {
        let mut bundle = minimal_bundle();
        bundle["entry"]
            .as_array_mut()
            .unwrap()
            .push(json!({"resource": {"resourceType": "MedicationRequest", "id": "med-1", "intent": "order"}}));
        let defects = validate_bundle(&bundle, &permissive());
        assert!(defects
            .iter()
            .any(|d| d.contains("MedicationRequest.subject.reference in entry[3]")));
        assert!(defects
            .iter()
            .any(|d| d.contains("medicationCodeableConcept in entry[3]")));
    }
}
