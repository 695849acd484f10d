// FHIR R4 resource types and the canonical-record → Bundle mapping.
// Resources are constructed typed, so structural rules (subject
// references, quantity key sets, no meta) hold by construction; the
// post-build validator re-checks the serialized form regardless.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ExtractionConfig;
use crate::models::{
    AbnormalFlag, CanonicalRecord, Gender, HumanName, Observation, ObsValue, Patient,
    StructuredName,
};

use super::canonical::normalize_date;

pub const LOINC_SYSTEM: &str = "http://loinc.org";
pub const OBSERVATION_CATEGORY_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/observation-category";
pub const INTERPRETATION_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/v3-ObservationInterpretation";

/// LOINC codes for the common CBC test names, keyed by lowercased name.
const LOINC_CODES: &[(&str, &str)] = &[
    ("haemoglobin", "718-7"),
    ("hemoglobin", "718-7"),
    ("total wbc count", "6690-2"),
    ("wbc count", "6690-2"),
    ("total rbc count", "789-8"),
    ("rbc count", "789-8"),
    ("platelet count", "777-3"),
    ("haematocrit", "4544-3"),
    ("hematocrit", "4544-3"),
    ("hct", "4544-3"),
    ("pcv", "4544-3"),
    ("mcv", "787-2"),
    ("mch", "785-6"),
    ("mchc", "786-4"),
    ("rdw", "14563-1"),
    ("neutrophils", "770-8"),
    ("lymphocytes", "731-0"),
    ("monocytes", "742-7"),
    ("eosinophils", "711-2"),
    ("basophils", "704-7"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(rename = "type")]
    pub bundle_type: String,
    pub entry: Vec<BundleEntry>,
}

impl Bundle {
    pub fn collection() -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            bundle_type: "collection".to_string(),
            entry: Vec::new(),
        }
    }

    /// JSON form for the post-build validator and the outbound response.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntry {
    pub resource: Resource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "resourceType")]
pub enum Resource {
    Patient(PatientResource),
    Observation(ObservationResource),
    MedicationRequest(MedicationRequestResource),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientResource {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Vec<Identifier>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<Vec<StructuredName>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, rename = "birthDate", skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifier {
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationResource {
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category: Vec<CodeableConcept>,
    pub code: CodeableConcept,
    pub subject: Reference,
    #[serde(default, rename = "valueQuantity", skip_serializing_if = "Option::is_none")]
    pub value_quantity: Option<Quantity>,
    #[serde(default, rename = "valueString", skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(
        default,
        rename = "effectiveDateTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub effective_date_time: Option<String>,
    #[serde(default, rename = "referenceRange", skip_serializing_if = "Option::is_none")]
    pub reference_range: Option<Vec<ReferenceRange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<Vec<CodeableConcept>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicationRequestResource {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub intent: String,
    #[serde(rename = "medicationCodeableConcept")]
    pub medication_codeable_concept: CodeableConcept,
    pub subject: Reference,
    #[serde(default, rename = "authoredOn", skip_serializing_if = "Option::is_none")]
    pub authored_on: Option<String>,
    #[serde(
        default,
        rename = "dosageInstruction",
        skip_serializing_if = "Option::is_none"
    )]
    pub dosage_instruction: Option<Vec<Dosage>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dosage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coding {
    pub system: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<Quantity>,
}

/// Observation category coding derived from the record's modality.
fn category_for_modality(modality: Option<&str>) -> Coding {
    let (code, display) = match modality.map(str::to_uppercase).as_deref() {
        Some("IMAGING") | Some("RADIOLOGY") | Some("X-RAY") | Some("CT") | Some("MRI") => {
            ("imaging", "Imaging")
        }
        Some("VITALS") => ("vital-signs", "Vital Signs"),
        _ => ("laboratory", "Laboratory"),
    };
    Coding {
        system: OBSERVATION_CATEGORY_SYSTEM.to_string(),
        code: code.to_string(),
        display: Some(display.to_string()),
    }
}

fn loinc_for(name: &str) -> Option<&'static str> {
    let key = name.trim().to_lowercase();
    LOINC_CODES
        .iter()
        .find(|(n, _)| *n == key)
        .map(|(_, code)| *code)
}

fn interpretation_concept(flag: AbnormalFlag) -> Vec<CodeableConcept> {
    vec![CodeableConcept {
        text: None,
        coding: vec![Coding {
            system: INTERPRETATION_SYSTEM.to_string(),
            code: flag.code().to_string(),
            display: None,
        }],
    }]
}

/// Map a sanitized canonical record to a collection Bundle: exactly one
/// Patient resource and one Observation resource per canonical
/// observation, all referencing that Patient.
pub fn build_bundle(record: &CanonicalRecord, config: &ExtractionConfig) -> Bundle {
    let mut bundle = Bundle::collection();
    bundle.entry.push(BundleEntry {
        resource: Resource::Patient(build_patient(&record.patient)),
    });

    let category = category_for_modality(record.patient.modality.as_deref());
    let subject = format!("Patient/{}", record.patient.id);
    for (i, obs) in record.observations.iter().enumerate() {
        bundle.entry.push(BundleEntry {
            resource: Resource::Observation(build_observation(
                obs,
                i + 1,
                &subject,
                record.report_date.as_deref(),
                &category,
                config,
            )),
        });
    }
    bundle
}

fn build_patient(patient: &Patient) -> PatientResource {
    PatientResource {
        id: patient.id.clone(),
        identifier: patient.identifier.as_ref().map(|value| {
            vec![Identifier {
                value: value.clone(),
            }]
        }),
        name: patient.name.as_ref().and_then(|name| match name {
            HumanName::Structured(structured) => Some(vec![structured.clone()]),
            HumanName::Text(_) => None,
        }),
        gender: patient.gender,
        birth_date: patient
            .birth_date
            .as_deref()
            .and_then(normalize_date),
    }
}

fn build_observation(
    obs: &Observation,
    index: usize,
    subject: &str,
    report_date: Option<&str>,
    category: &Coding,
    config: &ExtractionConfig,
) -> ObservationResource {
    let mut coding = Vec::new();
    if let Some(code) = loinc_for(&obs.name) {
        coding.push(Coding {
            system: LOINC_SYSTEM.to_string(),
            code: code.to_string(),
            display: Some(obs.name.clone()),
        });
    }

    // valueQuantity only for numeric values; text goes to valueString.
    let (value_quantity, value_string) = match &obs.value {
        ObsValue::Number(n) => (
            Some(Quantity {
                value: *n,
                unit: obs.unit.clone(),
            }),
            None,
        ),
        ObsValue::Text(t) => (None, Some(t.clone())),
    };

    let low = obs.ref_low.as_ref().and_then(ObsValue::as_f64);
    let high = obs.ref_high.as_ref().and_then(ObsValue::as_f64);
    let reference_range = (low.is_some() || high.is_some()).then(|| {
        vec![ReferenceRange {
            low: low.map(|value| Quantity {
                value,
                unit: obs.unit.clone(),
            }),
            high: high.map(|value| Quantity {
                value,
                unit: obs.unit.clone(),
            }),
        }]
    });

    let mut interpretation = obs.flag.map(interpretation_concept);
    if interpretation.is_none() && config.compute_flags {
        if let Some(v) = obs.value.as_f64() {
            if low.map(|l| v < l).unwrap_or(false) {
                interpretation = Some(interpretation_concept(AbnormalFlag::Low));
            }
            if high.map(|h| v > h).unwrap_or(false) {
                interpretation = Some(interpretation_concept(AbnormalFlag::High));
            }
        }
    }

    ObservationResource {
        id: format!("obs-{index}"),
        status: "final".to_string(),
        category: vec![CodeableConcept {
            text: None,
            coding: vec![category.clone()],
        }],
        code: CodeableConcept {
            text: Some(obs.name.clone()),
            coding,
        },
        subject: Reference {
            reference: subject.to_string(),
        },
        value_quantity,
        value_string,
        effective_date_time: report_date.map(str::to_string),
        reference_range,
        interpretation,
    }
}

/// Backfill interpretations the builder could not derive at the time —
/// a deliberate second pass on top of the sanitizer's flag resolution,
/// tolerating data that only became comparable during assembly.
pub fn ensure_interpretation_from_range(bundle: &mut Bundle) {
    for entry in &mut bundle.entry {
        let Resource::Observation(obs) = &mut entry.resource else {
            continue;
        };
        if obs.interpretation.is_some() {
            continue;
        }
        let Some(value) = obs.value_quantity.as_ref().map(|q| q.value) else {
            continue;
        };
        let Some(range) = obs.reference_range.as_ref().and_then(|r| r.first()) else {
            continue;
        };
        if let Some(low) = range.low.as_ref().map(|q| q.value) {
            if value < low {
                obs.interpretation = Some(interpretation_concept(AbnormalFlag::Low));
            }
        }
        if let Some(high) = range.high.as_ref().map(|q| q.value) {
            if value > high {
                obs.interpretation = Some(interpretation_concept(AbnormalFlag::High));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExtractionConfig {
        ExtractionConfig::default()
    }

    fn lab_record() -> CanonicalRecord {
        let mut hb = Observation::new("Haemoglobin", 13.7);
        hb.unit = Some("g/dL".into());
        hb.ref_low = Some(ObsValue::Number(13.0));
        hb.ref_high = Some(ObsValue::Number(17.0));

        let mut wbc = Observation::new("Total WBC Count", 12500.0);
        wbc.unit = Some("/uL".into());
        wbc.ref_low = Some(ObsValue::Number(4000.0));
        wbc.ref_high = Some(ObsValue::Number(11000.0));
        wbc.flag = Some(AbnormalFlag::High);

        CanonicalRecord {
            patient: Patient {
                identifier: Some("445566".into()),
                name: Some(HumanName::Structured(StructuredName {
                    given: vec!["John".into()],
                    family: Some("Carter".into()),
                })),
                modality: Some("LAB".into()),
                ..Patient::default()
            },
            observations: vec![hb, wbc],
            report_date: Some("2024-03-02".into()),
        }
    }

    #[test]
    fn one_patient_n_observations_all_referencing_patient() {
        let record = lab_record();
        let bundle = build_bundle(&record, &config());
        assert_eq!(bundle.resource_type, "Bundle");
        assert_eq!(bundle.bundle_type, "collection");
        assert_eq!(bundle.entry.len(), 3);

        let patients: Vec<_> = bundle
            .entry
            .iter()
            .filter(|e| matches!(e.resource, Resource::Patient(_)))
            .collect();
        assert_eq!(patients.len(), 1);

        for entry in &bundle.entry {
            if let Resource::Observation(obs) = &entry.resource {
                assert_eq!(obs.subject.reference, "Patient/patient-1");
            }
        }
    }

    #[test]
    fn patient_resource_carries_identifier_and_name() {
        let bundle = build_bundle(&lab_record(), &config());
        let Resource::Patient(patient) = &bundle.entry[0].resource else {
            panic!("first entry must be the Patient");
        };
        assert_eq!(patient.id, "patient-1");
        assert_eq!(patient.identifier.as_ref().unwrap()[0].value, "445566");
        assert_eq!(
            patient.name.as_ref().unwrap()[0].family.as_deref(),
            Some("Carter")
        );
    }

    #[test]
    fn numeric_value_becomes_quantity_with_unit() {
        let bundle = build_bundle(&lab_record(), &config());
        let Resource::Observation(obs) = &bundle.entry[1].resource else {
            panic!("expected observation");
        };
        let quantity = obs.value_quantity.as_ref().unwrap();
        assert_eq!(quantity.value, 13.7);
        assert_eq!(quantity.unit.as_deref(), Some("g/dL"));
        assert!(obs.value_string.is_none());
    }

    #[test]
    fn text_value_becomes_string_not_quantity() {
        let mut record = lab_record();
        record.observations = vec![Observation::new("Lungs", "Patchy opacities")];
        record.patient.modality = Some("X-RAY".into());
        let bundle = build_bundle(&record, &config());
        let Resource::Observation(obs) = &bundle.entry[1].resource else {
            panic!("expected observation");
        };
        assert!(obs.value_quantity.is_none());
        assert_eq!(obs.value_string.as_deref(), Some("Patchy opacities"));
        assert_eq!(obs.category[0].coding[0].code, "imaging");
    }

    #[test]
    fn loinc_coding_attached_for_known_names_only() {
        let bundle = build_bundle(&lab_record(), &config());
        let Resource::Observation(hb) = &bundle.entry[1].resource else {
            panic!();
        };
        assert_eq!(hb.code.text.as_deref(), Some("Haemoglobin"));
        assert_eq!(hb.code.coding[0].system, LOINC_SYSTEM);
        assert_eq!(hb.code.coding[0].code, "718-7");

        let mut record = lab_record();
        record.observations = vec![Observation::new("Obscure Biomarker", 1.0)];
        let bundle = build_bundle(&record, &config());
        let Resource::Observation(obs) = &bundle.entry[1].resource else {
            panic!();
        };
        assert!(obs.code.coding.is_empty());
        assert_eq!(obs.code.text.as_deref(), Some("Obscure Biomarker"));
    }

    #[test]
    fn reference_range_bounds_carry_observation_unit() {
        let bundle = build_bundle(&lab_record(), &config());
        let Resource::Observation(obs) = &bundle.entry[1].resource else {
            panic!();
        };
        let range = &obs.reference_range.as_ref().unwrap()[0];
        assert_eq!(range.low.as_ref().unwrap().value, 13.0);
        assert_eq!(range.low.as_ref().unwrap().unit.as_deref(), Some("g/dL"));
        assert_eq!(range.high.as_ref().unwrap().value, 17.0);
    }

    #[test]
    fn explicit_flag_becomes_interpretation() {
        let bundle = build_bundle(&lab_record(), &config());
        let Resource::Observation(wbc) = &bundle.entry[2].resource else {
            panic!();
        };
        let coding = &wbc.interpretation.as_ref().unwrap()[0].coding[0];
        assert_eq!(coding.system, INTERPRETATION_SYSTEM);
        assert_eq!(coding.code, "H");
    }

    #[test]
    fn interpretation_computed_from_range_when_enabled() {
        let mut record = lab_record();
        record.observations[1].flag = None; // 12500 vs [4000, 11000]
        let bundle = build_bundle(&record, &config());
        let Resource::Observation(wbc) = &bundle.entry[2].resource else {
            panic!();
        };
        assert_eq!(wbc.interpretation.as_ref().unwrap()[0].coding[0].code, "H");

        let mut cfg = config();
        cfg.compute_flags = false;
        let bundle = build_bundle(&record, &cfg);
        let Resource::Observation(wbc) = &bundle.entry[2].resource else {
            panic!();
        };
        assert!(wbc.interpretation.is_none());
    }

    #[test]
    fn effective_date_from_report_date() {
        let bundle = build_bundle(&lab_record(), &config());
        let Resource::Observation(obs) = &bundle.entry[1].resource else {
            panic!();
        };
        assert_eq!(obs.effective_date_time.as_deref(), Some("2024-03-02"));
    }

    #[test]
    fn invalid_birth_date_dropped() {
        let mut record = lab_record();
        record.patient.birth_date = Some("01/02/1980".into());
        let bundle = build_bundle(&record, &config());
        let Resource::Patient(patient) = &bundle.entry[0].resource else {
            panic!();
        };
        assert!(patient.birth_date.is_none());
    }

    #[test]
    fn backfill_pass_fills_missing_interpretation() {
        let mut cfg = config();
        cfg.compute_flags = false; // builder leaves interpretation empty
        let mut record = lab_record();
        record.observations[1].flag = None;
        let mut bundle = build_bundle(&record, &cfg);
        ensure_interpretation_from_range(&mut bundle);
        let Resource::Observation(wbc) = &bundle.entry[2].resource else {
            panic!();
        };
        assert_eq!(wbc.interpretation.as_ref().unwrap()[0].coding[0].code, "H");
    }

    #[test]
    fn backfill_pass_keeps_existing_interpretation() {
        let mut bundle = build_bundle(&lab_record(), &config());
        ensure_interpretation_from_range(&mut bundle);
        let Resource::Observation(wbc) = &bundle.entry[2].resource else {
            panic!();
        };
        assert_eq!(wbc.interpretation.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn serialized_bundle_has_no_nulls() {
        let bundle = build_bundle(&lab_record(), &config());
        let json = serde_json::to_string(&bundle).unwrap();
        assert!(!json.contains("null"), "unexpected null in {json}");
        assert!(json.contains("\"resourceType\":\"Bundle\""));
        assert!(json.contains("\"resourceType\":\"Observation\""));
    }

    #[test]
    fn vitals_modality_gets_vital_signs_category() {
        let mut record = lab_record();
        record.patient.modality = Some("VITALS".into());
        let bundle = build_bundle(&record, &config());
        let Resource::Observation(obs) = &bundle.entry[1].resource else {
            panic!();
        };
        assert_eq!(obs.category[0].coding[0].code, "vital-signs");
    }

    #[test]
    fn medication_request_round_trips_through_json() {
        let med = Resource::MedicationRequest(MedicationRequestResource {
            id: "med-1".into(),
            status: Some("active".into()),
            intent: "order".into(),
            medication_codeable_concept: CodeableConcept {
                text: Some("Amoxicillin".into()),
                coding: vec![],
            },
            subject: Reference {
                reference: "Patient/patient-1".into(),
            },
            authored_on: None,
            dosage_instruction: Some(vec![Dosage {
                text: Some("500mg Twice Daily".into()),
            }]),
        });
        let json = serde_json::to_value(&med).unwrap();
        assert_eq!(json["resourceType"], "MedicationRequest");
        assert_eq!(json["medicationCodeableConcept"]["text"], "Amoxicillin");
        let back: Resource = serde_json::from_value(json).unwrap();
        assert!(matches!(back, Resource::MedicationRequest(_)));
    }
}
