// Prompt templates for the extraction model, one per document type, plus
// the repair prompt driven by validation defects and attempt history.

use crate::models::{DocumentType, HistoryEntry, OutputFormat};

/// System prompt for every extraction call: evidence only, format only.
pub const EXTRACTION_SYSTEM_PROMPT: &str = "You are a medical data extraction agent. \
    Extract ONLY evidence from the image and return the requested format ONLY. \
    No markdown, no analysis, no chain-of-thought.";

/// Select the task prompt for the first attempt. Vitals share the lab
/// template: both are tabular name/value/unit documents.
pub fn build_extraction_prompt(doc_type: DocumentType) -> String {
    match doc_type {
        DocumentType::RadiologyReport => build_radiology_prompt(),
        DocumentType::Prescription => build_meds_prompt(),
        DocumentType::LabReport | DocumentType::Vitals => build_lab_prompt(),
    }
}

fn build_lab_prompt() -> String {
    "You are an expert medical OCR assistant. Extract the lab results from this image into a STRICT TSV (Tab Separated Values) format.\n\
    \n\
    1. METADATA: First, find and extract these fields from the top of the report:\n\
       PATIENT_NAME: <Full Name>\n\
       SAMPLE_ID: <ID Number>\n\
       REPORT_DATE: <Date>\n\
       MODALITY: LAB\n\
    \n\
    2. TABLE DATA: Extract every single row from the test results table.\n\
       Header: NAME\tVALUE\tUNIT\tREF_RANGE\tFLAG\n\
       (If the table has a 'TEST' column, map it to 'NAME')\n\
       FLAG column: if the result is marked 'H', 'High', 'L', 'Low', or bold/star, put 'H' or 'L'. Otherwise leave it empty.\n\
       REF_RANGE column: extract the reference range string exactly as shown (e.g. '13.0 - 17.0').\n\
       VALUE column: extract the number only. Remove any units or flags from this column.\n\
    \n\
    Output format example:\n\
    PATIENT_NAME: John Doe\n\
    SAMPLE_ID: 123456\n\
    REPORT_DATE: 2024-01-01\n\
    MODALITY: LAB\n\
    NAME\tVALUE\tUNIT\tREF_RANGE\tFLAG\n\
    Haemoglobin\tXX.X\tg/dl\t13.0-17.0\t\n\
    WBC Count\tYYYY\t/cumm\t4000-11000\tH\n\
    \n\
    CRITICAL INSTRUCTIONS:\n\
    - Extract ONLY text that is visible in the provided image.\n\
    - Do NOT use values from the example above.\n\
    - If a field is not found, leave it blank.\n"
        .to_string()
}

fn build_radiology_prompt() -> String {
    "You are a Senior Radiologist Consultant. Provide a structured diagnostic interpretation of this medical scan (X-RAY, CT, MRI, etc.).\n\
    \n\
    CRITICAL EXTRACTION RULES:\n\
    1. MULTIPLE ROWS: output EVERY anatomical finding as a SEPARATE ROW in the TSV table.\n\
    2. DO NOT CONCATENATE: never put all findings into one row. Break them down by anatomy (e.g., Lungs, Heart, Pleura, Bones).\n\
    3. STRICT TSV: use ONLY tabs between columns. Header: ANATOMY\tFINDING\tFLAG\n\
    \n\
    ANATOMY CHECKLIST (extract at least 4-5 rows if visible):\n\
    - LUNGS: parenchyma, opacities, or nodules.\n\
    - HEART: size and silhouette.\n\
    - PLEURA: effusions or thickening.\n\
    - BONES: fractures or alignment.\n\
    - IMPRESSION: summarize the final diagnosis in the LAST row.\n\
    \n\
    Metadata block:\n\
    PATIENT_NAME: <name or 'Unknown'>\n\
    MODALITY: X-RAY\n\
    \n\
    Output example (REQUIRED STRUCTURE):\n\
    ANATOMY\tFINDING\tFLAG\n\
    Lungs\tPatchy opacities detected\tH\n\
    Heart\tMild cardiomegaly observed\tH\n\
    Pleura\tNo effusion\t\n\
    Bones\tIntact, no fractures\t\n\
    IMPRESSION\tPneumonia with cardiomegaly\tH\n"
        .to_string()
}

fn build_meds_prompt() -> String {
    "You are an expert pharmacist. Extract the medication list from this prescription into a STRICT TSV format.\n\
    \n\
    1. METADATA: extract Patient Name and Date if visible.\n\
    2. DRUGS: list every drug found.\n\
    \n\
    Metadata:\n\
    PATIENT_NAME: <name>\n\
    MODALITY: MEDS\n\
    \n\
    Header: DRUG\tDOSAGE\tFREQUENCY\n\
    \n\
    Guidelines:\n\
    - DRUG: name of the medicine (e.g., 'Amoxicillin').\n\
    - DOSAGE: strength (e.g., '500mg').\n\
    - FREQUENCY: how often (e.g., 'Twice Daily', 'BD', 'TID').\n\
    - If dosage and frequency are combined, split them if possible, or put the remaining info in FREQUENCY.\n\
    \n\
    CRITICAL:\n\
    - Extract ONLY real text. Do NOT invent drugs.\n\
    - Output TSV only.\n"
        .to_string()
}

/// Render the last three attempts as a short status digest.
pub fn format_history_summary(history: &[HistoryEntry]) -> String {
    let lines: Vec<String> = history
        .iter()
        .rev()
        .take(3)
        .rev()
        .map(|h| {
            format!(
                "- attempt {}: {} ({} errors)",
                h.attempt,
                h.status.as_str(),
                h.errors.len()
            )
        })
        .collect();
    if lines.is_empty() {
        "none".to_string()
    } else {
        lines.join("\n")
    }
}

/// Repair prompt for attempts after the first: the prior raw output, the
/// exact defect list, and a digest of recent attempts, so the model can
/// self-correct.
pub fn build_repair_prompt(
    prev_output: &str,
    errors: &[String],
    history: &[HistoryEntry],
    format: OutputFormat,
) -> String {
    let summary = format_history_summary(history);
    let errors_text = if errors.is_empty() {
        "- unknown error".to_string()
    } else {
        errors
            .iter()
            .map(|e| format!("- {e}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    match format {
        OutputFormat::Tsv => format!(
            "Previous extraction was invalid or incomplete. Fix it and return TSV ONLY.\n\
             Do not ask for another image. Use the same image context from the first attempt.\n\
             Header must be: NAME\\tVALUE\\tUNIT\\tREF_LOW\\tREF_HIGH\\tFLAG\n\
             Include all test rows; do not include placeholder/example values.\n\n\
             If previous output included PATIENT_NAME/SAMPLE_ID/REPORT_DATE, carry them forward unchanged.\n\n\
             Errors:\n{errors_text}\n\n\
             Recent attempts:\n{summary}\n\n\
             Previous output:\n{prev_output}"
        ),
        OutputFormat::Json => format!(
            "Previous extraction JSON was invalid or incomplete. Fix it and return JSON ONLY.\n\
             Do not ask for another image. Use the same image context from the first attempt.\n\
             Output must start with '{{' and end with '}}'.\n\
             Include all test rows; do not include placeholder/example values.\n\n\
             Errors:\n{errors_text}\n\n\
             Recent attempts:\n{summary}\n\n\
             Previous output:\n{prev_output}"
        ),
    }
}
