// Stateless text-level helpers shared by the parser, sanitizer, and
// bundle builder: numeric coercion, unit/name normalization, value+unit
// splitting, and date gating. No I/O, no configuration.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::models::{AbnormalFlag, ObsValue};

/// Result of splitting a combined "12.5 g/dL [H]" style string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueParts {
    pub value: Option<ObsValue>,
    pub unit: Option<String>,
    pub flag: Option<AbnormalFlag>,
}

/// Coerce text to a number, stripping thousands separators.
/// Non-numeric input comes back as trimmed text.
pub fn to_number(text: &str) -> ObsValue {
    let trimmed = text.trim();
    match trimmed.replace(',', "").parse::<f64>() {
        Ok(n) => ObsValue::Number(n),
        Err(_) => ObsValue::Text(trimmed.to_string()),
    }
}

/// Map the unit spellings models produce onto one canonical vocabulary.
/// Bracketed flag artifacts are stripped first; an unrecognized but
/// non-empty unit passes through unchanged.
pub fn normalize_unit(unit: &str) -> Option<String> {
    let stripped = unit
        .replace("[H]", "")
        .replace("[L]", "")
        .replace("[ ]", "");
    let stripped = stripped.trim();
    if stripped.is_empty() {
        return None;
    }
    let u = stripped.replace('µ', "u").replace("UL", "uL").replace("ul", "uL");
    let canonical = match u.to_lowercase().as_str() {
        "gm/dl" | "g/dl" => "g/dL",
        "pg" => "pg",
        "fl" => "fL",
        "%" => "%",
        "mill/mm3" | "mill/mm³" | "mill/cumm" | "mill/cmm" | "million/mm3" | "million/mm³"
        | "million/cumm" => "mill/cmm",
        _ => return Some(u),
    };
    Some(canonical.to_string())
}

/// Clean up a test name: leading markup characters and two recurring
/// OCR misreads seen in CBC reports.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .replace("M.C.H.2c", "M.C.H.C.")
        .replace("IMPATURE", "IMMATURE")
        .trim_start_matches(['(', '*', ')', '#', ' '])
        .trim()
        .to_string()
}

fn value_unit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([-+]?\d+(?:\.\d+)?)\s*([^\d]*)$").unwrap())
}

/// Split a combined value+unit string, recognizing embedded `[H]`/`[L]`
/// flags anywhere in the string.
pub fn split_value_unit(text: &str) -> ValueParts {
    let mut t = text.trim().to_string();
    if t.is_empty() {
        return ValueParts::default();
    }

    let mut flag = None;
    if t.contains("[H]") {
        flag = Some(AbnormalFlag::High);
        t = t.replace("[H]", "").trim().to_string();
    }
    if t.contains("[L]") {
        flag = Some(AbnormalFlag::Low);
        t = t.replace("[L]", "").trim().to_string();
    }
    t = t.replace('³', "3");

    match value_unit_regex().captures(&t) {
        Some(caps) => {
            let value = to_number(caps.get(1).map_or("", |m| m.as_str()));
            let unit = caps
                .get(2)
                .map(|m| m.as_str().trim())
                .filter(|u| !u.is_empty())
                .map(str::to_string);
            ValueParts {
                value: Some(value),
                unit,
                flag,
            }
        }
        None => ValueParts {
            value: Some(to_number(&t)),
            unit: None,
            flag,
        },
    }
}

/// Expected canonical unit for the common CBC test names. Used to
/// override units the model misread, and by deduplication to pick the
/// most plausible duplicate.
pub fn infer_unit_by_name(name: &str) -> Option<&'static str> {
    let n = name.to_lowercase();
    if n.contains("haemoglobin") || n.contains("hemoglobin") {
        return Some("g/dL");
    }
    if n.contains("r.b.c") || n.contains("rbc") || n.contains("red blood") {
        return Some("mill/cmm");
    }
    if n.contains("haematocrit") || n.contains("hct") || n.contains("pcv") {
        return Some("%");
    }
    if n.contains("mcv") {
        return Some("fL");
    }
    // MCHC before MCH: every MCHC name also contains "mch"
    if n.contains("mchc") {
        return Some("g/dL");
    }
    if n.contains("mch") {
        return Some("pg");
    }
    if n.contains("rdw") {
        return Some("%");
    }
    if n.contains("w.b.c") || n.contains("wbc") || n.contains("leukocyte") {
        return Some("/uL");
    }
    let differentials = ["neutrophils", "lymphocytes", "monocytes", "eosinophils", "basophils"];
    if n.contains("abs") && differentials.iter().any(|d| n.contains(d)) {
        return Some("/uL");
    }
    if differentials.iter().any(|d| n.contains(d)) {
        return Some("%");
    }
    if n.contains("platelet") && !n.contains("mpv") && !n.contains("fraction") {
        return Some("/uL");
    }
    if n.contains("mpv") {
        return Some("fL");
    }
    if n.contains("immature platelet fraction") {
        return Some("%");
    }
    None
}

/// Accept only dates already in 4-digit-year-first form. No free-form
/// date parsing: anything ambiguous is dropped rather than guessed.
pub fn normalize_date(text: &str) -> Option<String> {
    let v = text.trim();
    if v.is_empty() {
        return None;
    }
    if NaiveDate::parse_from_str(v, "%Y-%m-%d").is_ok() {
        return Some(v.to_string());
    }
    // Year-first strings with extra components ("2024-01-15 10:30") pass.
    let first = v.split('-').next().unwrap_or("");
    if v.contains('-') && first.len() == 4 && first.chars().all(|c| c.is_ascii_digit()) {
        return Some(v.to_string());
    }
    None
}

/// Slice out the outermost balanced `{...}` span, for responses where
/// the model wrapped its JSON in prose.
pub fn extract_json_candidate(text: &str) -> &str {
    let cleaned = text.trim();
    let Some(start) = cleaned.find('{') else {
        return cleaned;
    };
    let mut depth = 0usize;
    for (i, ch) in cleaned[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &cleaned[start..start + i + 1];
                }
            }
            _ => {}
        }
    }
    &cleaned[start..]
}

/// Strip a ```json ... ``` (or bare ``` ... ```) fence wrapper.
pub fn strip_code_fences(text: &str) -> &str {
    let cleaned = text.trim();
    if let Some(rest) = cleaned.strip_prefix("```json") {
        return rest.strip_suffix("```").unwrap_or(rest).trim();
    }
    if let Some(rest) = cleaned.strip_prefix("```") {
        return rest.strip_suffix("```").unwrap_or(rest).trim();
    }
    cleaned
}

fn thinking_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<unused94>.*?<unused95>").unwrap())
}

/// Remove deliberation spans between the model's thinking sentinels.
pub fn strip_thinking(text: &str) -> String {
    thinking_regex().replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_number_strips_thousands_separators() {
        assert_eq!(to_number("4,50,000"), ObsValue::Number(450000.0));
        assert_eq!(to_number(" 13.7 "), ObsValue::Number(13.7));
        assert_eq!(to_number("-2.5"), ObsValue::Number(-2.5));
    }

    #[test]
    fn to_number_keeps_text() {
        assert_eq!(to_number(" Verified "), ObsValue::Text("Verified".into()));
        assert_eq!(to_number("12/80"), ObsValue::Text("12/80".into()));
    }

    #[test]
    fn normalize_unit_canonical_vocabulary() {
        assert_eq!(normalize_unit("gm/dl"), Some("g/dL".into()));
        assert_eq!(normalize_unit("GM/DL"), Some("g/dL".into()));
        assert_eq!(normalize_unit("FL"), Some("fL".into()));
        assert_eq!(normalize_unit("pg"), Some("pg".into()));
        assert_eq!(normalize_unit("%"), Some("%".into()));
        assert_eq!(normalize_unit("mill/cumm"), Some("mill/cmm".into()));
        assert_eq!(normalize_unit("million/mm³"), Some("mill/cmm".into()));
    }

    #[test]
    fn normalize_unit_strips_flag_artifacts() {
        assert_eq!(normalize_unit("g/dl [H]"), Some("g/dL".into()));
        assert_eq!(normalize_unit("[L]"), None);
        assert_eq!(normalize_unit("   "), None);
    }

    #[test]
    fn normalize_unit_passes_unknown_through() {
        assert_eq!(normalize_unit("/cumm"), Some("/cumm".into()));
        assert_eq!(normalize_unit("µL"), Some("uL".into()));
        assert_eq!(normalize_unit("Twice Daily"), Some("Twice Daily".into()));
    }

    #[test]
    fn normalize_name_fixes_known_misreads() {
        assert_eq!(normalize_name("M.C.H.2c"), "M.C.H.C.");
        assert_eq!(normalize_name("IMPATURE PLATELET FRACTION"), "IMMATURE PLATELET FRACTION");
        assert_eq!(normalize_name("(*) Haemoglobin"), "Haemoglobin");
        assert_eq!(normalize_name("# RBC Count"), "RBC Count");
    }

    #[test]
    fn split_value_unit_basic() {
        let parts = split_value_unit("12.5 g/dL");
        assert_eq!(parts.value, Some(ObsValue::Number(12.5)));
        assert_eq!(parts.unit.as_deref(), Some("g/dL"));
        assert_eq!(parts.flag, None);
    }

    #[test]
    fn split_value_unit_embedded_flag() {
        let parts = split_value_unit("370 [H] /uL");
        assert_eq!(parts.value, Some(ObsValue::Number(370.0)));
        assert_eq!(parts.unit.as_deref(), Some("/uL"));
        assert_eq!(parts.flag, Some(AbnormalFlag::High));
    }

    #[test]
    fn split_value_unit_plain_number() {
        let parts = split_value_unit("8000");
        assert_eq!(parts.value, Some(ObsValue::Number(8000.0)));
        assert_eq!(parts.unit, None);
    }

    #[test]
    fn split_value_unit_superscript_folded() {
        let parts = split_value_unit("4.5 mill/mm³");
        assert_eq!(parts.value, Some(ObsValue::Number(4.5)));
        assert_eq!(parts.unit.as_deref(), Some("mill/mm3"));
    }

    #[test]
    fn split_value_unit_text_fallback() {
        let parts = split_value_unit("No effusion [L]");
        assert_eq!(parts.value, Some(ObsValue::Text("No effusion".into())));
        assert_eq!(parts.flag, Some(AbnormalFlag::Low));
        assert_eq!(parts.unit, None);
    }

    #[test]
    fn split_value_unit_empty() {
        assert_eq!(split_value_unit("   "), ValueParts::default());
    }

    #[test]
    fn infer_unit_covers_cbc_panel() {
        assert_eq!(infer_unit_by_name("Haemoglobin"), Some("g/dL"));
        assert_eq!(infer_unit_by_name("Total R.B.C. Count"), Some("mill/cmm"));
        assert_eq!(infer_unit_by_name("Haematocrit (PCV)"), Some("%"));
        assert_eq!(infer_unit_by_name("M.C.V."), Some("fL"));
        assert_eq!(infer_unit_by_name("MCHC"), Some("g/dL"));
        assert_eq!(infer_unit_by_name("MCH"), Some("pg"));
        assert_eq!(infer_unit_by_name("RDW-CV"), Some("%"));
        assert_eq!(infer_unit_by_name("Total WBC Count"), Some("/uL"));
        assert_eq!(infer_unit_by_name("Neutrophils"), Some("%"));
        assert_eq!(infer_unit_by_name("Neutrophils Abs"), Some("/uL"));
        assert_eq!(infer_unit_by_name("Platelet Count"), Some("/uL"));
        assert_eq!(infer_unit_by_name("MPV"), Some("fL"));
        assert_eq!(infer_unit_by_name("Lungs"), None);
    }

    #[test]
    fn normalize_date_year_first_only() {
        assert_eq!(normalize_date("2024-01-15"), Some("2024-01-15".into()));
        assert_eq!(normalize_date("2024-01-15 10:30"), Some("2024-01-15 10:30".into()));
        assert_eq!(normalize_date("15/01/2024"), None);
        assert_eq!(normalize_date("15-01-2024"), None);
        assert_eq!(normalize_date("January 15, 2024"), None);
        assert_eq!(normalize_date(""), None);
    }

    #[test]
    fn extract_json_candidate_nested() {
        let text = "Here you go: {\"a\": {\"b\": 1}} trailing";
        assert_eq!(extract_json_candidate(text), "{\"a\": {\"b\": 1}}");
    }

    #[test]
    fn extract_json_candidate_unbalanced_returns_tail() {
        let text = "prefix {\"a\": 1";
        assert_eq!(extract_json_candidate(text), "{\"a\": 1");
    }

    #[test]
    fn extract_json_candidate_no_brace() {
        assert_eq!(extract_json_candidate("  plain text "), "plain text");
    }

    #[test]
    fn strip_code_fences_json_fence() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\nNAME\tVALUE\n```"), "NAME\tVALUE");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn strip_thinking_removes_sentinel_span() {
        let text = "<unused94>let me think\nabout this<unused95>NAME\tVALUE";
        assert_eq!(strip_thinking(text), "NAME\tVALUE");
        assert_eq!(strip_thinking("no sentinels"), "no sentinels");
    }
}
