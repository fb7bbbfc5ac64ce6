//! Column-to-field mapping model and the required-field gate.
//!
//! Wire names are camelCase to match the frontend contract
//! (`columnIndex`, `matchedField`, `isHeaderPresent`, ...).

use serde::{Deserialize, Serialize};

/// One proposed column assignment. `matched_field` is empty for unmapped
/// columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEntry {
    pub column_index: usize,
    pub column_name: String,
    #[serde(default)]
    pub matched_field: String,
    #[serde(default)]
    pub confidence: f64,
}

/// LLM header-detection verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderDetection {
    pub is_header_present: bool,
    /// -1 when no header row exists.
    pub header_row_index: i64,
    #[serde(default)]
    pub reason: String,
}

/// LLM mapping proposal, also the shape of a refinement reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingProposal {
    #[serde(default)]
    pub mapping: Vec<MappingEntry>,
    #[serde(default)]
    pub missing_required_fields: Vec<String>,
    #[serde(default)]
    pub additional_notes: String,
}

/// Return every required field that no entry maps to, in the order the
/// required list gives them. Empty result means the gate passes.
pub fn missing_required_fields(mapping: &[MappingEntry], required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|field| !mapping.iter().any(|m| &m.matched_field == *field))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(idx: usize, name: &str, field: &str) -> MappingEntry {
        MappingEntry {
            column_index: idx,
            column_name: name.to_string(),
            matched_field: field.to_string(),
            confidence: 0.9,
        }
    }

    fn required() -> Vec<String> {
        vec![
            "distributorCode".to_string(),
            "CustomerName".to_string(),
            "AccountNumber".to_string(),
        ]
    }

    #[test]
    fn gate_reports_exact_missing_set() {
        let mapping = vec![entry(0, "code", "distributorCode"), entry(1, "rank", "Rank")];
        let missing = missing_required_fields(&mapping, &required());
        assert_eq!(missing, vec!["CustomerName", "AccountNumber"]);
    }

    #[test]
    fn gate_passes_regardless_of_optional_fields() {
        let mapping = vec![
            entry(0, "code", "distributorCode"),
            entry(1, "name", "CustomerName"),
            entry(2, "acct", "AccountNumber"),
        ];
        assert!(missing_required_fields(&mapping, &required()).is_empty());

        let with_optional = {
            let mut m = mapping.clone();
            m.push(entry(3, "rank", "Rank"));
            m.push(entry(4, "unmapped", ""));
            m
        };
        assert!(missing_required_fields(&with_optional, &required()).is_empty());
    }

    #[test]
    fn empty_matched_field_never_satisfies() {
        let mapping = vec![entry(0, "code", "")];
        let missing = missing_required_fields(&mapping, &required());
        assert_eq!(missing.len(), 3);
    }

    #[test]
    fn wire_names_are_camel_case() {
        let e = entry(2, "顧客名", "CustomerName");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["columnIndex"], 2);
        assert_eq!(json["matchedField"], "CustomerName");

        let parsed: MappingEntry = serde_json::from_value(serde_json::json!({
            "columnIndex": 0,
            "columnName": "code",
            "matchedField": "distributorCode",
            "confidence": 0.8
        }))
        .unwrap();
        assert_eq!(parsed.matched_field, "distributorCode");
    }
}
