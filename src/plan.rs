//! Declarative transform plan and its fixed execution engine.
//!
//! The model never authors executable code: plan generation returns a JSON
//! description of the conversion (source column, transform chain, and default
//! behavior per target field) and this audited engine interprets it against
//! the row set. A plan that defines no field rules, or skips a required
//! field, is rejected the way a script without its entry point would be.

use crate::sheet::CellValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One output record: target field name to string value. Required fields
/// resolve to JSON `null` when the source cell is missing or empty; optional
/// fields default to the empty string.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum PlanError {
    /// Syntax-class failure: the persisted plan text is not valid JSON of the
    /// expected shape.
    #[error("plan text does not parse: {0}")]
    Syntax(String),
    /// The plan defines no field rules at all.
    #[error("plan defines no field rules")]
    EmptyPlan,
    /// The plan has no rule for one or more required target fields.
    #[error("plan does not handle required fields: {0:?}")]
    RequiredFieldUnhandled(Vec<String>),
    /// Runtime-class failure: a rule names a transform the engine does not
    /// implement.
    #[error("unknown transform '{transform}' for field '{target}'")]
    UnknownTransform { target: String, transform: String },
}

impl PlanError {
    /// Syntax-class failures come from loading the plan; everything else
    /// surfaces while interpreting it.
    pub fn is_syntax(&self) -> bool {
        matches!(self, PlanError::Syntax(_))
    }
}

/// The whole conversion description returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformPlan {
    /// Leading rows to skip (the detected header rows).
    #[serde(default)]
    pub skip_rows: usize,
    #[serde(default)]
    pub fields: Vec<FieldRule>,
}

/// How one target field is produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRule {
    pub target: String,
    /// Source column index; `None` means the field has no source and always
    /// takes its default.
    #[serde(default)]
    pub column: Option<usize>,
    /// Transform names applied in order. Resolved at execution time.
    #[serde(default)]
    pub transforms: Vec<String>,
    #[serde(default)]
    pub required: bool,
    /// Value used when the source cell is missing or empty. Without one,
    /// required fields resolve to `null` and optional fields to `""`.
    #[serde(default)]
    pub default: Option<String>,
}

/// Parse plan text (already fence-stripped) as JSON.
pub fn parse_plan(text: &str) -> Result<TransformPlan, PlanError> {
    serde_json::from_str(text).map_err(|e| PlanError::Syntax(e.to_string()))
}

/// Check the plan covers every required target field before any row is
/// touched.
pub fn validate_plan(plan: &TransformPlan, required: &[String]) -> Result<(), PlanError> {
    if plan.fields.is_empty() {
        return Err(PlanError::EmptyPlan);
    }
    let unhandled: Vec<String> = required
        .iter()
        .filter(|f| !plan.fields.iter().any(|r| &r.target == *f))
        .cloned()
        .collect();
    if !unhandled.is_empty() {
        return Err(PlanError::RequiredFieldUnhandled(unhandled));
    }
    Ok(())
}

/// Interpret the plan against the full row set.
pub fn execute_plan(
    plan: &TransformPlan,
    rows: &[Vec<CellValue>],
    required: &[String],
) -> Result<Vec<Record>, PlanError> {
    validate_plan(plan, required)?;

    let mut records = Vec::new();
    for row in rows.iter().skip(plan.skip_rows) {
        let mut record = Record::new();
        for rule in &plan.fields {
            let is_required = rule.required || required.contains(&rule.target);

            let raw = rule
                .column
                .and_then(|idx| row.get(idx))
                .and_then(|cell| cell.as_display());

            let value = match raw {
                Some(mut text) => {
                    for transform in &rule.transforms {
                        text = apply_transform(transform, text).ok_or_else(|| {
                            PlanError::UnknownTransform {
                                target: rule.target.clone(),
                                transform: transform.clone(),
                            }
                        })?;
                    }
                    Value::String(text)
                }
                None => match &rule.default {
                    Some(default) => Value::String(default.clone()),
                    None if is_required => Value::Null,
                    None => Value::String(String::new()),
                },
            };
            record.insert(rule.target.clone(), value);
        }
        records.push(record);
    }

    Ok(records)
}

/// The closed transform vocabulary. `None` for names outside it.
fn apply_transform(name: &str, value: String) -> Option<String> {
    let out = match name {
        "trim" => value.trim().to_string(),
        "uppercase" => value.to_uppercase(),
        "lowercase" => value.to_lowercase(),
        "strip_punctuation" => value.chars().filter(|c| c.is_alphanumeric()).collect(),
        "to_number" => {
            let cleaned: String = value.chars().filter(|c| *c != ',' && *c != ' ').collect();
            match cleaned.parse::<f64>() {
                Ok(n) if n == n.trunc() => format!("{}", n as i64),
                Ok(n) => format!("{}", n),
                Err(_) => value,
            }
        }
        "to_integer" => {
            let cleaned: String = value.chars().filter(|c| *c != ',' && *c != ' ').collect();
            match cleaned.parse::<f64>() {
                Ok(n) => format!("{}", n.trunc() as i64),
                Err(_) => value,
            }
        }
        _ => return None,
    };
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    fn required() -> Vec<String> {
        vec![
            "distributorCode".to_string(),
            "CustomerName".to_string(),
            "AccountNumber".to_string(),
        ]
    }

    fn rule(target: &str, column: usize) -> FieldRule {
        FieldRule {
            target: target.to_string(),
            column: Some(column),
            transforms: Vec::new(),
            required: false,
            default: None,
        }
    }

    fn full_plan() -> TransformPlan {
        TransformPlan {
            skip_rows: 0,
            fields: vec![
                rule("distributorCode", 0),
                rule("CustomerName", 1),
                rule("AccountNumber", 2),
                rule("Rank", 3),
            ],
        }
    }

    #[test]
    fn end_to_end_two_rows() {
        let rows = vec![
            vec![text("D001"), text("ABC"), text("AC123"), text("A")],
            vec![text("D002"), text("XYZ"), text("AC999"), text("B")],
        ];
        let records = execute_plan(&full_plan(), &rows, &required()).unwrap();
        assert_eq!(records.len(), 2);
        for (record, rank) in records.iter().zip(["A", "B"]) {
            for field in ["distributorCode", "CustomerName", "AccountNumber"] {
                let value = record[field].as_str().unwrap();
                assert!(!value.is_empty(), "{} should be non-empty", field);
            }
            assert_eq!(record["Rank"], serde_json::json!(rank));
        }
    }

    #[test]
    fn required_missing_is_null_optional_is_empty_string() {
        let rows = vec![vec![text("D001")]]; // columns 1-3 absent
        let records = execute_plan(&full_plan(), &rows, &required()).unwrap();
        assert_eq!(records[0]["CustomerName"], Value::Null);
        assert_eq!(records[0]["AccountNumber"], Value::Null);
        assert_eq!(records[0]["Rank"], serde_json::json!(""));
    }

    #[test]
    fn rule_default_fills_missing_cells() {
        let mut plan = full_plan();
        plan.fields[3].column = Some(5); // beyond the row
        plan.fields[3].default = Some("unranked".to_string());
        let rows = vec![vec![text("D001"), text("ABC"), text("AC123")]];
        let records = execute_plan(&plan, &rows, &required()).unwrap();
        assert_eq!(records[0]["Rank"], serde_json::json!("unranked"));

        // A default also overrides the null fallback for required fields
        let mut plan = full_plan();
        plan.fields[1].default = Some("UNKNOWN".to_string());
        let rows = vec![vec![text("D001")]];
        let records = execute_plan(&plan, &rows, &required()).unwrap();
        assert_eq!(records[0]["CustomerName"], serde_json::json!("UNKNOWN"));
        assert_eq!(records[0]["AccountNumber"], Value::Null);
    }

    #[test]
    fn sourceless_rule_takes_its_default() {
        let mut plan = full_plan();
        plan.fields.push(FieldRule {
            target: "BillingAddress1".to_string(),
            column: None,
            transforms: Vec::new(),
            required: false,
            default: Some("N/A".to_string()),
        });
        let rows = vec![vec![text("D001"), text("ABC"), text("AC123"), text("A")]];
        let records = execute_plan(&plan, &rows, &required()).unwrap();
        assert_eq!(records[0]["BillingAddress1"], serde_json::json!("N/A"));
    }

    #[test]
    fn skip_rows_drops_header() {
        let rows = vec![
            vec![text("code"), text("name"), text("acct"), text("rank")],
            vec![text("D001"), text("ABC"), text("AC123"), text("A")],
        ];
        let mut plan = full_plan();
        plan.skip_rows = 1;
        let records = execute_plan(&plan, &rows, &required()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["distributorCode"], serde_json::json!("D001"));
    }

    #[test]
    fn empty_plan_is_rejected() {
        let plan = TransformPlan {
            skip_rows: 0,
            fields: Vec::new(),
        };
        let err = execute_plan(&plan, &[], &required()).unwrap_err();
        assert!(matches!(err, PlanError::EmptyPlan));
        assert!(!err.is_syntax());
    }

    #[test]
    fn unhandled_required_field_is_rejected() {
        let plan = TransformPlan {
            skip_rows: 0,
            fields: vec![rule("distributorCode", 0)],
        };
        let err = validate_plan(&plan, &required()).unwrap_err();
        match err {
            PlanError::RequiredFieldUnhandled(fields) => {
                assert_eq!(fields, vec!["CustomerName", "AccountNumber"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_transform_is_runtime_error() {
        let mut plan = full_plan();
        plan.fields[0].transforms = vec!["reverse_words".to_string()];
        let rows = vec![vec![text("D001"), text("ABC"), text("AC123"), text("A")]];
        let err = execute_plan(&plan, &rows, &required()).unwrap_err();
        assert!(matches!(err, PlanError::UnknownTransform { .. }));
        assert!(!err.is_syntax());
    }

    #[test]
    fn transforms_apply_in_order() {
        assert_eq!(apply_transform("trim", "  x  ".into()).unwrap(), "x");
        assert_eq!(apply_transform("uppercase", "ab1".into()).unwrap(), "AB1");
        assert_eq!(apply_transform("lowercase", "AB1".into()).unwrap(), "ab1");
        assert_eq!(
            apply_transform("strip_punctuation", "123.456.789-00".into()).unwrap(),
            "12345678900"
        );
        assert_eq!(apply_transform("to_number", "1,234.50".into()).unwrap(), "1234.5");
        assert_eq!(apply_transform("to_integer", "1,234.9".into()).unwrap(), "1234");
        assert!(apply_transform("nope", "x".into()).is_none());
    }

    #[test]
    fn plan_text_syntax_error() {
        let err = parse_plan("def transform_data(): pass").unwrap_err();
        assert!(err.is_syntax());
    }

    #[test]
    fn plan_round_trips_from_wire_shape() {
        let plan = parse_plan(
            r#"{"skipRows": 1, "fields": [
                {"target": "distributorCode", "column": 0, "transforms": ["trim"], "required": true}
            ]}"#,
        )
        .unwrap();
        assert_eq!(plan.skip_rows, 1);
        assert_eq!(plan.fields[0].column, Some(0));
        assert_eq!(plan.fields[0].transforms, vec!["trim"]);
    }
}
