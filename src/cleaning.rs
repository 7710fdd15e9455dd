//! Normalisation of raw extraction output before strict validation.
//!
//! Language models return contract fields as loosely-typed JSON: currency
//! strings, free-form dates, "N/A" placeholders. [`clean_fields`] coerces
//! that payload into [`ExtractedFields`] without touching any model, so the
//! rules here can be exercised with adversarial strings directly.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::contract::ExtractedFields;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CleaningError {
    #[error("extraction payload is not a JSON object")]
    NotAnObject,

    #[error("field `{field}` has unusable type: {found}")]
    WrongType { field: &'static str, found: &'static str },
}

const NULLISH: &[&str] = &[
    "",
    "-",
    "n/a",
    "na",
    "none",
    "null",
    "nil",
    "unknown",
    "not specified",
    "not available",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid regex"));
static ORDINAL_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d)(st|nd|rd|th)\b").expect("valid regex"));
static CURRENCY_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(usd|us\$|dollars?|eur|euros?|gbp|pounds?|lkr|rs|inr)\b")
        .expect("valid regex")
});
static MAGNITUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(k|m|b|thousand|million|billion)\b").expect("valid regex")
});

/// Coerce a raw extraction payload into typed fields.
///
/// Unknown keys are dropped. Null-like tokens become `None`. A payload that
/// is not an object, or a field whose JSON type cannot be coerced, is an error.
pub fn clean_fields(raw: &Value) -> Result<ExtractedFields, CleaningError> {
    let obj = raw.as_object().ok_or(CleaningError::NotAnObject)?;

    Ok(ExtractedFields {
        vendor_name: text_field(obj, "vendor_name")?,
        contract_start_date: date_field(obj, "contract_start_date")?,
        contract_end_date: date_field(obj, "contract_end_date")?,
        total_value: number_field(obj, "total_value")?,
        payment_terms_days: number_field(obj, "payment_terms_days")?.map(|v| v.trunc() as i64),
        auto_renewal: bool_field(obj, "auto_renewal")?,
        governing_law: text_field(obj, "governing_law")?,
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn text_field(obj: &Map<String, Value>, field: &'static str) -> Result<Option<String>, CleaningError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(to_text(s)),
        Some(Value::Number(n)) => Ok(to_text(&n.to_string())),
        Some(Value::Bool(b)) => Ok(to_text(&b.to_string())),
        Some(other) => Err(CleaningError::WrongType {
            field,
            found: type_name(other),
        }),
    }
}

fn date_field(obj: &Map<String, Value>, field: &'static str) -> Result<Option<String>, CleaningError> {
    Ok(text_field(obj, field)?.map(|text| parse_date_to_iso(&text).unwrap_or(text)))
}

fn number_field(obj: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, CleaningError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64().filter(|v| v.is_finite())),
        Some(Value::String(s)) => Ok(parse_number(s)),
        Some(other) => Err(CleaningError::WrongType {
            field,
            found: type_name(other),
        }),
    }
}

fn bool_field(obj: &Map<String, Value>, field: &'static str) -> Result<Option<bool>, CleaningError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Number(n)) => Ok(n.as_f64().map(|v| v != 0.0)),
        Some(Value::String(s)) => Ok(parse_bool(s)),
        Some(other) => Err(CleaningError::WrongType {
            field,
            found: type_name(other),
        }),
    }
}

/// Collapse whitespace; null-like tokens become `None`.
pub fn to_text(value: &str) -> Option<String> {
    let collapsed = WHITESPACE.replace_all(value, " ").trim().to_string();
    if is_nullish(&collapsed) {
        None
    } else {
        Some(collapsed)
    }
}

fn is_nullish(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    NULLISH.contains(&lower.as_str())
}

/// Parse currency-ish text into a number.
///
/// Handles thousands separators, currency symbols and words, accounting
/// negatives `(1,200)` and magnitude suffixes (`250k`, `1.5 million`).
pub fn parse_number(value: &str) -> Option<f64> {
    let mut text = value.trim().to_string();
    if text.is_empty() || is_nullish(&text) {
        return None;
    }

    let negative = text.starts_with('(') && text.ends_with(')');
    if negative {
        text = text[1..text.len() - 1].trim().to_string();
    }

    text = text.replace(',', "");
    text = CURRENCY_WORD.replace_all(&text, "").into_owned();
    text = text.replace(['$', '€', '£'], " ");
    text = WHITESPACE.replace_all(&text, " ").trim().to_string();

    let m = NUMBER.find(&text)?;
    let mut parsed: f64 = m.as_str().parse().ok()?;

    if let Some(caps) = MAGNITUDE.captures(&text[m.end()..]) {
        parsed *= match caps[1].to_lowercase().as_str() {
            "k" | "thousand" => 1_000.0,
            "m" | "million" => 1_000_000.0,
            "b" | "billion" => 1_000_000_000.0,
            _ => 1.0,
        };
    }

    if negative {
        parsed = -parsed;
    }

    parsed.is_finite().then_some(parsed)
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Parse a free-form date into ISO `YYYY-MM-DD`. Returns `None` when no format matches.
pub fn parse_date_to_iso(value: &str) -> Option<String> {
    let stripped = ORDINAL_SUFFIX.replace_all(value.trim(), "$1");
    let normalized = WHITESPACE.replace_all(&stripped, " ");

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&normalized, fmt).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cleans_currency_dates_and_noise() {
        let raw = json!({
            "vendor_name": "  ACME   Holdings  ",
            "contract_start_date": "March 1st, 2026",
            "contract_end_date": "03/31/2027",
            "total_value": "$70,000 USD",
            "unexpected_key": "should_be_ignored",
        });

        let fields = clean_fields(&raw).unwrap();
        assert_eq!(fields.vendor_name.as_deref(), Some("ACME Holdings"));
        assert_eq!(fields.contract_start_date.as_deref(), Some("2026-03-01"));
        assert_eq!(fields.contract_end_date.as_deref(), Some("2027-03-31"));
        assert_eq!(fields.total_value, Some(70_000.0));
    }

    #[test]
    fn nullish_tokens_and_magnitudes() {
        let raw = json!({
            "vendor_name": "N/A",
            "contract_start_date": "unknown",
            "contract_end_date": "",
            "total_value": "1.5 million dollars",
        });

        let fields = clean_fields(&raw).unwrap();
        assert_eq!(fields.vendor_name, None);
        assert_eq!(fields.contract_start_date, None);
        assert_eq!(fields.contract_end_date, None);
        assert_eq!(fields.total_value, Some(1_500_000.0));
    }

    #[test]
    fn adversarial_number_strings() {
        assert_eq!(parse_number("(1,200)"), Some(-1_200.0));
        assert_eq!(parse_number("250k"), Some(250_000.0));
        assert_eq!(parse_number("EUR 3.5 billion"), Some(3_500_000_000.0));
        assert_eq!(parse_number("£ 12"), Some(12.0));
        assert_eq!(parse_number("Not Specified"), None);
        assert_eq!(parse_number("TBD"), None);
        assert_eq!(parse_number("   "), None);
        // a stray "m" word later in the text is not a magnitude
        assert_eq!(parse_number("$500 per month"), Some(500.0));
    }

    #[test]
    fn date_formats_normalize_to_iso() {
        assert_eq!(parse_date_to_iso("2026/01/15").as_deref(), Some("2026-01-15"));
        assert_eq!(parse_date_to_iso("15 January 2026").as_deref(), Some("2026-01-15"));
        assert_eq!(parse_date_to_iso("Jan 15, 2026").as_deref(), Some("2026-01-15"));
        assert_eq!(parse_date_to_iso("22nd   Feb 2026").as_deref(), Some("2026-02-22"));
        assert_eq!(parse_date_to_iso("25-12-2026").as_deref(), Some("2026-12-25"));
        assert_eq!(parse_date_to_iso("sometime next year"), None);
    }

    #[test]
    fn unparseable_date_text_is_kept_verbatim() {
        let fields = clean_fields(&json!({"contract_end_date": "upon completion"})).unwrap();
        assert_eq!(fields.contract_end_date.as_deref(), Some("upon completion"));
        assert!(fields.missing_critical().contains(&"contract_end_date"));
    }

    #[test]
    fn booleans_and_integers() {
        let fields = clean_fields(&json!({
            "auto_renewal": "Yes",
            "payment_terms_days": "30 days",
        }))
        .unwrap();
        assert_eq!(fields.auto_renewal, Some(true));
        assert_eq!(fields.payment_terms_days, Some(30));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn structural_violations_are_errors() {
        assert_eq!(clean_fields(&json!(["not", "an", "object"])), Err(CleaningError::NotAnObject));
        assert_eq!(
            clean_fields(&json!({"total_value": true})),
            Err(CleaningError::WrongType {
                field: "total_value",
                found: "bool"
            })
        );
        assert_eq!(
            clean_fields(&json!({"vendor_name": {"name": "Acme"}})),
            Err(CleaningError::WrongType {
                field: "vendor_name",
                found: "object"
            })
        );
    }
}
