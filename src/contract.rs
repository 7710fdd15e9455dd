//! Domain types shared by the pipeline stages, the router and the store.
//!
//! [`ExtractedFields`] is the cleaned output of the extraction stage,
//! [`ValidationReport`] the strictly-parsed output of the validation stage,
//! and [`Outcome`] the immutable result of a completed pipeline run.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned to a contract record by the store.
pub type ContractId = String;

/// An inbound document plus the envelope metadata it arrived with.
#[derive(Debug, Clone)]
pub struct ContractPayload {
    pub sender: String,
    pub subject: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl ContractPayload {
    pub fn new(
        sender: impl Into<String>,
        subject: impl Into<String>,
        filename: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            sender: sender.into(),
            subject: subject.into(),
            filename: filename.into(),
            bytes,
            received_at: Utc::now(),
        }
    }
}

/// Canonical contract attributes after the cleaning pass.
///
/// `None` means the attribute was absent or null-like in the model output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub vendor_name: Option<String>,
    pub contract_start_date: Option<String>,
    pub contract_end_date: Option<String>,
    pub total_value: Option<f64>,
    #[serde(default)]
    pub payment_terms_days: Option<i64>,
    #[serde(default)]
    pub auto_renewal: Option<bool>,
    #[serde(default)]
    pub governing_law: Option<String>,
}

/// Names of the critical fields, in the order they are reported.
pub const CRITICAL_FIELDS: [&str; 4] = [
    "vendor_name",
    "contract_start_date",
    "contract_end_date",
    "total_value",
];

impl ExtractedFields {
    /// Critical fields that are missing or could not be resolved to a usable value.
    ///
    /// Dates count as unresolved unless they are ISO `YYYY-MM-DD`; the value
    /// counts as unresolved unless it is finite and positive.
    pub fn missing_critical(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !has_text(&self.vendor_name) {
            missing.push(CRITICAL_FIELDS[0]);
        }
        if !is_iso_date(&self.contract_start_date) {
            missing.push(CRITICAL_FIELDS[1]);
        }
        if !is_iso_date(&self.contract_end_date) {
            missing.push(CRITICAL_FIELDS[2]);
        }
        if !self.total_value.is_some_and(|v| v.is_finite() && v > 0.0) {
            missing.push(CRITICAL_FIELDS[3]);
        }
        missing
    }

    pub fn all_critical_present(&self) -> bool {
        self.missing_critical().is_empty()
    }

    /// Fraction of critical fields that are resolved, rounded to two decimals.
    pub fn completeness(&self) -> f64 {
        let resolved = CRITICAL_FIELDS.len() - self.missing_critical().len();
        let ratio = resolved as f64 / CRITICAL_FIELDS.len() as f64;
        (ratio * 100.0).round() / 100.0
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.trim().is_empty())
}

fn is_iso_date(value: &Option<String>) -> bool {
    value
        .as_deref()
        .is_some_and(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").is_ok())
}

/// A ranked fragment of policy text used to ground validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyChunk {
    pub source: String,
    pub content: String,
    pub score: f64,
}

/// A single policy breach reported by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyViolation {
    pub code: String,
    pub detail: String,
}

impl PolicyViolation {
    pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.detail)
        }
    }
}

// Validators may report a violation as a bare string or as an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum ViolationRepr {
    Text(String),
    Object {
        code: String,
        #[serde(default)]
        detail: String,
    },
}

impl<'de> Deserialize<'de> for PolicyViolation {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match ViolationRepr::deserialize(deserializer)? {
            ViolationRepr::Text(code) => PolicyViolation::new(code, ""),
            ViolationRepr::Object { code, detail } => PolicyViolation { code, detail },
        })
    }
}

/// Strict shape of the validation stage's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationReport {
    pub confidence: f64,
    pub requires_human_review: bool,
    pub violations: Vec<PolicyViolation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl ValidationReport {
    /// Range checks serde cannot express.
    pub fn check(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside 0..1", self.confidence));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Review,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approved => write!(f, "approved"),
            Decision::Review => write!(f, "review"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// The router's verdict with the reasons that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub decision: Decision,
    pub risk_level: RiskLevel,
    pub reasons: Vec<String>,
}

/// Immutable result of a completed pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub decision: Decision,
    pub risk_level: RiskLevel,
    pub requires_review: bool,
    pub extracted_fields: ExtractedFields,
    pub violations: Vec<PolicyViolation>,
    pub reasons: Vec<String>,
    /// Store-assigned id, or the request id when the record was not persisted.
    pub contract_record_id: ContractId,
    pub persisted: bool,
}
