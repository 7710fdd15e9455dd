use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use super::Validator;
use super::extractor::{parse_model_json, provider_error};
use crate::anthropic::{Message, MessageSender, MessagesRequest};
use crate::cleaning::parse_number;
use crate::contract::{ExtractedFields, PolicyChunk, PolicyViolation, ValidationReport};
use crate::error::FailureKind;
use crate::state_machine::StageError;

static POLICY_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\$\s?\d[\d,]*(?:\.\d+)?(?:\s?(?:k|m|thousand|million)\b)?|\d[\d,]*(?:\.\d+)?\s?usd\b)")
        .expect("valid regex")
});

/// Smallest dollar amount any retrieved chunk mentions.
fn policy_limit(chunks: &[PolicyChunk]) -> Option<f64> {
    chunks
        .iter()
        .flat_map(|chunk| POLICY_AMOUNT.find_iter(&chunk.content))
        .filter_map(|m| parse_number(m.as_str()))
        .filter(|v| *v > 0.0)
        .reduce(f64::min)
}

/// Deterministic validator that needs no model.
///
/// The approval limit is the smallest `$`/`USD` amount in the retrieved
/// policy text, falling back to the configured threshold. Any violation asks
/// for human review; confidence is the share of critical fields resolved.
#[derive(Debug, Clone, Copy)]
pub struct RuleValidator {
    pub policy_threshold: f64,
}

impl RuleValidator {
    pub fn new(policy_threshold: f64) -> Self {
        Self { policy_threshold }
    }

    pub fn report(&self, fields: &ExtractedFields, chunks: &[PolicyChunk]) -> ValidationReport {
        let limit = policy_limit(chunks).unwrap_or(self.policy_threshold);
        let mut violations = Vec::new();

        if let Some(value) = fields.total_value.filter(|v| *v > limit) {
            violations.push(PolicyViolation::new(
                "value_over_threshold",
                format!("total value {value:.2} exceeds approval limit {limit:.2}"),
            ));
        }
        for field in fields.missing_critical() {
            violations.push(PolicyViolation::new(
                format!("missing_{field}"),
                format!("{field} is missing or unresolved"),
            ));
        }

        let requires_human_review = !violations.is_empty();
        ValidationReport {
            confidence: fields.completeness(),
            requires_human_review,
            rationale: Some(format!(
                "{} violation(s) against an approval limit of {limit:.2}",
                violations.len()
            )),
            violations,
        }
    }
}

#[async_trait]
impl Validator for RuleValidator {
    async fn validate(
        &self,
        fields: &ExtractedFields,
        chunks: &[PolicyChunk],
    ) -> Result<Value, StageError> {
        serde_json::to_value(self.report(fields, chunks))
            .map_err(|e| StageError::new(FailureKind::SchemaViolation, e.to_string()))
    }
}

const VALIDATION_SYSTEM_PROMPT: &str = "You check vendor contracts against company policy. \
Reply with a single JSON object with exactly these keys: \
\"confidence\" (number 0..1), \"requires_human_review\" (boolean), \
\"violations\" (array of {\"code\": string, \"detail\": string}), \"rationale\" (string).";

/// Validation through the Anthropic Messages API, grounded on the retrieved
/// policy chunks.
pub struct AnthropicValidator {
    sender: Arc<dyn MessageSender>,
    model: String,
}

impl AnthropicValidator {
    pub fn new(sender: Arc<dyn MessageSender>, model: impl Into<String>) -> Self {
        Self {
            sender,
            model: model.into(),
        }
    }

    fn prompt(fields: &ExtractedFields, chunks: &[PolicyChunk]) -> Result<String, StageError> {
        let fields_json = serde_json::to_string_pretty(fields)
            .map_err(|e| StageError::new(FailureKind::SchemaViolation, e.to_string()))?;
        let policy = chunks
            .iter()
            .map(|c| format!("[{}]\n{}", c.source, c.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(format!(
            "Contract fields:\n{fields_json}\n\nRelevant policy:\n{policy}\n\n\
             Flag every policy violation. Ask for human review when unsure."
        ))
    }
}

#[async_trait]
impl Validator for AnthropicValidator {
    async fn validate(
        &self,
        fields: &ExtractedFields,
        chunks: &[PolicyChunk],
    ) -> Result<Value, StageError> {
        let req = MessagesRequest {
            model: self.model.clone(),
            max_tokens: 1024,
            system: Some(VALIDATION_SYSTEM_PROMPT.to_string()),
            messages: vec![Message::user(Self::prompt(fields, chunks)?)],
            temperature: Some(0.0),
        };
        let resp = self.sender.send_message(&req).await.map_err(provider_error)?;
        parse_model_json(&resp.text())
    }
}
