use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use super::Extractor;
use crate::anthropic::types::extract_json_object;
use crate::anthropic::{AnthropicError, Message, MessageSender, MessagesRequest};
use crate::document::bound_input;
use crate::error::FailureKind;
use crate::state_machine::StageError;

const EXTRACTION_SYSTEM_PROMPT: &str = "You extract structured data from vendor contracts. \
Reply with a single JSON object and nothing else. Use null for anything the contract does not state.";

const EXTRACTION_KEYS: &str = r#"{
  "vendor_name": string | null,
  "contract_start_date": string | null,
  "contract_end_date": string | null,
  "total_value": number | string | null,
  "payment_terms_days": number | null,
  "auto_renewal": boolean | null,
  "governing_law": string | null
}"#;

/// Map an API failure to the stage taxonomy. Every API failure is a
/// provider error and therefore retried within the stage bound.
pub(crate) fn provider_error(err: AnthropicError) -> StageError {
    StageError::new(FailureKind::ProviderError, err.to_string())
}

/// Parse the JSON object out of a model reply.
pub(crate) fn parse_model_json(reply: &str) -> Result<Value, StageError> {
    let json = extract_json_object(reply).ok_or_else(|| {
        StageError::new(FailureKind::SchemaViolation, "model reply contained no JSON object")
    })?;
    serde_json::from_str(json)
        .map_err(|e| StageError::new(FailureKind::SchemaViolation, format!("model reply is not valid JSON: {e}")))
}

/// Field extraction through the Anthropic Messages API.
pub struct AnthropicExtractor {
    sender: Arc<dyn MessageSender>,
    model: String,
    max_tokens: u32,
}

impl AnthropicExtractor {
    pub fn new(sender: Arc<dyn MessageSender>, model: impl Into<String>) -> Self {
        Self {
            sender,
            model: model.into(),
            max_tokens: 1024,
        }
    }
}

#[async_trait]
impl Extractor for AnthropicExtractor {
    async fn extract_fields(&self, text: &str, max_input_chars: usize) -> Result<Value, StageError> {
        let bounded = bound_input(text, max_input_chars);
        let req = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: Some(EXTRACTION_SYSTEM_PROMPT.to_string()),
            messages: vec![Message::user(format!(
                "Extract these fields as JSON:\n{EXTRACTION_KEYS}\n\nContract text:\n{bounded}"
            ))],
            temperature: Some(0.0),
        };

        let resp = self.sender.send_message(&req).await.map_err(provider_error)?;
        debug!(
            model = %self.model,
            input_tokens = resp.usage.input_tokens,
            output_tokens = resp.usage.output_tokens,
            "extraction reply received"
        );
        parse_model_json(&resp.text())
    }
}

struct LabelPattern {
    field: &'static str,
    regex: Regex,
}

fn label(field: &'static str, labels: &str) -> LabelPattern {
    // A label at the start of a line, then a colon, then the value up to end of line.
    let pattern = format!(r"(?im)^[ \t]*(?:{labels})[ \t]*:[ \t]*(.+?)[ \t]*$");
    LabelPattern {
        field,
        regex: Regex::new(&pattern).expect("valid label regex"),
    }
}

static LABELS: LazyLock<Vec<LabelPattern>> = LazyLock::new(|| {
    vec![
        label("vendor_name", "vendor(?: name)?|supplier|service provider|contractor"),
        label("contract_start_date", "effective date|start date|commencement date"),
        label("contract_end_date", "expiration date|expiry date|end date|termination date"),
        label("total_value", "total (?:contract )?value|contract value|total amount|total fees"),
        label("payment_terms_days", "payment terms"),
        label("auto_renewal", "auto[- ]?renewal|automatic renewal"),
        label("governing_law", "governing law"),
    ]
});

static NET_DAYS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:net\s*)?(\d{1,3})\s*(?:days)?").expect("valid regex"));

/// Offline extractor that reads labelled lines (`Vendor: ...`,
/// `Effective Date: ...`, `Total Value: ...`) out of the contract text.
///
/// Used when no model is configured. Values come back as raw strings and go
/// through the same cleaning pass as model output.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternExtractor;

impl PatternExtractor {
    fn fields_from(text: &str) -> Map<String, Value> {
        let mut fields = Map::new();
        for pattern in LABELS.iter() {
            let value = pattern
                .regex
                .captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());

            let value = match (pattern.field, value) {
                (_, None) => Value::Null,
                ("payment_terms_days", Some(raw)) => NET_DAYS
                    .captures(&raw)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<i64>().ok())
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                (_, Some(raw)) => Value::String(raw),
            };
            fields.insert(pattern.field.to_string(), value);
        }
        fields
    }
}

#[async_trait]
impl Extractor for PatternExtractor {
    async fn extract_fields(&self, text: &str, _max_input_chars: usize) -> Result<Value, StageError> {
        Ok(Value::Object(Self::fields_from(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::types::{ContentBlock, MessagesResponse, Usage};
    use crate::cleaning::clean_fields;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockSender {
        reply: Result<String, u16>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageSender for MockSender {
        async fn send_message(&self, req: &MessagesRequest) -> Result<MessagesResponse, AnthropicError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(req.system.is_some());
            match &self.reply {
                Ok(text) => Ok(MessagesResponse {
                    id: "msg_test".into(),
                    content: vec![ContentBlock {
                        content_type: "text".into(),
                        text: text.clone(),
                    }],
                    model: req.model.clone(),
                    stop_reason: Some("end_turn".into()),
                    usage: Usage::default(),
                }),
                Err(status) => Err(AnthropicError::ApiError {
                    status: *status,
                    message: "overloaded".into(),
                }),
            }
        }
    }

    fn extractor(reply: Result<String, u16>) -> AnthropicExtractor {
        AnthropicExtractor::new(
            Arc::new(MockSender {
                reply,
                calls: AtomicUsize::new(0),
            }),
            "claude-sonnet-4-5-20250929",
        )
    }

    #[tokio::test]
    async fn model_reply_in_fences_is_parsed() {
        let ex = extractor(Ok("```json\n{\"vendor_name\": \"Acme\", \"total_value\": \"$70,000\"}\n```".into()));
        let raw = ex.extract_fields("Vendor: Acme", 24_000).await.unwrap();
        assert_eq!(raw["vendor_name"], "Acme");
        assert_eq!(clean_fields(&raw).unwrap().total_value, Some(70_000.0));
    }

    #[tokio::test]
    async fn prose_reply_is_a_schema_violation() {
        let ex = extractor(Ok("I could not find any fields, sorry.".into()));
        let err = ex.extract_fields("text", 24_000).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::SchemaViolation);
    }

    #[tokio::test]
    async fn api_failure_is_a_provider_error() {
        let ex = extractor(Err(529));
        let err = ex.extract_fields("text", 24_000).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ProviderError);
        assert!(err.message.contains("529"));
    }

    #[tokio::test]
    async fn pattern_extractor_reads_labelled_lines() {
        let text = "Master Services Agreement\n\
                    Vendor: Acme Holdings\n\
                    Effective Date: January 1, 2026\n\
                    Expiration Date: 12/31/2026\n\
                    Total Value: $70,000 USD\n\
                    Payment Terms: Net 45\n\
                    Governing Law: Delaware";
        let raw = PatternExtractor.extract_fields(text, 24_000).await.unwrap();
        let fields = clean_fields(&raw).unwrap();

        assert_eq!(fields.vendor_name.as_deref(), Some("Acme Holdings"));
        assert_eq!(fields.contract_start_date.as_deref(), Some("2026-01-01"));
        assert_eq!(fields.contract_end_date.as_deref(), Some("2026-12-31"));
        assert_eq!(fields.total_value, Some(70_000.0));
        assert_eq!(fields.payment_terms_days, Some(45));
        assert_eq!(fields.governing_law.as_deref(), Some("Delaware"));
        assert!(fields.auto_renewal.is_none());
    }

    #[tokio::test]
    async fn pattern_extractor_leaves_unlabelled_fields_null() {
        let raw = PatternExtractor.extract_fields("just some prose", 24_000).await.unwrap();
        assert!(raw["vendor_name"].is_null());
        assert!(raw["total_value"].is_null());
    }

    #[tokio::test]
    async fn labelled_fields_survive_pdf_text_extraction() {
        let pdf = crate::document::minimal_pdf(&[
            "Supply Agreement",
            "Vendor: Initech LLC",
            "Total Value: $42,500",
        ])
        .unwrap();
        let text = PatternExtractor.extract_text(&pdf).await.unwrap();
        let fields = clean_fields(&PatternExtractor.extract_fields(&text, 24_000).await.unwrap()).unwrap();

        assert_eq!(fields.vendor_name.as_deref(), Some("Initech LLC"));
        assert_eq!(fields.total_value, Some(42_500.0));
    }

    #[tokio::test]
    async fn default_text_extraction_rejects_garbage() {
        let err = PatternExtractor.extract_text(b"%PDF-1.4 but nothing else").await.unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidDocument);
    }
}
