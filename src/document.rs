//! Inbound document handling: PDF admission checks, text reading and
//! normalisation, and bounding long contract text before it reaches a model.

use std::sync::LazyLock;

use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};
use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// Every PDF starts with this signature.
pub const PDF_SIGNATURE: &[u8] = b"%PDF-";

const TRUNCATION_MARKER: &str = "[...TRUNCATED FOR TOKEN LIMIT...]";
const TRUNCATION_END_MARKER: &str = "[...END TRUNCATED SECTION...]";
const MIN_INPUT_CHARS: usize = 4_000;
const MAX_KEYWORD_SECTION_CHARS: usize = 1_200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document is empty")]
    Empty,

    #[error("document is not a PDF (missing %PDF- signature)")]
    NotPdf,

    #[error("document is {size} bytes, exceeding the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("invalid or corrupted PDF: {0}")]
    Corrupted(String),

    #[error("PDF did not contain extractable text")]
    NoText,

    #[error("could not render PDF: {0}")]
    Render(String),
}

/// Size bounds enforced at ingest.
#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    pub max_bytes: usize,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Admission check: PDF signature and size bounds.
pub fn check_pdf(bytes: &[u8], limits: IngestLimits) -> Result<(), DocumentError> {
    if bytes.is_empty() {
        return Err(DocumentError::Empty);
    }
    if !bytes.starts_with(PDF_SIGNATURE) {
        return Err(DocumentError::NotPdf);
    }
    if bytes.len() > limits.max_bytes {
        return Err(DocumentError::TooLarge {
            size: bytes.len(),
            max: limits.max_bytes,
        });
    }
    Ok(())
}

/// Extract the plain text of a PDF, normalised.
///
/// Parsing and text layout come from `pdf-extract`. Malformed files it
/// rejects, or panics on, are [`DocumentError::Corrupted`].
pub fn read_pdf_text(bytes: &[u8]) -> Result<String, DocumentError> {
    if !bytes.starts_with(PDF_SIGNATURE) {
        return Err(DocumentError::NotPdf);
    }

    let extracted = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| DocumentError::Corrupted("PDF parser gave up on this file".into()))?
        .map_err(|e| DocumentError::Corrupted(e.to_string()))?;

    let text = normalize_text(&extracted);
    if text.is_empty() {
        return Err(DocumentError::NoText);
    }
    Ok(text)
}

static INLINE_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\t\r\x0c\x0b]+").expect("valid regex"));
static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
static SPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").expect("valid regex"));
static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("valid regex"));
static CONTRACT_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(vendor|supplier|agreement|contract|effective|start|end|term|expires|amount|value|total|usd)\b|\$",
    )
    .expect("valid regex")
});

/// Collapse control whitespace, long blank runs and repeated spaces.
pub fn normalize_text(text: &str) -> String {
    let text = INLINE_WS.replace_all(text, " ");
    let text = BLANK_RUNS.replace_all(&text, "\n\n");
    let text = SPACE_RUNS.replace_all(&text, " ");
    text.trim().to_string()
}

/// Cut text down to `max_chars` characters for a model prompt.
///
/// Keeps the head (35%), the paragraphs that mention contract keywords, and
/// the tail (20%). Returns the text unchanged when it already fits.
pub fn bound_input(text: &str, max_chars: usize) -> String {
    let max_chars = max_chars.max(MIN_INPUT_CHARS);
    let normalized = text.trim();
    let total = normalized.chars().count();
    if total <= max_chars {
        return normalized.to_string();
    }

    let head_budget = max_chars * 35 / 100;
    let tail_budget = max_chars * 20 / 100;
    let middle_budget = max_chars
        .saturating_sub(head_budget + tail_budget + 128)
        .max(max_chars * 20 / 100);

    let head: String = normalized.chars().take(head_budget).collect();
    let tail: String = normalized.chars().skip(total - tail_budget).collect();
    let middle = keyword_sections(normalized, middle_budget);

    let bounded = format!(
        "{head}\n\n{TRUNCATION_MARKER}\n\n{middle}\n\n{TRUNCATION_END_MARKER}\n\n{tail}"
    );
    let bounded: String = bounded.chars().take(max_chars).collect();

    warn!(
        original_chars = total,
        bounded_chars = bounded.chars().count(),
        max_input_chars = max_chars,
        "contract text truncated before extraction"
    );
    bounded
}

fn keyword_sections(text: &str, budget: usize) -> String {
    let mut chosen: Vec<String> = Vec::new();
    let mut used = 0usize;

    for section in PARAGRAPH_BREAK.split(text) {
        let chunk = section.trim();
        if chunk.is_empty() || !CONTRACT_KEYWORD.is_match(chunk) {
            continue;
        }
        let chunk: String = chunk.chars().take(MAX_KEYWORD_SECTION_CHARS).collect();
        let len = chunk.chars().count();
        if used + len + 2 > budget {
            break;
        }
        used += len + 2;
        chosen.push(chunk);
    }

    if !chosen.is_empty() {
        return chosen.join("\n\n");
    }

    let total = text.chars().count();
    let start = (total / 2).saturating_sub(budget / 2);
    text.chars().skip(start).take(budget).collect()
}

/// Render lines of text as a single-page Helvetica PDF, one text line per
/// entry.
pub fn minimal_pdf(lines: &[&str]) -> Result<Vec<u8>, DocumentError> {
    let mut operations = vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), 11.into()]),
        Operation::new("Td", vec![72.into(), 740.into()]),
    ];
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            operations.push(Operation::new("Td", vec![0.into(), (-14).into()]));
        }
        operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
    }
    operations.push(Operation::new("ET", vec![]));
    let content = Content { operations }.encode().map_err(render_error)?;

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let content_id = doc.add_object(Stream::new(dictionary! {}, content));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        "Contents" => content_id,
        "Resources" => dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        },
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).map_err(render_error)?;
    Ok(buf)
}

fn render_error(e: impl std::fmt::Display) -> DocumentError {
    DocumentError::Render(e.to_string())
}
