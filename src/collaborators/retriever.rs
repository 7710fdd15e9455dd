use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use super::PolicyRetriever;
use crate::contract::{ExtractedFields, PolicyChunk};
use crate::error::IntakeError;
use crate::state_machine::StageError;

/// Policy text used when no policy directory is configured.
pub const DEFAULT_POLICY: &str = "\
# Vendor contract policy

Contracts with a total value above $500,000 require CFO approval and legal review before signature.

Every vendor contract must state the vendor name, the effective date, the expiration date and the total contract value.

Payment terms shorter than Net 30 require finance approval.

Contracts that renew automatically must give at least 60 days notice of renewal.

The governing law of the contract should be a jurisdiction where the company operates.";

// Always part of the query; they match the clauses any contract touches.
const BASE_TERMS: &[&str] = &["contract", "vendor", "value", "approval", "total"];

/// Ranks paragraph-sized policy chunks by weighted term overlap with a
/// query built from the extracted fields.
#[derive(Debug, Clone)]
pub struct KeywordPolicyRetriever {
    chunks: Vec<PolicyChunk>,
    k: usize,
}

impl KeywordPolicyRetriever {
    /// Split each `(source, text)` document on blank lines into chunks.
    pub fn from_documents<'a>(documents: impl IntoIterator<Item = (&'a str, &'a str)>, k: usize) -> Self {
        let chunks = documents
            .into_iter()
            .flat_map(|(source, text)| {
                text.split("\n\n")
                    .map(str::trim)
                    .filter(|p| !p.is_empty() && !p.starts_with('#'))
                    .map(move |p| PolicyChunk {
                        source: source.to_string(),
                        content: p.to_string(),
                        score: 0.0,
                    })
            })
            .collect();
        Self { chunks, k: k.max(1) }
    }

    /// Load every `.md` and `.txt` file in `dir`, in file-name order.
    ///
    /// A missing or empty directory falls back to [`DEFAULT_POLICY`].
    pub fn from_dir(dir: &Path, k: usize) -> Result<Self, IntakeError> {
        if !dir.is_dir() {
            info!(path = %dir.display(), "policy directory not found, using built-in policy");
            return Ok(Self::builtin(k));
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("txt"))
            })
            .collect();
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in &paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            documents.push((name, std::fs::read_to_string(path)?));
        }

        let retriever = Self::from_documents(documents.iter().map(|(n, t)| (n.as_str(), t.as_str())), k);
        if retriever.chunks.is_empty() {
            info!(path = %dir.display(), "policy directory is empty, using built-in policy");
            return Ok(Self::builtin(k));
        }
        info!(files = paths.len(), chunks = retriever.chunks.len(), "policy corpus loaded");
        Ok(retriever)
    }

    pub fn builtin(k: usize) -> Self {
        Self::from_documents([("default-policy.md", DEFAULT_POLICY)], k)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn query_terms(fields: &ExtractedFields) -> Vec<(String, f64)> {
        let mut terms: Vec<(String, f64)> = BASE_TERMS.iter().map(|t| (t.to_string(), 1.0)).collect();

        let mut field_terms = BTreeSet::new();
        if let Some(vendor) = &fields.vendor_name {
            field_terms.extend(tokenize(vendor));
        }
        if let Some(law) = &fields.governing_law {
            field_terms.extend(tokenize(law));
        }
        if fields.total_value.is_some() {
            field_terms.extend(["cfo".to_string(), "legal".to_string()]);
        }
        if fields.payment_terms_days.is_some() {
            field_terms.extend(["payment".to_string(), "terms".to_string(), "net".to_string()]);
        }
        if fields.auto_renewal == Some(true) {
            field_terms.extend(["renew".to_string(), "renewal".to_string(), "notice".to_string()]);
        }
        if !fields.all_critical_present() {
            field_terms.extend(["must".to_string(), "state".to_string(), "date".to_string()]);
        }

        terms.extend(field_terms.into_iter().map(|t| (t, 2.0)));
        terms
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl PolicyRetriever for KeywordPolicyRetriever {
    async fn retrieve(&self, fields: &ExtractedFields) -> Result<Vec<PolicyChunk>, StageError> {
        let terms = Self::query_terms(fields);

        let mut scored: Vec<PolicyChunk> = self
            .chunks
            .iter()
            .map(|chunk| {
                let words = tokenize(&chunk.content);
                let score: f64 = terms
                    .iter()
                    .filter(|(term, _)| words.contains(term))
                    .map(|(_, weight)| weight)
                    .sum();
                PolicyChunk {
                    score,
                    ..chunk.clone()
                }
            })
            .collect();

        // Stable sort keeps corpus order among equal scores.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(self.k);

        debug!(
            chunks = scored.len(),
            top_score = scored.first().map(|c| c.score).unwrap_or(0.0),
            "policy chunks retrieved"
        );
        Ok(scored)
    }
}
