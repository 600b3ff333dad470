// src/extractors/naming.rs
//! Deterministic artifact filenames: `{SYMBOL}_{period}_{type}.pdf`.

use crate::extractors::classifier::{ClassifiedDocument, DocumentType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const ARTIFACT_EXTENSION: &str = "pdf";
pub const UNKNOWN_PERIOD: &str = "unknown-date";

/// A classified document plus the filename it will be stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedArtifact {
    pub filename: String,
    pub classified: ClassifiedDocument,
}

/// Components recovered from a generated filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub company: String,
    pub period: String,
    pub doc_type: DocumentType,
    /// Present only on names that were disambiguated by source index.
    pub sequence: Option<usize>,
}

/// Keeps path separators and characters Windows rejects out of the symbol.
/// `_` is reserved as the field separator.
pub fn sanitize_symbol(symbol: &str) -> String {
    let cleaned: String = symbol
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '_' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_whitespace() || c.is_control() => '-',
            c => c,
        })
        .collect();
    // Stored names never start with a dot.
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "UNKNOWN".to_string()
    } else {
        cleaned.to_uppercase()
    }
}

fn base_stem(symbol: &str, doc: &ClassifiedDocument) -> String {
    let period = doc
        .period
        .as_ref()
        .map(|p| p.label())
        .unwrap_or_else(|| UNKNOWN_PERIOD.to_string());
    format!("{}_{}_{}", sanitize_symbol(symbol), period, doc.doc_type.as_str())
}

/// Filename for `doc`, unique against `taken`.
///
/// On a collision the entry's source index is appended. Base names never end
/// in `_<digits>` and source indexes are distinct within a company, so one
/// suffix is always enough.
pub fn name(symbol: &str, doc: &ClassifiedDocument, taken: &HashSet<String>) -> String {
    let stem = base_stem(symbol, doc);
    let candidate = format!("{}.{}", stem, ARTIFACT_EXTENSION);
    if !taken.contains(&candidate) {
        return candidate;
    }
    let suffixed = format!("{}_{}.{}", stem, doc.source_index, ARTIFACT_EXTENSION);
    tracing::debug!("Name {} already taken, using {}", candidate, suffixed);
    suffixed
}

/// Names documents in order, each against every name handed out before it.
#[derive(Debug, Default)]
pub struct NameRegistry {
    taken: HashSet<String>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, symbol: &str, classified: ClassifiedDocument) -> NamedArtifact {
        let filename = name(symbol, &classified, &self.taken);
        self.taken.insert(filename.clone());
        NamedArtifact { filename, classified }
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.taken.contains(filename)
    }
}

/// Inverse of [`name`] for listing; `None` for files this crate did not name.
pub fn parse_filename(filename: &str) -> Option<ParsedName> {
    let stem = filename.strip_suffix(&format!(".{}", ARTIFACT_EXTENSION))?;
    let mut parts = stem.splitn(3, '_');
    let company = parts.next().filter(|s| !s.is_empty())?;
    let period = parts.next().filter(|s| !s.is_empty())?;
    let rest = parts.next()?;

    let (type_part, sequence) = match rest.rsplit_once('_') {
        Some((head, tail)) if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) => {
            (head, tail.parse().ok())
        }
        _ => (rest, None),
    };

    let doc_type = DocumentType::ALL
        .iter()
        .copied()
        .find(|t| t.as_str() == type_part)?;

    Some(ParsedName {
        company: company.to_string(),
        period: period.to_string(),
        doc_type,
        sequence,
    })
}
