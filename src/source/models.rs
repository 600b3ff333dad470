// src/source/models.rs
use serde::{Deserialize, Serialize};

/// Canonical identity of a listed company on the source site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyIdentity {
    pub symbol: String,
    pub canonical_name: String,
    pub profile_url: String,
}

/// Listing section a document was discovered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Concall,
    AnnualReport,
}

/// One document link as it appears on a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDocumentEntry {
    pub title: String,
    pub source_url: String,
    pub section: Section,
    pub raw_date_text: String,
    /// Position across the whole collection, newest-first as listed by the site.
    pub source_index: usize,
}

/// A single hit from `/api/company/search/`.
/// Example: `{"id": 1285, "name": "Reliance Industries Ltd", "url": "/company/RELIANCE/consolidated/"}`
#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl SearchHit {
    /// Symbol segment of a `/company/{SYMBOL}/...` url.
    pub fn symbol(&self) -> Option<String> {
        self.url.as_deref().and_then(symbol_from_company_path)
    }
}

/// Extracts `SYMBOL` from anything containing `/company/SYMBOL/`.
pub fn symbol_from_company_path(path: &str) -> Option<String> {
    let rest = path.split("/company/").nth(1)?;
    let symbol = rest.split('/').next()?.trim();
    if symbol.is_empty() {
        None
    } else {
        Some(symbol.to_uppercase())
    }
}
