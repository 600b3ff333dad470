// src/extractors/classifier.rs
//! Document type and reporting period from free-form listing titles.
//!
//! Both decisions are table driven: [`TYPE_RULES`] is scanned top to bottom
//! for the type, and [`PERIOD_PATTERNS`] is tried in order, first against the
//! title and then against the listing's date caption. The first hit wins in
//! both cases, which keeps the output deterministic for a given entry.

// --- Imports ---
use crate::source::models::{RawDocumentEntry, Section};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

// --- Types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Transcript,
    Presentation,
    AnnualReport,
    Unclassified,
}

impl DocumentType {
    pub const ALL: [DocumentType; 4] = [
        DocumentType::Transcript,
        DocumentType::Presentation,
        DocumentType::AnnualReport,
        DocumentType::Unclassified,
    ];

    /// Token used in filenames and outcome codes.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Transcript => "transcript",
            DocumentType::Presentation => "presentation",
            DocumentType::AnnualReport => "annual_report",
            DocumentType::Unclassified => "unclassified",
        }
    }

    /// Listing section documents of this type are collected from.
    pub fn section(&self) -> Section {
        match self {
            DocumentType::AnnualReport => Section::AnnualReport,
            _ => Section::Concall,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "transcript" | "transcripts" => Ok(DocumentType::Transcript),
            "presentation" | "presentations" | "ppt" => Ok(DocumentType::Presentation),
            "annual_report" | "annual_reports" | "ar" => Ok(DocumentType::AnnualReport),
            "unclassified" | "other" => Ok(DocumentType::Unclassified),
            other => Err(format!(
                "unknown document type '{}' (expected transcript, presentation, annual-report or unclassified)",
                other
            )),
        }
    }
}

/// Canonical reporting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedPeriod {
    Quarter { fiscal_year: i32, quarter: u8 },
    Month { year: i32, month: u8 },
    FiscalYearOnly { fiscal_year: i32 },
}

const MONTH_ABBREVS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

impl NormalizedPeriod {
    pub fn year(&self) -> i32 {
        match *self {
            NormalizedPeriod::Quarter { fiscal_year, .. } => fiscal_year,
            NormalizedPeriod::Month { year, .. } => year,
            NormalizedPeriod::FiscalYearOnly { fiscal_year } => fiscal_year,
        }
    }

    fn sort_key(&self) -> (i32, u8, u8) {
        match *self {
            NormalizedPeriod::Quarter { fiscal_year, quarter } => (fiscal_year, quarter, 1),
            NormalizedPeriod::Month { year, month } => (year, month, 2),
            NormalizedPeriod::FiscalYearOnly { fiscal_year } => (fiscal_year, 0, 0),
        }
    }

    /// `FY2024`, `Jun-2025` or `Q1-FY2024`.
    pub fn label(&self) -> String {
        match *self {
            NormalizedPeriod::Quarter { fiscal_year, quarter } => {
                format!("Q{}-FY{}", quarter, fiscal_year)
            }
            NormalizedPeriod::Month { year, month } => {
                let abbrev = MONTH_ABBREVS
                    .get(usize::from(month).saturating_sub(1))
                    .copied()
                    .unwrap_or("Unk");
                format!("{}-{}", abbrev, year)
            }
            NormalizedPeriod::FiscalYearOnly { fiscal_year } => format!("FY{}", fiscal_year),
        }
    }
}

/// Year first, then quarter or month; sort descending for most recent first.
impl Ord for NormalizedPeriod {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for NormalizedPeriod {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedDocument {
    pub company: String,
    pub title: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub period: Option<NormalizedPeriod>,
    pub raw_date_text: String,
    pub source_url: String,
    pub section: Section,
    pub source_index: usize,
}

// --- Type rules ---

#[derive(Debug, Clone, Copy)]
pub struct TypeRule {
    /// Lowercase substring looked for in the lowercased title.
    pub keyword: &'static str,
    pub doc_type: DocumentType,
}

pub const TYPE_RULES: &[TypeRule] = &[
    TypeRule { keyword: "transcript", doc_type: DocumentType::Transcript },
    TypeRule { keyword: "presentation", doc_type: DocumentType::Presentation },
    TypeRule { keyword: "ppt", doc_type: DocumentType::Presentation },
    TypeRule { keyword: "investor deck", doc_type: DocumentType::Presentation },
    TypeRule { keyword: "annual report", doc_type: DocumentType::AnnualReport },
    TypeRule { keyword: "financial year", doc_type: DocumentType::AnnualReport },
];

/// First rule in `rules` whose keyword occurs in `title`.
pub fn match_type_rule(rules: &[TypeRule], title: &str) -> Option<DocumentType> {
    let title = title.to_lowercase();
    rules
        .iter()
        .find(|rule| title.contains(rule.keyword))
        .map(|rule| rule.doc_type)
}

/// Annual-report listings are always annual reports; concall links go
/// through the keyword table.
pub fn infer_type(title: &str, section: Section) -> DocumentType {
    match section {
        Section::AnnualReport => DocumentType::AnnualReport,
        Section::Concall => match_type_rule(TYPE_RULES, title).unwrap_or(DocumentType::Unclassified),
    }
}

// --- Period patterns (Lazy Static) ---

// "FY24", "FY 2023-24", "Financial Year 2024"
static FISCAL_YEAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:FY|F\.Y\.|financial\s+year)\s*[-']?\s*(\d{4}|\d{2})\b(?:\s*[-–/]\s*(\d{4}|\d{2})\b)?")
        .expect("Failed to compile FISCAL_YEAR_RE")
});

// "Jun 2025", "September, 2024", "Mar-24", "June 15, 2024"
static MONTH_YEAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec)\.?(?:\s+\d{1,2}(?:st|nd|rd|th)?\b)?[\s,'\-]*(\d{4}|\d{2})\b",
    )
    .expect("Failed to compile MONTH_YEAR_RE")
});

// "Q1 FY24", "Q3FY2024", "Q2 2023", "Q4 FY2023-24", "FY24 Q1"
static QUARTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bQ([1-4])\s*[-']?\s*(?:FY\s*[-']?\s*)?(\d{4}|\d{2})\b(?:\s*[-–/]\s*(\d{4}|\d{2})\b)?")
        .expect("Failed to compile QUARTER_RE")
});

static QUARTER_AFTER_YEAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bFY\s*[-']?\s*(\d{4}|\d{2})\s*[-,]?\s*Q([1-4])\b")
        .expect("Failed to compile QUARTER_AFTER_YEAR_RE")
});

// An FY marker sitting right next to a quarter marker belongs to the quarter.
static QUARTER_BEFORE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bQ[1-4]\s*[-']?\s*$").expect("Failed to compile QUARTER_BEFORE_RE"));
static QUARTER_AFTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*[-,]?\s*Q[1-4]\b").expect("Failed to compile QUARTER_AFTER_RE"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodPattern {
    FiscalYear,
    MonthYear,
    Quarter,
}

/// Precedence order; the first pattern that matches decides.
pub const PERIOD_PATTERNS: [PeriodPattern; 3] = [
    PeriodPattern::FiscalYear,
    PeriodPattern::MonthYear,
    PeriodPattern::Quarter,
];

impl PeriodPattern {
    pub fn parse(&self, text: &str) -> Option<NormalizedPeriod> {
        match self {
            PeriodPattern::FiscalYear => parse_fiscal_year(text),
            PeriodPattern::MonthYear => parse_month_year(text),
            PeriodPattern::Quarter => parse_quarter(text),
        }
    }
}

/// Two-digit years are taken as 20xx.
fn normalize_year(digits: &str) -> Option<i32> {
    let value: i32 = digits.parse().ok()?;
    let year = if digits.len() == 2 { 2000 + value } else { value };
    (1900..=2099).contains(&year).then_some(year)
}

/// "2023-24" names the fiscal year ending in 2024.
fn fiscal_year_of(caps: &Captures, start: usize, end: usize) -> Option<i32> {
    let first = normalize_year(caps.get(start)?.as_str())?;
    match caps.get(end).and_then(|m| normalize_year(m.as_str())) {
        Some(second) if second == first + 1 => Some(second),
        _ => Some(first),
    }
}

fn parse_fiscal_year(text: &str) -> Option<NormalizedPeriod> {
    FISCAL_YEAR_RE.captures_iter(text).find_map(|caps| {
        let whole = caps.get(0)?;
        if QUARTER_BEFORE_RE.is_match(&text[..whole.start()])
            || QUARTER_AFTER_RE.is_match(&text[whole.end()..])
        {
            return None;
        }
        fiscal_year_of(&caps, 1, 2).map(|fiscal_year| NormalizedPeriod::FiscalYearOnly { fiscal_year })
    })
}

fn parse_month_year(text: &str) -> Option<NormalizedPeriod> {
    MONTH_YEAR_RE.captures_iter(text).find_map(|caps| {
        let name = caps.get(1)?.as_str().to_lowercase();
        let month = MONTH_ABBREVS
            .iter()
            .position(|abbrev| name.starts_with(&abbrev.to_lowercase()))?;
        let year = normalize_year(caps.get(2)?.as_str())?;
        Some(NormalizedPeriod::Month {
            year,
            month: month as u8 + 1,
        })
    })
}

fn parse_quarter(text: &str) -> Option<NormalizedPeriod> {
    if let Some(caps) = QUARTER_RE.captures(text) {
        let quarter: u8 = caps.get(1)?.as_str().parse().ok()?;
        if let Some(fiscal_year) = fiscal_year_of(&caps, 2, 3) {
            return Some(NormalizedPeriod::Quarter { fiscal_year, quarter });
        }
    }
    let caps = QUARTER_AFTER_YEAR_RE.captures(text)?;
    let fiscal_year = normalize_year(caps.get(1)?.as_str())?;
    let quarter: u8 = caps.get(2)?.as_str().parse().ok()?;
    Some(NormalizedPeriod::Quarter { fiscal_year, quarter })
}

/// Tries every pattern on each text in turn; `None` when nothing matches.
pub fn infer_period(texts: &[&str]) -> Option<NormalizedPeriod> {
    texts.iter().find_map(|text| {
        PERIOD_PATTERNS
            .iter()
            .find_map(|pattern| pattern.parse(text))
    })
}

/// Classifies a listing entry. Never fails: unrecognised titles come back as
/// `Unclassified` with no period.
pub fn classify(company: &str, entry: &RawDocumentEntry) -> ClassifiedDocument {
    let doc_type = infer_type(&entry.title, entry.section);
    let period = infer_period(&[entry.title.as_str(), entry.raw_date_text.as_str()]);

    if period.is_none() {
        tracing::debug!("No period found in '{}' / '{}'", entry.title, entry.raw_date_text);
    }

    ClassifiedDocument {
        company: company.to_string(),
        title: entry.title.clone(),
        doc_type,
        period,
        raw_date_text: entry.raw_date_text.clone(),
        source_url: entry.source_url.clone(),
        section: entry.section,
        source_index: entry.source_index,
    }
}
