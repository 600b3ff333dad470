// src/source/collector.rs

// --- Imports ---
use crate::source::client::SiteClient;
use crate::source::models::{CompanyIdentity, RawDocumentEntry, Section};
use crate::utils::error::FetchError;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use std::collections::{BTreeSet, HashSet};
use url::Url;

// --- CSS Selectors (Lazy Static) ---
// One row per concall: a date caption followed by Transcript / PPT / REC links.
static CONCALL_ROW_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("div.concalls ul.list-links > li")
        .expect("Failed to compile CONCALL_ROW_SELECTOR")
});

static ROW_DATE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div").expect("Failed to compile ROW_DATE_SELECTOR"));

static LINK_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("Failed to compile LINK_SELECTOR"));

static ANNUAL_REPORT_LINK_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("div.annual-reports ul.list-links li > a[href]")
        .expect("Failed to compile ANNUAL_REPORT_LINK_SELECTOR")
});

static ARCHIVE_NEXT_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("div.annual-reports a[rel~='next'][href]")
        .expect("Failed to compile ARCHIVE_NEXT_SELECTOR")
});

// --- Data Structures ---

/// Where an archive crawl stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionGap {
    /// 1-based archive page that could not be fetched.
    pub page: usize,
    pub url: String,
    pub error: String,
}

/// Everything found for one company, in site order.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub entries: Vec<RawDocumentEntry>,
    /// Set when later archive pages failed after earlier ones succeeded.
    pub gap: Option<CollectionGap>,
    pub pages_fetched: usize,
}

impl Collection {
    pub fn is_partial(&self) -> bool {
        self.gap.is_some()
    }
}

/// Crawls a company's listing sections into [`RawDocumentEntry`] values.
///
/// Holds no per-company state, so calling `collect` again simply starts over.
#[derive(Debug, Clone)]
pub struct DocumentCollector {
    max_archive_pages: usize,
}

impl DocumentCollector {
    pub fn new(max_archive_pages: usize) -> Self {
        Self {
            max_archive_pages: max_archive_pages.max(1),
        }
    }

    /// Fails only if the profile page itself cannot be fetched. Archive pages
    /// failing later truncate the result and are reported through `gap`.
    pub async fn collect(
        &self,
        client: &SiteClient,
        company: &CompanyIdentity,
        sections: &BTreeSet<Section>,
    ) -> Result<Collection, FetchError> {
        let mut collection = Collection::default();
        if sections.is_empty() {
            return Ok(collection);
        }

        let profile_url = client.url(&company.profile_url)?;
        let html = client.get_text_with_retry(profile_url.as_str()).await?;
        collection.pages_fetched = 1;

        let mut builder = EntryBuilder::default();
        let mut next_page = None;
        {
            // Html is not Send; keep it out of scope across awaits.
            let document = Html::parse_document(&html);
            if sections.contains(&Section::Concall) {
                parse_concalls(&document, &profile_url, &mut builder);
            }
            if sections.contains(&Section::AnnualReport) {
                parse_annual_reports(&document, &profile_url, &mut builder);
                next_page = next_archive_url(&document, &profile_url);
            }
        }
        tracing::debug!(
            "{}: {} entries on profile page",
            company.symbol,
            builder.entries.len()
        );

        // Archive pagination, page 1 being the profile page.
        let mut visited: HashSet<String> = HashSet::from([profile_url.to_string()]);
        let mut page = 1;
        while let Some(url) = next_page.take() {
            page += 1;
            if page > self.max_archive_pages {
                tracing::info!(
                    "{}: archive page ceiling ({}) reached",
                    company.symbol,
                    self.max_archive_pages
                );
                break;
            }
            if !visited.insert(url.to_string()) {
                tracing::warn!("{}: archive links loop back to {}", company.symbol, url);
                break;
            }

            let html = match client.get_text_with_retry(url.as_str()).await {
                Ok(html) => html,
                Err(e) => {
                    tracing::warn!(
                        "{}: archive page {} failed ({}), keeping {} entries",
                        company.symbol,
                        page,
                        e,
                        builder.entries.len()
                    );
                    collection.gap = Some(CollectionGap {
                        page,
                        url: url.to_string(),
                        error: e.to_string(),
                    });
                    break;
                }
            };
            collection.pages_fetched += 1;

            let (found, next) = {
                let document = Html::parse_document(&html);
                (
                    parse_annual_reports(&document, &url, &mut builder),
                    next_archive_url(&document, &url),
                )
            };
            if found == 0 {
                tracing::debug!("{}: archive page {} is empty, stopping", company.symbol, page);
                break;
            }
            next_page = next;
        }

        collection.entries = builder.entries;
        tracing::info!(
            "{}: collected {} documents from {} page(s){}",
            company.symbol,
            collection.entries.len(),
            collection.pages_fetched,
            if collection.is_partial() { " (partial)" } else { "" }
        );
        Ok(collection)
    }
}

/// Assigns `source_index` and drops repeated URLs.
#[derive(Default)]
struct EntryBuilder {
    entries: Vec<RawDocumentEntry>,
    seen_urls: HashSet<String>,
}

impl EntryBuilder {
    fn push(&mut self, title: String, url: Url, section: Section, raw_date_text: String) -> bool {
        let source_url = url.to_string();
        if !self.seen_urls.insert(source_url.clone()) {
            tracing::trace!("Skipping duplicate document link {}", source_url);
            return false;
        }
        let source_index = self.entries.len();
        self.entries.push(RawDocumentEntry {
            title,
            source_url,
            section,
            raw_date_text,
            source_index,
        });
        true
    }
}

fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn resolve_href(element: ElementRef, page_url: &Url) -> Option<Url> {
    let href = element.value().attr("href")?.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    page_url.join(href).ok()
}

fn parse_concalls(document: &Html, page_url: &Url, builder: &mut EntryBuilder) -> usize {
    let mut added = 0;
    for row in document.select(&CONCALL_ROW_SELECTOR) {
        let date_text = row
            .select(&ROW_DATE_SELECTOR)
            .next()
            .map(|d| clean_text(&d.text().collect::<String>()))
            .unwrap_or_default();

        for link in row.select(&LINK_SELECTOR) {
            let Some(url) = resolve_href(link, page_url) else {
                continue;
            };
            let label = clean_text(&link.text().collect::<String>());
            let title = match (date_text.is_empty(), label.is_empty()) {
                (false, false) => format!("{} - {}", date_text, label),
                (false, true) => date_text.clone(),
                _ => label,
            };
            if builder.push(title, url, Section::Concall, date_text.clone()) {
                added += 1;
            }
        }
    }
    added
}

/// Returns how many entries the page contributed, duplicates included.
fn parse_annual_reports(document: &Html, page_url: &Url, builder: &mut EntryBuilder) -> usize {
    let mut found = 0;
    for link in document.select(&ANNUAL_REPORT_LINK_SELECTOR) {
        let Some(url) = resolve_href(link, page_url) else {
            continue;
        };
        found += 1;

        // "Financial Year 2024" followed by a nested "from bse" caption.
        let mut texts = link
            .text()
            .map(clean_text)
            .filter(|t| !t.is_empty());
        let title = texts.next().unwrap_or_default();
        let caption = texts.collect::<Vec<_>>().join(" ");
        builder.push(title, url, Section::AnnualReport, caption);
    }
    found
}

fn next_archive_url(document: &Html, page_url: &Url) -> Option<Url> {
    document
        .select(&ARCHIVE_NEXT_SELECTOR)
        .next()
        .and_then(|a| resolve_href(a, page_url))
}
