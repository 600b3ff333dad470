// src/source/resolver.rs
use crate::source::client::SiteClient;
use crate::source::models::{CompanyIdentity, SearchHit};
use crate::utils::error::{FetchError, ResolveError};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::Mutex;

static COMPANY_NAME_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h1").expect("Failed to compile COMPANY_NAME_SELECTOR"));

// Queries shaped like a ticker get a direct profile probe before any search.
static TICKER_LIKE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9&_.\-]{1,20}$").expect("Failed to compile TICKER_LIKE_RE"));

/// Maps a symbol or free-text query to a [`CompanyIdentity`].
///
/// An exact profile match always wins. Otherwise the search endpoint is asked
/// and a hit with the same symbol is preferred, falling back to the first hit.
#[derive(Debug, Default)]
pub struct CompanyResolver {
    cache: Mutex<HashMap<String, CompanyIdentity>>,
}

impl CompanyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(
        &self,
        client: &SiteClient,
        query: &str,
    ) -> Result<CompanyIdentity, ResolveError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ResolveError::NotFound(String::new()));
        }
        let key = query.to_uppercase();

        if let Some(hit) = self.cached(&key) {
            tracing::debug!("Resolver cache hit for {}", key);
            return Ok(hit);
        }

        let identity = match self.probe_profile(client, &key).await? {
            Some(identity) => identity,
            None => self.search(client, query, &key).await?,
        };

        tracing::info!(
            "Resolved '{}' to {} ({})",
            query,
            identity.symbol,
            identity.canonical_name
        );
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, identity.clone());
        Ok(identity)
    }

    fn cached(&self, key: &str) -> Option<CompanyIdentity> {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    /// `Ok(None)` means "no exact profile, go search".
    async fn probe_profile(
        &self,
        client: &SiteClient,
        symbol: &str,
    ) -> Result<Option<CompanyIdentity>, ResolveError> {
        if !TICKER_LIKE_RE.is_match(symbol) {
            return Ok(None);
        }

        let profile_url = client.url(&format!("/company/{}/", symbol))?.to_string();
        match client.get_text_with_retry(&profile_url).await {
            Ok(html) => {
                let canonical_name = company_name(&html).unwrap_or_else(|| symbol.to_string());
                Ok(Some(CompanyIdentity {
                    symbol: symbol.to_string(),
                    canonical_name,
                    profile_url,
                }))
            }
            Err(FetchError::Client(status)) => {
                tracing::debug!("No profile at {} ({}), falling back to search", profile_url, status);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn search(
        &self,
        client: &SiteClient,
        query: &str,
        key: &str,
    ) -> Result<CompanyIdentity, ResolveError> {
        let mut search_url = client.url("/api/company/search/")?;
        search_url.query_pairs_mut().append_pair("q", query);

        let hits: Vec<SearchHit> = client
            .get_json(search_url.as_str())
            .await
            .map_err(|e| match e {
                FetchError::Network(inner) if inner.is_decode() => ResolveError::Parse(inner.to_string()),
                other => other.into(),
            })?;

        let candidates: Vec<(String, &SearchHit)> = hits
            .iter()
            .filter_map(|hit| hit.symbol().map(|symbol| (symbol, hit)))
            .collect();

        let (symbol, hit) = candidates
            .iter()
            .find(|(symbol, _)| symbol == key)
            .or_else(|| candidates.first())
            .ok_or_else(|| ResolveError::NotFound(query.to_string()))?;

        if symbol != key {
            tracing::warn!(
                "No exact match for '{}', accepting top search hit {} ({})",
                query,
                symbol,
                hit.name
            );
        }

        let path = hit.url.as_deref().unwrap_or_default();
        let profile_url = client.url(path)?.to_string();
        Ok(CompanyIdentity {
            symbol: symbol.clone(),
            canonical_name: hit.name.trim().to_string(),
            profile_url,
        })
    }
}

/// First `<h1>` text of a profile page.
pub fn company_name(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let name = document
        .select(&COMPANY_NAME_SELECTOR)
        .next()?
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
