//! Registry feed adapter: paginated study fetch, version fetch and study normalization.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use trialsync_core::FeedVersion;
use trialsync_storage::{HttpFetcher, TransportError};
use url::Url;
use uuid::Uuid;

mod normalize;

pub use normalize::{
    normalize_batch, InterventionLinkage, KeyStrategy, NormalizerOptions, OrganizationRegistry,
    StudyNormalizer,
};

pub const CRATE_NAME: &str = "trialsync-adapters";

/// Query parameter carrying the upstream cursor.
pub const PAGE_TOKEN_PARAM: &str = "pageToken";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("study record has no protocolSection.identificationModule.nctId")]
    MissingStudyId,
    #[error("invalid feed url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Anything that can answer a GET with a JSON document.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<JsonValue, TransportError>;
}

/// `PageSource` over the shared HTTP client, tagged with the current run.
pub struct HttpPageSource<'a> {
    http: &'a HttpFetcher,
    run_id: Uuid,
}

impl<'a> HttpPageSource<'a> {
    pub fn new(http: &'a HttpFetcher, run_id: Uuid) -> Self {
        Self { http, run_id }
    }
}

#[async_trait]
impl PageSource for HttpPageSource<'_> {
    async fn fetch_page(&self, url: &str) -> Result<JsonValue, TransportError> {
        self.http.get_json(self.run_id, url).await
    }
}

/// Result of one page walk. `truncated` holds the error that cut the walk short, if any.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub studies: Vec<JsonValue>,
    pub pages: usize,
    pub duplicates_dropped: usize,
    pub unidentified_dropped: usize,
    pub truncated: Option<TransportError>,
}

impl FetchOutcome {
    pub fn is_truncated(&self) -> bool {
        self.truncated.is_some()
    }
}

/// Walks `studies` pages following `nextPageToken`, deduplicating by study id.
pub struct PaginatedFetcher<'a, S: PageSource + ?Sized> {
    source: &'a S,
    base_url: String,
}

impl<'a, S: PageSource + ?Sized> PaginatedFetcher<'a, S> {
    pub fn new(source: &'a S, base_url: impl Into<String>) -> Self {
        Self {
            source,
            base_url: base_url.into(),
        }
    }

    /// Transport failures end the walk and are reported on the outcome, not returned.
    pub async fn fetch_all(&self) -> Result<FetchOutcome, AdapterError> {
        let mut outcome = FetchOutcome::default();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut seen_tokens: HashSet<String> = HashSet::new();
        let mut next_url = Some(self.base_url.clone());

        while let Some(url) = next_url.take() {
            let page = match self.source.fetch_page(&url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        url = %url,
                        pages = outcome.pages,
                        studies = outcome.studies.len(),
                        error = %err,
                        "page walk truncated; keeping partial batch"
                    );
                    outcome.truncated = Some(err);
                    break;
                }
            };
            outcome.pages += 1;

            let records = page
                .get("studies")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default();
            let fetched = records.len();
            for record in records {
                let Some(id) = study_id(&record).map(ToString::to_string) else {
                    outcome.unidentified_dropped += 1;
                    continue;
                };
                if seen_ids.insert(id) {
                    outcome.studies.push(record);
                } else {
                    outcome.duplicates_dropped += 1;
                }
            }
            info!(page = outcome.pages, fetched, total = outcome.studies.len(), "fetched studies page");

            if let Some(token) = page
                .get("nextPageToken")
                .and_then(JsonValue::as_str)
                .filter(|t| !t.is_empty())
            {
                if !seen_tokens.insert(token.to_string()) {
                    warn!(token, "feed repeated a page token; stopping walk");
                    break;
                }
                next_url = Some(next_page_url(&self.base_url, token)?);
            }
        }

        Ok(outcome)
    }
}

/// Base URL with `pageToken` set to `token`; other query parameters are kept.
pub fn next_page_url(base_url: &str, token: &str) -> Result<String, AdapterError> {
    let mut url = Url::parse(base_url).map_err(|source| AdapterError::InvalidUrl {
        url: base_url.to_string(),
        source,
    })?;
    let retained = url
        .query_pairs()
        .filter(|(key, _)| key != PAGE_TOKEN_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair(PAGE_TOKEN_PARAM, token);
    Ok(url.to_string())
}

/// Single-object version document; no pagination.
pub async fn fetch_version<S: PageSource + ?Sized>(
    source: &S,
    url: &str,
) -> Result<FeedVersion, AdapterError> {
    let value = source.fetch_page(url).await?;
    if !value.is_object() {
        return Err(AdapterError::Message(format!(
            "version document from {url} is not a JSON object"
        )));
    }
    Ok(FeedVersion::from_json(&value))
}

/// Natural registry identifier of a raw study record.
pub fn study_id(record: &JsonValue) -> Option<&str> {
    json_at(record, &["protocolSection", "identificationModule", "nctId"])
        .and_then(JsonValue::as_str)
        .filter(|id| !id.is_empty())
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// Load a saved feed document from disk, e.g. a captured page.
pub fn load_json_file(path: impl AsRef<Path>) -> anyhow::Result<JsonValue> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
