//! Wikidata search client
//!
//! Two-step lookup: `wbsearchentities` for ranked candidate ids, then
//! `wbgetentities` to hydrate label/description/aliases/claims snapshots.
//! One shared instance carries the global `governor` token bucket because
//! the upstream quota is per-credential, not per-process.

use crate::config::SearchConfig;
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Search client errors, split by retry classification
#[derive(Debug, Error)]
pub enum SearchError {
    /// Request exceeded the configured timeout (transient)
    #[error("search request timed out")]
    Timeout,

    /// Connection-level failure (transient)
    #[error("search network error: {0}")]
    Network(String),

    /// No rate-limit slot within the acquire timeout (transient)
    #[error("timed out waiting for a rate-limit slot")]
    RateLimitWait,

    /// Upstream returned an error status
    #[error("search API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Body did not match the expected shape (permanent)
    #[error("malformed search response: {0}")]
    Decode(String),
}

impl SearchError {
    /// Permanent errors mark the task failed instead of retrying
    pub fn is_permanent(&self) -> bool {
        match self {
            SearchError::Api { status, .. } => {
                *status >= 400 && *status < 500 && *status != 429
            }
            SearchError::Decode(_) => true,
            SearchError::Timeout | SearchError::Network(_) | SearchError::RateLimitWait => false,
        }
    }
}

/// Hydrated view of a knowledge-base entity, reduced to what scoring needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySnapshot {
    /// External entity id, e.g. `Q231480`
    pub id: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub aliases: Vec<String>,
    /// Property id → first mainsnak value rendered to a comparable string
    pub claims: BTreeMap<String, String>,
}

/// Seam between the pipeline and the knowledge base; tests substitute a
/// scripted implementation.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<EntitySnapshot>, SearchError>;
}

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Wikidata Action API client with global rate limiting
pub struct WikidataClient {
    client: reqwest::Client,
    rate_limiter: DirectRateLimiter,
    endpoint: String,
    language: String,
    limit: u32,
    rate_acquire_timeout: Duration,
}

impl WikidataClient {
    pub fn new(config: &SearchConfig) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("relink-matcher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SearchError::Network(e.to_string()))?;

        let per_second = NonZeroU32::new(config.rate_limit_per_sec).unwrap_or(NonZeroU32::MIN);
        Ok(WikidataClient {
            client,
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
            endpoint: config.endpoint.clone(),
            language: config.language.clone(),
            limit: clamped_limit(config.limit),
            rate_acquire_timeout: Duration::from_secs(config.rate_acquire_timeout_secs),
        })
    }

    /// Wait for a token; a bounded wait so a starved worker nacks instead
    /// of hanging.
    async fn acquire_slot(&self) -> Result<(), SearchError> {
        tokio::time::timeout(self.rate_acquire_timeout, self.rate_limiter.until_ready())
            .await
            .map_err(|_| SearchError::RateLimitWait)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        params: &[(&str, &str)],
    ) -> Result<T, SearchError> {
        self.acquire_slot().await?;

        let response = self
            .client
            .get(&self.endpoint)
            .query(params)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Api {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SearchError::Decode(e.to_string()))
    }

    async fn search_ids(&self, query: &str) -> Result<Vec<String>, SearchError> {
        let limit = self.limit.to_string();
        let body: SearchResponse = self
            .get_json(&[
                ("action", "wbsearchentities"),
                ("format", "json"),
                ("language", self.language.as_str()),
                ("uselang", self.language.as_str()),
                ("type", "item"),
                ("limit", limit.as_str()),
                ("search", query),
            ])
            .await?;

        if let Some(error) = body.error {
            // MediaWiki reports API-level errors inside a 200 body
            return Err(SearchError::Api {
                status: 400,
                message: format!("{}: {}", error.code, error.info),
            });
        }

        debug!("wbsearchentities '{}' returned {} hits", query, body.search.len());
        Ok(body.search.into_iter().map(|hit| hit.id).collect())
    }

    async fn hydrate(&self, ids: &[String]) -> Result<Vec<EntitySnapshot>, SearchError> {
        let joined = ids.join("|");
        let body: EntitiesResponse = self
            .get_json(&[
                ("action", "wbgetentities"),
                ("format", "json"),
                ("props", "labels|descriptions|aliases|claims"),
                ("languages", self.language.as_str()),
                ("ids", joined.as_str()),
            ])
            .await?;

        if let Some(error) = body.error {
            return Err(SearchError::Api {
                status: 400,
                message: format!("{}: {}", error.code, error.info),
            });
        }

        // walk the original id list so search rank order survives the map
        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = body.entities.get(id) {
                snapshots.push(snapshot_from_entity(id, entity, &self.language));
            }
        }
        Ok(snapshots)
    }
}

#[async_trait]
impl SearchClient for WikidataClient {
    async fn search(&self, query: &str) -> Result<Vec<EntitySnapshot>, SearchError> {
        let ids = self.search_ids(query).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.hydrate(&ids).await
    }
}

fn classify_reqwest(e: reqwest::Error) -> SearchError {
    if e.is_timeout() {
        SearchError::Timeout
    } else {
        SearchError::Network(e.to_string())
    }
}

/// The Action API rejects limits outside 1..=50
fn clamped_limit(limit: u32) -> u32 {
    limit.clamp(1, 50)
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    info: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    search: Vec<SearchHit>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: String,
}

#[derive(Debug, Deserialize)]
struct EntitiesResponse {
    #[serde(default)]
    entities: BTreeMap<String, EntityBody>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct EntityBody {
    #[serde(default)]
    labels: BTreeMap<String, TermValue>,
    #[serde(default)]
    descriptions: BTreeMap<String, TermValue>,
    #[serde(default)]
    aliases: BTreeMap<String, Vec<TermValue>>,
    #[serde(default)]
    claims: BTreeMap<String, Vec<Claim>>,
}

#[derive(Debug, Deserialize)]
struct TermValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct Claim {
    #[serde(default)]
    mainsnak: Option<Snak>,
}

#[derive(Debug, Deserialize)]
struct Snak {
    /// Absent for novalue/somevalue snaks
    #[serde(default)]
    datavalue: Option<DataValue>,
}

#[derive(Debug, Deserialize)]
struct DataValue {
    #[serde(rename = "type")]
    value_type: String,
    value: serde_json::Value,
}

/// Render a mainsnak datavalue to a comparable string: time values keep
/// the `+YYYY-MM-DDT00:00:00Z` form, entity-id values the `Q…` id, strings
/// verbatim.
fn render_datavalue(value: &DataValue) -> Option<String> {
    match value.value_type.as_str() {
        "string" => value.value.as_str().map(str::to_string),
        "time" => value
            .value
            .get("time")
            .and_then(|t| t.as_str())
            .map(str::to_string),
        "wikibase-entityid" => value
            .value
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                value
                    .value
                    .get("numeric-id")
                    .and_then(|v| v.as_i64())
                    .map(|n| format!("Q{}", n))
            }),
        "monolingualtext" => value
            .value
            .get("text")
            .and_then(|t| t.as_str())
            .map(str::to_string),
        "quantity" => value
            .value
            .get("amount")
            .and_then(|a| a.as_str())
            .map(str::to_string),
        _ => None,
    }
}

fn snapshot_from_entity(id: &str, entity: &EntityBody, language: &str) -> EntitySnapshot {
    let label = entity.labels.get(language).map(|t| t.value.clone());
    let description = entity.descriptions.get(language).map(|t| t.value.clone());
    let aliases = entity
        .aliases
        .get(language)
        .map(|list| list.iter().map(|t| t.value.clone()).collect())
        .unwrap_or_default();

    let mut claims = BTreeMap::new();
    for (property, statements) in &entity.claims {
        let rendered = statements.iter().find_map(|claim| {
            let snak = claim.mainsnak.as_ref()?;
            let datavalue = snak.datavalue.as_ref()?;
            render_datavalue(datavalue)
        });
        if let Some(rendered) = rendered {
            claims.insert(property.clone(), rendered);
        }
    }

    EntitySnapshot {
        id: id.to_string(),
        label,
        description,
        aliases,
        claims,
    }
}
