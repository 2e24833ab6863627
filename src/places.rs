use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::config::CrawlSettings;
use crate::errors::{AppError, AppResult, TransportError};
use crate::grid::GridPoint;
use crate::retry::{RetryError, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    Ok,
    ZeroResults,
    InvalidRequest,
    UnknownError,
    OverQueryLimit,
    RequestDenied,
    Other,
}

impl SearchStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "OK" => SearchStatus::Ok,
            "ZERO_RESULTS" => SearchStatus::ZeroResults,
            "INVALID_REQUEST" => SearchStatus::InvalidRequest,
            "UNKNOWN_ERROR" => SearchStatus::UnknownError,
            "OVER_QUERY_LIMIT" => SearchStatus::OverQueryLimit,
            "REQUEST_DENIED" => SearchStatus::RequestDenied,
            _ => SearchStatus::Other,
        }
    }
}

/// One page of a nearby search as the provider returned it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl SearchPage {
    pub fn status(&self) -> SearchStatus {
        SearchStatus::parse(&self.status)
    }

    fn continuation(&self) -> Option<String> {
        self.next_page_token
            .as_ref()
            .filter(|token| !token.trim().is_empty())
            .cloned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageRequest {
    Nearby {
        location: GridPoint,
        radius_m: u32,
        keyword: String,
    },
    Continuation {
        token: String,
    },
}

impl PageRequest {
    pub fn is_continuation(&self) -> bool {
        matches!(self, PageRequest::Continuation { .. })
    }
}

/// A single provider round-trip. Implementations do not retry.
#[async_trait]
pub trait NearbySearch: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<SearchPage, TransportError>;
}

/// Normalized view of one provider result; `raw_payload` keeps the result untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceCandidate {
    pub place_id: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub rating: Option<f64>,
    pub rating_count: Option<i64>,
    pub price_tier: Option<i64>,
    pub status: Option<String>,
    pub category_tags: Vec<String>,
    pub raw_payload: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NearbyResult {
    place_id: Option<String>,
    name: Option<String>,
    vicinity: Option<String>,
    formatted_address: Option<String>,
    geometry: Option<ResultGeometry>,
    rating: Option<f64>,
    user_ratings_total: Option<i64>,
    price_level: Option<i64>,
    business_status: Option<String>,
    types: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResultGeometry {
    location: Option<ResultLocation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResultLocation {
    lat: Option<f64>,
    lng: Option<f64>,
}

impl PlaceCandidate {
    /// Returns `None` for results without a usable place id.
    pub fn from_payload(payload: Value) -> Option<Self> {
        let parsed: NearbyResult = match serde_json::from_value(payload.clone()) {
            Ok(parsed) => parsed,
            Err(err) => {
                trace!(?err, "dropping provider result with unexpected shape");
                return None;
            }
        };
        let place_id = parsed.place_id.filter(|id| !id.trim().is_empty())?;
        let location = parsed.geometry.and_then(|g| g.location).unwrap_or_default();

        Some(Self {
            place_id,
            name: parsed.name,
            address: parsed.vicinity.or(parsed.formatted_address),
            lat: location.lat,
            lng: location.lng,
            rating: parsed.rating,
            rating_count: parsed.user_ratings_total,
            price_tier: parsed.price_level,
            status: parsed.business_status,
            category_tags: parsed.types,
            raw_payload: payload,
        })
    }
}

/// Why a point produced fewer results than the provider could have returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    TransientProvider { status: String },
    NetworkExhausted { attempts: u32, error: String },
    Transport { error: String },
    UnexpectedStatus { status: String, message: Option<String> },
}

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub places: Vec<PlaceCandidate>,
    pub pages: usize,
    pub degraded: Option<Degradation>,
}

enum PageResolution {
    Page(SearchPage),
    Degraded(Degradation),
}

/// Turns paged, error-prone provider calls into one result list per point.
///
/// Point-level failures come back as `SearchOutcome::degraded`; only a
/// provider rejection that would repeat on every point (denied credentials,
/// a quota that stays exhausted) is returned as `Err`.
pub struct PlacesAdapter {
    transport: Arc<dyn NearbySearch>,
    retry: RetryPolicy,
    max_pages: usize,
    page_token_delay: Duration,
    transient_retry_delay: Duration,
}

impl PlacesAdapter {
    pub fn new(transport: Arc<dyn NearbySearch>, settings: &CrawlSettings) -> Self {
        Self {
            transport,
            retry: settings.retry_policy(),
            max_pages: settings.max_pages.max(1),
            page_token_delay: settings.page_token_delay,
            transient_retry_delay: settings.transient_retry_delay,
        }
    }

    pub async fn search(
        &self,
        location: GridPoint,
        radius_m: u32,
        keyword: &str,
    ) -> AppResult<SearchOutcome> {
        let mut outcome = SearchOutcome::default();
        let mut token: Option<String> = None;

        for _ in 0..self.max_pages {
            let request = match token.take() {
                Some(token) => {
                    sleep(self.page_token_delay).await;
                    PageRequest::Continuation { token }
                }
                None => PageRequest::Nearby {
                    location,
                    radius_m,
                    keyword: keyword.to_string(),
                },
            };

            let page = match self.resolve(&request).await? {
                PageResolution::Page(page) => page,
                PageResolution::Degraded(degradation) => {
                    warn!(
                        lat = location.lat,
                        lng = location.lng,
                        pages = outcome.pages,
                        ?degradation,
                        "point degraded; keeping results gathered so far"
                    );
                    outcome.degraded = Some(degradation);
                    break;
                }
            };

            if page.status() == SearchStatus::ZeroResults {
                break;
            }

            outcome.pages += 1;
            let next = page.continuation();
            outcome
                .places
                .extend(page.results.into_iter().filter_map(PlaceCandidate::from_payload));
            match next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        Ok(outcome)
    }

    async fn resolve(&self, request: &PageRequest) -> AppResult<PageResolution> {
        let mut page = match self.fetch(request).await? {
            Ok(page) => page,
            Err(degradation) => return Ok(PageResolution::Degraded(degradation)),
        };
        let mut token_retried = !request.is_continuation();
        let mut transient_retried = false;
        let mut throttled = 0;

        loop {
            match page.status() {
                SearchStatus::InvalidRequest if !token_retried => {
                    token_retried = true;
                    debug!("continuation token not active yet; retrying once");
                    sleep(self.page_token_delay).await;
                }
                SearchStatus::UnknownError if !transient_retried => {
                    transient_retried = true;
                    warn!(
                        "provider reported UNKNOWN_ERROR; retrying after {:?}",
                        self.transient_retry_delay
                    );
                    sleep(self.transient_retry_delay).await;
                }
                SearchStatus::OverQueryLimit if throttled + 1 < self.retry.max_attempts() => {
                    throttled += 1;
                    let delay = self.retry.backoff_delay(throttled);
                    warn!(
                        attempt = throttled,
                        "provider throttled the request; backing off for {:?}", delay
                    );
                    sleep(delay).await;
                }
                _ => break,
            }
            page = match self.fetch(request).await? {
                Ok(page) => page,
                Err(degradation) => return Ok(PageResolution::Degraded(degradation)),
            };
        }

        match page.status() {
            SearchStatus::Ok | SearchStatus::ZeroResults => Ok(PageResolution::Page(page)),
            SearchStatus::OverQueryLimit | SearchStatus::RequestDenied => {
                Err(AppError::fatal_provider(page.status, page.error_message))
            }
            SearchStatus::UnknownError => Ok(PageResolution::Degraded(
                Degradation::TransientProvider {
                    status: page.status,
                },
            )),
            SearchStatus::InvalidRequest | SearchStatus::Other => Ok(PageResolution::Degraded(
                Degradation::UnexpectedStatus {
                    status: page.status,
                    message: page.error_message,
                },
            )),
        }
    }

    /// Transport failures degrade the point, except a refused key, which is fatal.
    async fn fetch(&self, request: &PageRequest) -> AppResult<Result<SearchPage, Degradation>> {
        let result = self
            .retry
            .run(
                |_| self.transport.fetch_page(request),
                TransportError::is_retryable,
            )
            .await;
        match result {
            Ok(page) => Ok(Ok(page)),
            Err(RetryError::Exhausted { attempts, last }) => {
                Ok(Err(Degradation::NetworkExhausted {
                    attempts,
                    error: last.to_string(),
                }))
            }
            Err(RetryError::Rejected { error, .. }) if error.is_credential_rejection() => Err(
                AppError::fatal_provider("HTTP_REJECTED", Some(error.to_string())),
            ),
            Err(RetryError::Rejected { error, .. }) => Ok(Err(Degradation::Transport {
                error: error.to_string(),
            })),
        }
    }
}
