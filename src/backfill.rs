use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::CrawlSettings;
use crate::errors::{AppError, AppResult, TransportError};
use crate::places::SearchStatus;
use crate::retry::RetryPolicy;
use crate::store::{PlaceStore, PostalUpdate};

pub const DEFAULT_BACKFILL_BATCH: usize = 200;

/// Place Details response restricted to the address fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetailsPage {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl DetailsPage {
    pub fn status(&self) -> SearchStatus {
        SearchStatus::parse(&self.status)
    }

    pub fn formatted_address(&self) -> Option<String> {
        self.result
            .as_ref()
            .and_then(|r| r.get("formatted_address"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn postal_code(&self) -> Option<String> {
        self.result
            .as_ref()
            .and_then(|r| r.get("address_components"))
            .and_then(extract_postal_code)
    }
}

/// A single Place Details round-trip. Implementations do not retry.
#[async_trait]
pub trait PlaceDetailsLookup: Send + Sync {
    async fn fetch_details(&self, place_id: &str) -> Result<DetailsPage, TransportError>;
}

pub fn extract_postal_code(components: &Value) -> Option<String> {
    components.as_array()?.iter().find_map(|component| {
        let is_postal = component
            .get("types")
            .and_then(Value::as_array)
            .map(|types| types.iter().any(|t| t.as_str() == Some("postal_code")))
            .unwrap_or(false);
        if !is_postal {
            return None;
        }
        component
            .get("long_name")
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub total: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Fills `postal_code` for stored places that were never looked up.
pub struct PostalBackfill {
    lookup: Arc<dyn PlaceDetailsLookup>,
    retry: RetryPolicy,
    request_delay: Duration,
    batch_size: usize,
}

impl PostalBackfill {
    pub fn new(lookup: Arc<dyn PlaceDetailsLookup>, settings: &CrawlSettings) -> Self {
        Self {
            lookup,
            retry: settings.retry_policy(),
            request_delay: settings.request_delay,
            batch_size: DEFAULT_BACKFILL_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn run(&self, store: &mut PlaceStore, limit: Option<usize>) -> AppResult<BackfillReport> {
        let pending = store.missing_postal_codes(limit)?;
        let mut report = BackfillReport {
            total: pending.len(),
            ..BackfillReport::default()
        };
        info!(target: "backfill", total = report.total, "looking up postal codes");

        let mut batch: Vec<PostalUpdate> = Vec::with_capacity(self.batch_size);
        for (index, place) in pending.iter().enumerate() {
            if index > 0 {
                sleep(self.request_delay).await;
            }

            let page = match self.lookup_with_backoff(&place.place_id).await {
                Ok(Some(page)) => page,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    store.apply_postal_updates(&batch)?;
                    report.updated += batch.len();
                    return Err(err);
                }
            };

            match page.status() {
                SearchStatus::Ok => batch.push(PostalUpdate {
                    region: place.region.clone(),
                    place_id: place.place_id.clone(),
                    postal_code: page.postal_code(),
                    address: page.formatted_address(),
                }),
                SearchStatus::RequestDenied => {
                    store.apply_postal_updates(&batch)?;
                    report.updated += batch.len();
                    return Err(AppError::fatal_provider(page.status, page.error_message));
                }
                _ => {
                    if page.status() != SearchStatus::ZeroResults {
                        warn!(
                            target: "backfill",
                            region = %place.region,
                            place_id = %place.place_id,
                            status = %page.status,
                            "details lookup skipped"
                        );
                    }
                    report.skipped += 1;
                }
            }

            if batch.len() >= self.batch_size {
                report.updated += store.apply_postal_updates(&batch)?;
                batch.clear();
                info!(
                    target: "backfill",
                    processed = index + 1,
                    total = report.total,
                    updated = report.updated,
                    skipped = report.skipped,
                    "backfill progress"
                );
            }
        }

        report.updated += store.apply_postal_updates(&batch)?;
        info!(
            target: "backfill",
            updated = report.updated,
            skipped = report.skipped,
            total = report.total,
            "backfill finished"
        );
        Ok(report)
    }

    /// `Ok(None)` when the network budget ran out for this place.
    async fn lookup_with_backoff(&self, place_id: &str) -> AppResult<Option<DetailsPage>> {
        let mut throttled = 0;
        loop {
            let page = match self
                .retry
                .run(
                    |_| self.lookup.fetch_details(place_id),
                    TransportError::is_retryable,
                )
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    let attempts = err.attempts();
                    let error = err.into_inner();
                    if error.is_credential_rejection() {
                        return Err(AppError::fatal_provider(
                            "HTTP_REJECTED",
                            Some(error.to_string()),
                        ));
                    }
                    warn!(
                        target: "backfill",
                        place_id,
                        attempts,
                        %error,
                        "giving up on details lookup"
                    );
                    return Ok(None);
                }
            };

            if page.status() != SearchStatus::OverQueryLimit {
                return Ok(Some(page));
            }

            throttled += 1;
            if throttled >= self.retry.max_attempts() {
                return Err(AppError::fatal_provider(page.status, page.error_message));
            }
            let delay = self.retry.backoff_delay(throttled);
            warn!(
                target: "backfill",
                attempt = throttled,
                "details lookups throttled; backing off for {:?}", delay
            );
            sleep(delay).await;
        }
    }
}
