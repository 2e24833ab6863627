use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::trace;

use crate::backfill::{DetailsPage, PlaceDetailsLookup};
use crate::config::ProviderEndpoints;
use crate::errors::{AppResult, TransportError};
use crate::places::{NearbySearch, PageRequest, SearchPage};

const DETAILS_FIELDS: &str = "address_component,formatted_address";
const USER_AGENT: &str = concat!("places-grid-crawler/", env!("CARGO_PKG_VERSION"));

/// Google Places web-service client. One call per method; retries live above it.
#[derive(Clone)]
pub struct GooglePlacesClient {
    http: Client,
    endpoints: ProviderEndpoints,
    api_key: SecretString,
}

impl GooglePlacesClient {
    pub fn new(endpoints: ProviderEndpoints, api_key: SecretString) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(endpoints.connect_timeout)
            .timeout(endpoints.read_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoints,
            api_key,
        })
    }
}

#[async_trait]
impl NearbySearch for GooglePlacesClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<SearchPage, TransportError> {
        let key = self.api_key.expose_secret();
        let query: Vec<(&str, String)> = match request {
            PageRequest::Nearby {
                location,
                radius_m,
                keyword,
            } => vec![
                ("location", format!("{},{}", location.lat, location.lng)),
                ("radius", radius_m.to_string()),
                ("keyword", keyword.clone()),
                ("key", key.to_string()),
            ],
            PageRequest::Continuation { token } => {
                vec![("pagetoken", token.clone()), ("key", key.to_string())]
            }
        };

        let page = self
            .http
            .get(&self.endpoints.nearby_search)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json::<SearchPage>()
            .await?;
        trace!(
            target: "google_places",
            status = %page.status,
            results = page.results.len(),
            has_token = page.next_page_token.is_some(),
            "nearby search page"
        );
        Ok(page)
    }
}

#[async_trait]
impl PlaceDetailsLookup for GooglePlacesClient {
    async fn fetch_details(&self, place_id: &str) -> Result<DetailsPage, TransportError> {
        let page = self
            .http
            .get(&self.endpoints.place_details)
            .query(&[
                ("place_id", place_id),
                ("fields", DETAILS_FIELDS),
                ("key", self.api_key.expose_secret()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<DetailsPage>()
            .await?;
        Ok(page)
    }
}
