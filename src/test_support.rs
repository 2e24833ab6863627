//! Fake provider seams shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::backfill::{DetailsPage, PlaceDetailsLookup};
use crate::errors::TransportError;
use crate::places::{NearbySearch, PageRequest, SearchPage};

type Responder = dyn Fn(&PageRequest, usize) -> Result<SearchPage, TransportError> + Send + Sync;

/// Answers each request through a closure that also sees the 0-based call index.
pub(crate) struct ScriptedSearch {
    responder: Box<Responder>,
    requests: Mutex<Vec<PageRequest>>,
}

impl ScriptedSearch {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: Fn(&PageRequest, usize) -> Result<SearchPage, TransportError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl NearbySearch for ScriptedSearch {
    async fn fetch_page(&self, request: &PageRequest) -> Result<SearchPage, TransportError> {
        let call = {
            let mut log = self.requests.lock();
            log.push(request.clone());
            log.len() - 1
        };
        (self.responder)(request, call)
    }
}

type DetailsResponder = dyn Fn(&str, usize) -> Result<DetailsPage, TransportError> + Send + Sync;

pub(crate) struct ScriptedDetails {
    responder: Box<DetailsResponder>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedDetails {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, usize) -> Result<DetailsPage, TransportError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PlaceDetailsLookup for ScriptedDetails {
    async fn fetch_details(&self, place_id: &str) -> Result<DetailsPage, TransportError> {
        let call = {
            let mut log = self.calls.lock();
            log.push(place_id.to_string());
            log.len() - 1
        };
        (self.responder)(place_id, call)
    }
}

pub(crate) fn place_payload(place_id: &str) -> Value {
    json!({
        "place_id": place_id,
        "name": format!("Place {place_id}"),
        "vicinity": "1 Market St",
        "geometry": { "location": { "lat": 37.79, "lng": -122.39 } },
        "rating": 4.2,
        "user_ratings_total": 87,
        "price_level": 2,
        "business_status": "OPERATIONAL",
        "types": ["restaurant", "food"]
    })
}

pub(crate) fn ok_page(ids: &[&str], token: Option<&str>) -> SearchPage {
    SearchPage {
        status: "OK".into(),
        results: ids.iter().map(|id| place_payload(id)).collect(),
        next_page_token: token.map(str::to_string),
        error_message: None,
    }
}

pub(crate) fn status_page(status: &str) -> SearchPage {
    SearchPage {
        status: status.into(),
        ..SearchPage::default()
    }
}

pub(crate) fn details_page(status: &str, postal_code: Option<&str>) -> DetailsPage {
    let result = postal_code.map(|code| {
        json!({
            "formatted_address": format!("1 Market St, San Francisco, CA {code}, USA"),
            "address_components": [
                { "long_name": "San Francisco", "short_name": "SF", "types": ["locality", "political"] },
                { "long_name": code, "short_name": code, "types": ["postal_code"] }
            ]
        })
    });
    DetailsPage {
        status: status.into(),
        result,
        error_message: None,
    }
}
