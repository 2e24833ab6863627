pub mod backfill;
pub mod config;
pub mod crawler;
pub mod db;
pub mod errors;
pub mod google;
pub mod grid;
pub mod journal;
pub mod places;
pub mod plateau;
pub mod retry;
pub mod secrets;
pub mod store;

#[cfg(test)]
mod test_support;

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::backfill::{BackfillReport, PostalBackfill};
pub use crate::config::{
    default_regions, load_regions, AppConfig, CrawlSettings, JournalSettings, PlateauSettings,
    ProviderEndpoints, RegionConfig,
};
pub use crate::crawler::{CrawlOrchestrator, CrawlState, RegionReport, RegionStop, RunReport};
pub use crate::errors::{AppError, AppResult, TransportError};
pub use crate::google::GooglePlacesClient;
pub use crate::grid::{BoundingBox, GridPoint, GridPoints};
pub use crate::journal::{CrawlEvent, CrawlJournal};
pub use crate::places::{PlaceCandidate, PlacesAdapter};
pub use crate::plateau::{PlateauDetector, PlateauPhase, PlateauSignal};
pub use crate::secrets::{CredentialSource, CredentialStore};
pub use crate::store::{PlaceRecord, PlaceStore};

#[derive(Debug, Serialize)]
pub struct CrawlerStatus {
    pub database_path: String,
    pub journal_path: Option<String>,
    pub keyring_has_api_key: bool,
    pub region_counts: BTreeMap<String, usize>,
}

/// Wires configuration, credentials, the store and the journal together for the CLI.
pub struct CrawlerApp {
    config: AppConfig,
    credentials: CredentialStore,
    journal: Option<CrawlJournal>,
}

impl CrawlerApp {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        config.crawl.validate()?;
        let journal = if config.journal.enabled {
            Some(CrawlJournal::open(&config.journal)?)
        } else {
            None
        };
        Ok(Self {
            config,
            credentials: CredentialStore::default(),
            journal,
        })
    }

    pub fn open_store(&self) -> AppResult<PlaceStore> {
        PlaceStore::open(&self.config.database_path)
    }

    pub fn status(&self) -> AppResult<CrawlerStatus> {
        let store = self.open_store()?;
        let keyring_has_api_key = self.credentials.has_api_key().unwrap_or_else(|err| {
            warn!(?err, "keyring unavailable");
            false
        });
        Ok(CrawlerStatus {
            database_path: store.path().to_string_lossy().to_string(),
            journal_path: self
                .journal
                .as_ref()
                .map(|j| j.path().to_string_lossy().to_string()),
            keyring_has_api_key,
            region_counts: store.region_counts()?,
        })
    }

    pub async fn crawl(&self, regions: &[RegionConfig]) -> AppResult<RunReport> {
        let client = self.provider_client()?;
        let adapter = PlacesAdapter::new(Arc::new(client), &self.config.crawl);
        let mut orchestrator = CrawlOrchestrator::new(
            adapter,
            self.open_store()?,
            self.config.crawl.clone(),
            self.config.keyword.clone(),
        );
        if let Some(journal) = &self.journal {
            orchestrator = orchestrator.with_journal(journal.clone());
        }
        orchestrator.run(regions).await
    }

    pub async fn backfill_postal(&self, limit: Option<usize>) -> AppResult<BackfillReport> {
        let client = self.provider_client()?;
        let mut store = self.open_store()?;
        PostalBackfill::new(Arc::new(client), &self.config.crawl)
            .run(&mut store, limit)
            .await
    }

    pub fn store_api_key(&self, key: &secrecy::SecretString) -> AppResult<()> {
        self.credentials.store_api_key(key)
    }

    fn provider_client(&self) -> AppResult<GooglePlacesClient> {
        let (api_key, source) = self
            .credentials
            .resolve_api_key(self.config.google_places_api_key.as_ref())?;
        info!(source = source.as_str(), "resolved Places API key");
        GooglePlacesClient::new(self.config.endpoints.clone(), api_key)
    }
}

impl CrawlerStatus {
    pub fn total(&self) -> usize {
        self.region_counts.values().sum()
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,places_grid_crawler=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
