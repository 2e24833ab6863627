use std::collections::HashSet;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::{CrawlSettings, PlateauSettings, RegionConfig};
use crate::errors::AppResult;
use crate::grid::GridPoints;
use crate::journal::{CrawlEvent, CrawlJournal};
use crate::places::{PlaceCandidate, PlacesAdapter};
use crate::plateau::{PlateauDetector, PlateauSignal};
use crate::store::PlaceStore;

/// Per-region crawl bookkeeping, rebuilt from the store each time a region starts.
#[derive(Debug, Clone)]
pub struct CrawlState {
    seen: HashSet<String>,
    detector: PlateauDetector,
    points_visited: usize,
}

impl CrawlState {
    pub fn new(seen: HashSet<String>, plateau: PlateauSettings) -> Self {
        Self {
            seen,
            detector: PlateauDetector::new(plateau),
            points_visited: 0,
        }
    }

    pub fn resume(region: &str, store: &PlaceStore, plateau: PlateauSettings) -> AppResult<Self> {
        Ok(Self::new(store.load_seen_ids(region)?, plateau))
    }

    /// Results whose place id is neither stored nor earlier in the same batch.
    pub fn partition_new(&self, places: Vec<PlaceCandidate>) -> Vec<PlaceCandidate> {
        let mut batch_ids = HashSet::new();
        places
            .into_iter()
            .filter(|place| {
                !self.seen.contains(&place.place_id) && batch_ids.insert(place.place_id.clone())
            })
            .collect()
    }

    pub fn mark_seen(&mut self, places: &[PlaceCandidate]) {
        self.seen
            .extend(places.iter().map(|place| place.place_id.clone()));
    }

    pub fn observe(&mut self, new_count: usize) -> PlateauSignal {
        self.points_visited += 1;
        self.detector.observe(new_count)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn points_visited(&self) -> usize {
        self.points_visited
    }

    pub fn detector(&self) -> &PlateauDetector {
        &self.detector
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionStop {
    Plateau,
    GridExhausted,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionReport {
    pub region: String,
    pub points_visited: usize,
    pub results_seen: usize,
    pub new_records: usize,
    pub rows_written: usize,
    pub degraded_points: usize,
    pub stop: RegionStop,
    pub final_count: usize,
    pub target: Option<usize>,
    pub target_reached: Option<bool>,
}

impl RegionReport {
    fn started(region: &RegionConfig, target: Option<usize>) -> Self {
        Self {
            region: region.name.clone(),
            points_visited: 0,
            results_seen: 0,
            new_records: 0,
            rows_written: 0,
            degraded_points: 0,
            stop: RegionStop::GridExhausted,
            final_count: 0,
            target,
            target_reached: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.stop, RegionStop::Failed(_))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub regions: Vec<RegionReport>,
}

impl RunReport {
    pub fn total_new(&self) -> usize {
        self.regions.iter().map(|r| r.new_records).sum()
    }

    pub fn failed_regions(&self) -> impl Iterator<Item = &RegionReport> {
        self.regions.iter().filter(|r| r.is_failed())
    }
}

/// Runs regions one after another: grid point, provider search, dedup, upsert, plateau check.
pub struct CrawlOrchestrator {
    adapter: PlacesAdapter,
    store: PlaceStore,
    settings: CrawlSettings,
    keyword: String,
    journal: Option<CrawlJournal>,
}

impl CrawlOrchestrator {
    pub fn new(
        adapter: PlacesAdapter,
        store: PlaceStore,
        settings: CrawlSettings,
        keyword: impl Into<String>,
    ) -> Self {
        Self {
            adapter,
            store,
            settings,
            keyword: keyword.into(),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: CrawlJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn store(&self) -> &PlaceStore {
        &self.store
    }

    /// A provider rejection aborts the whole run; any other region error is
    /// reported and the next region starts.
    pub async fn run(&mut self, regions: &[RegionConfig]) -> AppResult<RunReport> {
        self.settings.validate()?;
        let mut run = RunReport::default();

        for region in regions {
            match self.crawl_region(region).await {
                Ok(report) => run.regions.push(report),
                Err(err) if err.is_process_fatal() => {
                    error!(
                        target: "crawler",
                        region = %region.name,
                        error = %err,
                        "provider rejected the crawl; aborting run"
                    );
                    self.journal_event(CrawlEvent::RunAborted {
                        region: region.name.clone(),
                        error: err.to_string(),
                    });
                    self.flush_journal();
                    return Err(err);
                }
                Err(err) => {
                    error!(target: "crawler", region = %region.name, error = %err, "region failed");
                    let mut report = RegionReport::started(region, self.target_for(region));
                    report.stop = RegionStop::Failed(err.to_string());
                    report.final_count = self.store.count_region(&region.name).unwrap_or(0);
                    self.journal_event(CrawlEvent::RegionFailed {
                        region: region.name.clone(),
                        error: err.to_string(),
                    });
                    run.regions.push(report);
                }
            }
        }

        self.flush_journal();
        Ok(run)
    }

    pub async fn crawl_region(&mut self, region: &RegionConfig) -> AppResult<RegionReport> {
        region.validate()?;
        let step_m = region.step_meters(self.settings.step_multiplier);
        let points = GridPoints::new(region.bbox, step_m)?;
        let mut state = CrawlState::resume(&region.name, &self.store, self.settings.plateau.clone())?;
        let mut report = RegionReport::started(region, self.target_for(region));

        info!(
            target: "crawler",
            region = %region.name,
            radius_m = region.radius_m,
            step_m,
            already_stored = state.seen_count(),
            "starting region"
        );
        self.journal_event(CrawlEvent::RegionStarted {
            region: region.name.clone(),
            radius_m: region.radius_m,
            step_m,
            already_stored: state.seen_count(),
        });

        for point in points {
            let outcome = self
                .adapter
                .search(point, region.radius_m, &self.keyword)
                .await?;
            report.results_seen += outcome.places.len();
            if let Some(degradation) = outcome.degraded {
                report.degraded_points += 1;
                self.journal_event(CrawlEvent::PointDegraded {
                    region: region.name.clone(),
                    lat: point.lat,
                    lng: point.lng,
                    degradation,
                });
            }

            let fresh = state.partition_new(outcome.places);
            if !fresh.is_empty() {
                match self.write_batch(&region.name, &fresh).await {
                    Ok(written) => {
                        report.rows_written += written;
                        state.mark_seen(&fresh);
                    }
                    Err(err) => {
                        error!(
                            target: "crawler",
                            region = %region.name,
                            error = %err,
                            "storage write failed twice; abandoning region"
                        );
                        report.stop = RegionStop::Failed(err.to_string());
                        report.points_visited = state.points_visited();
                        self.journal_event(CrawlEvent::RegionFailed {
                            region: region.name.clone(),
                            error: err.to_string(),
                        });
                        return self.finish_region(report);
                    }
                }
            }
            report.new_records += fresh.len();

            let signal = state.observe(fresh.len());
            report.points_visited = state.points_visited();
            info!(
                target: "crawler",
                region = %region.name,
                point = report.points_visited,
                lat = point.lat,
                lng = point.lng,
                pages = outcome.pages,
                new = fresh.len(),
                total = state.seen_count(),
                avg_new = state.detector().average(),
                low_streak = state.detector().low_streak(),
                "point done"
            );

            if signal == PlateauSignal::Stop {
                info!(
                    target: "crawler",
                    region = %region.name,
                    points = report.points_visited,
                    "new-result yield plateaued"
                );
                report.stop = RegionStop::Plateau;
                break;
            }
            sleep(self.settings.request_delay).await;
        }

        self.finish_region(report)
    }

    fn finish_region(&mut self, mut report: RegionReport) -> AppResult<RegionReport> {
        report.final_count = match self.store.count_region(&report.region) {
            Ok(count) => count,
            Err(err) if report.is_failed() => {
                warn!(
                    target: "crawler",
                    region = %report.region,
                    error = %err,
                    "unable to count failed region"
                );
                0
            }
            Err(err) => return Err(err),
        };
        report.target_reached = report.target.map(|target| report.final_count >= target);
        if report.target_reached == Some(false) {
            warn!(
                target: "crawler",
                region = %report.region,
                stored = report.final_count,
                target = report.target,
                "region ended below its target count"
            );
        }
        if !report.is_failed() {
            self.journal_event(CrawlEvent::RegionFinished {
                report: report.clone(),
            });
        }
        Ok(report)
    }

    async fn write_batch(&mut self, region: &str, fresh: &[PlaceCandidate]) -> AppResult<usize> {
        match self.store.upsert(region, fresh) {
            Ok(written) => Ok(written),
            Err(err) => {
                warn!(
                    target: "crawler",
                    region,
                    rows = fresh.len(),
                    error = %err,
                    "storage write failed; retrying once"
                );
                sleep(self.settings.transient_retry_delay).await;
                self.store.upsert(region, fresh)
            }
        }
    }

    fn target_for(&self, region: &RegionConfig) -> Option<usize> {
        region.target.or(self.settings.target_per_region)
    }

    fn journal_event(&self, event: CrawlEvent) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record(event) {
                warn!(target: "crawler", error = %err, "unable to append to crawl journal");
            }
        }
    }

    fn flush_journal(&self) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.flush() {
                warn!(target: "crawler", error = %err, "unable to flush crawl journal");
            }
        }
    }
}
