use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::JournalSettings;
use crate::crawler::RegionReport;
use crate::errors::AppResult;
use crate::places::Degradation;

const JOURNAL_FILE: &str = "crawl-journal.jsonl";

/// Events an operator needs to judge how complete a run's data is.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CrawlEvent {
    RegionStarted {
        region: String,
        radius_m: u32,
        step_m: f64,
        already_stored: usize,
    },
    PointDegraded {
        region: String,
        lat: f64,
        lng: f64,
        degradation: Degradation,
    },
    RegionFinished {
        report: RegionReport,
    },
    RegionFailed {
        region: String,
        error: String,
    },
    RunAborted {
        region: String,
        error: String,
    },
}

#[derive(Debug, Serialize)]
struct JournalLine<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a CrawlEvent,
}

/// Buffered JSON-lines journal with size-based rotation.
#[derive(Clone)]
pub struct CrawlJournal {
    enabled: bool,
    queue: Arc<Mutex<Vec<(DateTime<Utc>, CrawlEvent)>>>,
    path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
    rotations: Arc<AtomicU32>,
}

impl CrawlJournal {
    pub fn open(settings: &JournalSettings) -> AppResult<Self> {
        fs::create_dir_all(&settings.directory)?;
        let path = settings.directory.join(JOURNAL_FILE);
        OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            enabled: settings.enabled,
            queue: Arc::new(Mutex::new(Vec::new())),
            path,
            batch_size: settings.batch_size.max(1),
            max_file_bytes: settings.max_file_bytes,
            max_file_count: settings.max_files.max(1),
            rotations: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn record(&self, event: CrawlEvent) -> AppResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut queue = self.queue.lock();
        queue.push((Utc::now(), event));
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist_locked(&self, queue: &mut Vec<(DateTime<Utc>, CrawlEvent)>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut encoded = Vec::with_capacity(queue.len());
        let mut incoming = 0_u64;
        for (timestamp, event) in queue.iter() {
            let line = serde_json::to_vec(&JournalLine {
                timestamp: *timestamp,
                event,
            })?;
            incoming += (line.len() + 1) as u64;
            encoded.push(line);
        }

        self.rotate_if_needed(incoming)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        for line in &encoded {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming: u64) -> AppResult<()> {
        let current = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current == 0 || current + incoming <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count == 1 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            return Ok(());
        }

        let sequence = self.rotations.fetch_add(1, Ordering::SeqCst);
        let rotated = self.directory().join(format!(
            "{}-{}-{sequence:03}.jsonl",
            self.stem(),
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        fs::rename(&self.path, &rotated)?;
        self.prune_rotations()
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let prefix = format!("{}-", self.stem());
        let mut rotated = fs::read_dir(self.directory())?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_string_lossy().to_string();
                (name.starts_with(&prefix) && name.ends_with(".jsonl")).then(|| (name, entry.path()))
            })
            .collect::<Vec<_>>();

        // names embed the rotation time, so lexical order is age order
        rotated.sort();
        let allowed = self.max_file_count.saturating_sub(1);
        if rotated.len() > allowed {
            let excess = rotated.len() - allowed;
            for (_, path) in rotated.into_iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "crawl-journal".into())
    }
}
