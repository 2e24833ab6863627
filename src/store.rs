use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::db::{self, DatabaseContext};
use crate::errors::AppResult;
use crate::places::PlaceCandidate;

/// A stored place as read back from the `places` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceRecord {
    pub region: String,
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
    pub fetched_at: String,
    pub postal_code: Option<String>,
    pub details_fetched_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDetails {
    pub region: String,
    pub place_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostalUpdate {
    pub region: String,
    pub place_id: String,
    pub postal_code: Option<String>,
    pub address: Option<String>,
}

/// Keyed place table with one writer per process.
pub struct PlaceStore {
    connection: Connection,
    path: PathBuf,
}

impl PlaceStore {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::from_context(db::bootstrap(path)?))
    }

    pub fn from_context(context: DatabaseContext) -> Self {
        Self {
            connection: context.connection,
            path: context.path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn load_seen_ids(&self, region: &str) -> AppResult<HashSet<String>> {
        let mut stmt = self
            .connection
            .prepare("SELECT place_id FROM places WHERE region = ?1")?;
        let ids = stmt
            .query_map([region], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        debug!(target: "store", region, seen = ids.len(), "loaded seen ids");
        Ok(ids)
    }

    /// Writes the whole batch in one transaction; nothing is applied if any row fails.
    pub fn upsert(&mut self, region: &str, records: &[PlaceCandidate]) -> AppResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let fetched_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let tx = self.connection.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO places (
                    region, place_id, name, address, lat, lng, rating, rating_count,
                    price_tier, business_status, category_tags, raw_payload, fetched_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(region, place_id) DO UPDATE SET
                    name = excluded.name,
                    address = excluded.address,
                    lat = excluded.lat,
                    lng = excluded.lng,
                    rating = excluded.rating,
                    rating_count = excluded.rating_count,
                    price_tier = excluded.price_tier,
                    business_status = excluded.business_status,
                    category_tags = excluded.category_tags,
                    raw_payload = excluded.raw_payload,
                    fetched_at = MAX(excluded.fetched_at, places.fetched_at)",
            )?;
            for record in records {
                stmt.execute(params![
                    region,
                    record.place_id,
                    record.name,
                    record.address,
                    record.lat,
                    record.lng,
                    record.rating,
                    record.rating_count,
                    record.price_tier,
                    record.status,
                    serde_json::to_string(&record.category_tags)?,
                    serde_json::to_string(&record.raw_payload)?,
                    fetched_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn count_region(&self, region: &str) -> AppResult<usize> {
        let count: i64 = self.connection.query_row(
            "SELECT COUNT(*) FROM places WHERE region = ?1",
            [region],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn region_counts(&self) -> AppResult<BTreeMap<String, usize>> {
        let mut stmt = self
            .connection
            .prepare("SELECT region, COUNT(*) FROM places GROUP BY region ORDER BY region")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(counts)
    }

    pub fn get(&self, region: &str, place_id: &str) -> AppResult<Option<PlaceRecord>> {
        let record = self
            .connection
            .query_row(
                "SELECT region, place_id, name, address, lat, lng, rating, rating_count,
                        price_tier, business_status, category_tags, raw_payload, fetched_at,
                        postal_code, details_fetched_at
                 FROM places WHERE region = ?1 AND place_id = ?2",
                [region, place_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Places with no postal code that have never been resolved through Place Details.
    pub fn missing_postal_codes(&self, limit: Option<usize>) -> AppResult<Vec<PendingDetails>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.connection.prepare(
            "SELECT region, place_id FROM places
             WHERE postal_code IS NULL AND details_fetched_at IS NULL
             ORDER BY region, place_id
             LIMIT ?1",
        )?;
        let pending = stmt
            .query_map([limit], |row| {
                Ok(PendingDetails {
                    region: row.get(0)?,
                    place_id: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pending)
    }

    pub fn apply_postal_updates(&mut self, updates: &[PostalUpdate]) -> AppResult<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let resolved_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let tx = self.connection.transaction()?;
        let mut applied = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE places
                 SET postal_code = ?1,
                     address = COALESCE(?2, address),
                     details_fetched_at = ?3
                 WHERE region = ?4 AND place_id = ?5",
            )?;
            for update in updates {
                applied += stmt.execute(params![
                    update.postal_code,
                    update.address,
                    resolved_at,
                    update.region,
                    update.place_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(applied)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PlaceRecord> {
    let tags: String = row.get(10)?;
    let payload: String = row.get(11)?;
    Ok(PlaceRecord {
        region: row.get(0)?,
        place_id: row.get(1)?,
        name: row.get(2)?,
        address: row.get(3)?,
        lat: row.get(4)?,
        lng: row.get(5)?,
        rating: row.get(6)?,
        rating_count: row.get(7)?,
        price_tier: row.get(8)?,
        status: row.get(9)?,
        category_tags: serde_json::from_str(&tags).unwrap_or_default(),
        raw_payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        fetched_at: row.get(12)?,
        postal_code: row.get(13)?,
        details_fetched_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::test_support::place_payload;

    fn candidate(id: &str) -> PlaceCandidate {
        PlaceCandidate::from_payload(place_payload(id)).unwrap()
    }

    fn open_store(dir: &Path) -> PlaceStore {
        PlaceStore::open(dir.join("places.db")).unwrap()
    }

    #[test]
    fn upsert_is_idempotent_and_refreshes_fetched_at() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let batch = vec![candidate("a"), candidate("b")];

        assert_eq!(store.upsert("Chicago", &batch).unwrap(), 2);
        let first = store.get("Chicago", "a").unwrap().unwrap();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(store.upsert("Chicago", &batch).unwrap(), 2);
        let second = store.get("Chicago", "a").unwrap().unwrap();

        assert_eq!(store.count_region("Chicago").unwrap(), 2);
        assert!(second.fetched_at > first.fetched_at);
        assert_eq!(
            PlaceRecord {
                fetched_at: String::new(),
                ..first
            },
            PlaceRecord {
                fetched_at: String::new(),
                ..second
            }
        );
    }

    #[test]
    fn conflicting_write_overwrites_descriptive_fields() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.upsert("New York", &[candidate("p")]).unwrap();

        let mut renamed = place_payload("p");
        renamed["name"] = json!("Renamed");
        renamed["rating"] = json!(3.1);
        let updated = PlaceCandidate::from_payload(renamed.clone()).unwrap();
        store.upsert("New York", &[updated]).unwrap();

        let record = store.get("New York", "p").unwrap().unwrap();
        assert_eq!(record.name.as_deref(), Some("Renamed"));
        assert_eq!(record.rating, Some(3.1));
        assert_eq!(record.raw_payload, renamed);
        assert_eq!(record.category_tags, vec!["restaurant", "food"]);
        assert_eq!(store.count_region("New York").unwrap(), 1);
    }

    #[test]
    fn same_place_in_two_regions_is_two_rows() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.upsert("Los Angeles", &[candidate("shared")]).unwrap();
        store.upsert("San Francisco", &[candidate("shared")]).unwrap();

        let counts = store.region_counts().unwrap();
        assert_eq!(counts.get("Los Angeles"), Some(&1));
        assert_eq!(counts.get("San Francisco"), Some(&1));
        assert_eq!(
            store.load_seen_ids("Los Angeles").unwrap(),
            HashSet::from(["shared".to_string()])
        );
    }

    #[test]
    fn failed_batch_applies_nothing() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON places
                 WHEN NEW.place_id = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'poisoned row'); END;",
            )
            .unwrap();

        let batch = vec![candidate("ok-1"), candidate("ok-2"), candidate("poison")];
        assert!(store.upsert("Chicago", &batch).is_err());
        assert_eq!(store.count_region("Chicago").unwrap(), 0);
        assert!(store.load_seen_ids("Chicago").unwrap().is_empty());
    }

    #[test]
    fn postal_updates_mark_places_resolved() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .upsert("Chicago", &[candidate("a"), candidate("b")])
            .unwrap();

        assert_eq!(store.missing_postal_codes(None).unwrap().len(), 2);
        assert_eq!(store.missing_postal_codes(Some(1)).unwrap().len(), 1);

        let applied = store
            .apply_postal_updates(&[PostalUpdate {
                region: "Chicago".into(),
                place_id: "a".into(),
                postal_code: Some("60601".into()),
                address: None,
            }])
            .unwrap();
        assert_eq!(applied, 1);

        let record = store.get("Chicago", "a").unwrap().unwrap();
        assert_eq!(record.postal_code.as_deref(), Some("60601"));
        assert_eq!(record.address.as_deref(), Some("1 Market St"));
        assert!(record.details_fetched_at.is_some());
        assert_eq!(
            store.missing_postal_codes(None).unwrap(),
            vec![PendingDetails {
                region: "Chicago".into(),
                place_id: "b".into()
            }]
        );
    }

    #[test]
    fn reopening_keeps_rows() {
        let dir = tempdir().unwrap();
        {
            let mut store = open_store(dir.path());
            store.upsert("Chicago", &[candidate("kept")]).unwrap();
        }
        let store = open_store(dir.path());
        assert!(store.load_seen_ids("Chicago").unwrap().contains("kept"));
        assert!(store.path().ends_with("places.db"));
    }
}
