use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(db_path: P) -> AppResult<DatabaseContext> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    apply_pragmas(&connection)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "place store ready"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

fn apply_pragmas(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA temp_store = MEMORY;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS places (
            region TEXT NOT NULL,
            place_id TEXT NOT NULL,
            name TEXT,
            address TEXT,
            lat REAL,
            lng REAL,
            rating REAL,
            rating_count INTEGER,
            price_tier INTEGER,
            business_status TEXT,
            category_tags TEXT NOT NULL DEFAULT '[]',
            raw_payload TEXT NOT NULL,
            fetched_at TEXT NOT NULL,
            PRIMARY KEY (region, place_id)
        );

        CREATE INDEX IF NOT EXISTS idx_places_region ON places(region);
        "#,
    )?;

    ensure_column(connection, "places", "postal_code TEXT")?;
    ensure_column(connection, "places", "details_fetched_at TEXT")?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_places_postal_code ON places(postal_code)",
        [],
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path().join("nested").join("places.db")).unwrap();

        let tables: i64 = ctx
            .connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = 'places'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
        assert!(column_exists(&ctx.connection, "places", "postal_code").unwrap());
        assert!(ctx.path.ends_with("places.db"));
    }

    #[test]
    fn upgrades_tables_created_before_backfill_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE places (
                    region TEXT NOT NULL,
                    place_id TEXT NOT NULL,
                    name TEXT,
                    address TEXT,
                    lat REAL,
                    lng REAL,
                    rating REAL,
                    rating_count INTEGER,
                    price_tier INTEGER,
                    business_status TEXT,
                    category_tags TEXT NOT NULL DEFAULT '[]',
                    raw_payload TEXT NOT NULL,
                    fetched_at TEXT NOT NULL,
                    PRIMARY KEY (region, place_id)
                );
                INSERT INTO places (region, place_id, raw_payload, fetched_at)
                VALUES ('Chicago', 'legacy', '{}', '2024-01-01T00:00:00Z');",
            )
            .unwrap();
        }

        let ctx = bootstrap(&path).unwrap();
        assert!(column_exists(&ctx.connection, "places", "details_fetched_at").unwrap());
        let kept: i64 = ctx
            .connection
            .query_row("SELECT COUNT(*) FROM places", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kept, 1);
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("twice.db");
        drop(bootstrap(&path).unwrap());
        assert!(bootstrap(&path).is_ok());
    }
}
