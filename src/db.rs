use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
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
        "database ready"
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
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS localities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            display_name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            country TEXT NOT NULL,
            state TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (name_key, country)
        );

        CREATE TABLE IF NOT EXISTS locality_cache (
            search_key TEXT NOT NULL,
            country_key TEXT NOT NULL DEFAULT '',
            search_string TEXT NOT NULL,
            country TEXT,
            locality_id INTEGER REFERENCES localities(id),
            display_name TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (search_key, country_key)
        );

        CREATE TABLE IF NOT EXISTS restaurants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            locality_id INTEGER REFERENCES localities(id),
            locality_text TEXT,
            locality_key TEXT NOT NULL,
            place_id TEXT UNIQUE,
            cuisine TEXT,
            chef TEXT,
            price_tier INTEGER CHECK (price_tier IS NULL OR price_tier BETWEEN 1 AND 4),
            latitude REAL,
            longitude REAL,
            website TEXT,
            phone TEXT,
            address TEXT,
            reservation_url TEXT,
            social_url TEXT,
            place_checked_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS place_id_cache (
            name_key TEXT NOT NULL,
            locality_key TEXT NOT NULL,
            restaurant_name TEXT NOT NULL,
            locality_id INTEGER REFERENCES localities(id),
            place_id TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (name_key, locality_key)
        );

        CREATE TABLE IF NOT EXISTS place_id_aliases (
            old_place_id TEXT PRIMARY KEY,
            new_place_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS restaurant_merges (
            redundant_id INTEGER PRIMARY KEY,
            kept_id INTEGER NOT NULL REFERENCES restaurants(id),
            name_key TEXT NOT NULL,
            locality_key TEXT NOT NULL,
            place_id TEXT,
            merged_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS source_documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL DEFAULT 'article',
            locality_id INTEGER REFERENCES localities(id),
            title TEXT,
            description TEXT,
            image_url TEXT,
            site_name TEXT,
            refreshed_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS source_associations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            restaurant_id INTEGER NOT NULL REFERENCES restaurants(id) ON DELETE CASCADE,
            document_id INTEGER NOT NULL REFERENCES source_documents(id) ON DELETE CASCADE,
            description TEXT,
            url TEXT,
            observed_at TEXT NOT NULL,
            retracted_at TEXT,
            UNIQUE (restaurant_id, document_id)
        );

        CREATE TABLE IF NOT EXISTS awards (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            restaurant_id INTEGER NOT NULL REFERENCES restaurants(id) ON DELETE CASCADE,
            document_id INTEGER NOT NULL REFERENCES source_documents(id) ON DELETE CASCADE,
            source TEXT NOT NULL,
            award_type TEXT NOT NULL,
            year INTEGER,
            chef TEXT,
            url TEXT,
            observed_at TEXT NOT NULL,
            retracted_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_restaurants_identity ON restaurants(name_key, locality_key);
        CREATE INDEX IF NOT EXISTS idx_associations_document ON source_associations(document_id);
        CREATE INDEX IF NOT EXISTS idx_awards_restaurant ON awards(restaurant_id);
        CREATE INDEX IF NOT EXISTS idx_awards_document ON awards(document_id);
        "#,
    )?;

    ensure_column(connection, "restaurants", "place_checked_at TEXT")?;
    ensure_column(connection, "source_documents", "site_name TEXT")?;
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

/// Fixed-width UTC form; lexical order of stored values equals time order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| AppError::Parse(format!("invalid timestamp {value}: {err}")))
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path().join("test.db")).unwrap();

        let mut stmt = ctx
            .connection
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('localities','locality_cache','place_id_cache','place_id_aliases','restaurants','restaurant_merges','source_documents','source_associations','awards')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 9);
        assert!(ctx.path.ends_with("test.db"));
    }

    #[test]
    fn migrations_are_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("again.db");
        drop(bootstrap(&path).unwrap());
        let ctx = bootstrap(&path).unwrap();
        assert!(column_exists(&ctx.connection, "restaurants", "place_checked_at").unwrap());
    }

    #[test]
    fn timestamps_sort_lexically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::microseconds(1);
        let (a, b) = (format_timestamp(early), format_timestamp(late));
        assert!(a < b);
        assert_eq!(parse_timestamp(&a).unwrap(), early);
        assert!(parse_timestamp("yesterday").is_err());
    }
}
