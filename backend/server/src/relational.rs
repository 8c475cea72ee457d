//! # SQLite
//!
//! Relational variant of the status store.
//!
//! ## Schema
//!
//! `tap` keeps one row per sighting and is never updated:
//!
//! | column     | type                  |
//! |------------|-----------------------|
//! | `id`       | integer, primary key  |
//! | `nfcid`    | text, required        |
//! | `datetime` | datetime, required    |
//! | `status`   | text, required        |
//! | `ip`       | text, required        |
//!
//! The current status of an identifier is its latest row by `datetime`, ties
//! broken by `id`. Completed visits go into `visits`, keyed by a unique
//! `visit_key` so one identifier can have any number of them.
use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::{debug, info, warn};

use crate::store::{
    Status, StatusRecord, StatusStore, StoreError, VisitRecord, check_duration,
    parse_stored_status, skip_corrupted, visit_key,
};

const CREATE_TAP: &str = "CREATE TABLE IF NOT EXISTS tap (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    nfcid TEXT NOT NULL,
    datetime TEXT NOT NULL,
    status TEXT NOT NULL,
    ip TEXT NOT NULL
)";

const CREATE_TAP_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tap_nfcid_datetime ON tap (nfcid, datetime)";

const CREATE_VISITS: &str = "CREATE TABLE IF NOT EXISTS visits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    visit_key TEXT NOT NULL UNIQUE,
    nfcid TEXT NOT NULL,
    duration_secs REAL NOT NULL,
    ip TEXT,
    datetime TEXT NOT NULL
)";

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::backend)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // Single writer keeps the read-then-insert of one toggle on one connection
        // and avoids "database is locked" under concurrent requests.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::backend)?;

        let store = Self { pool };
        store.provision().await?;

        Ok(store)
    }

    async fn table_exists(&self, name: &str) -> Result<bool, StoreError> {
        sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl StatusStore for SqliteStore {
    async fn provision(&self) -> Result<(), StoreError> {
        if self.table_exists("tap").await? {
            info!("Loading existing table tap");
        } else {
            info!("Creating table tap");
        }

        for statement in [CREATE_TAP, CREATE_TAP_INDEX, CREATE_VISITS] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::backend)?;
        }

        Ok(())
    }

    async fn get_status(&self, nfcid: &str) -> Result<Option<StatusRecord>, StoreError> {
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT status, datetime FROM tap WHERE nfcid = ? ORDER BY datetime DESC, id DESC LIMIT 1",
        )
        .bind(nfcid)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        row.map(|(status, datetime)| {
            Ok(StatusRecord {
                nfcid: nfcid.to_string(),
                status: parse_stored_status(nfcid, &status)?,
                datetime,
            })
        })
        .transpose()
    }

    async fn set_status(
        &self,
        nfcid: &str,
        status: Status,
        datetime: DateTime<Utc>,
        ip: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO tap (nfcid, datetime, status, ip) VALUES (?, ?, ?, ?)")
            .bind(nfcid)
            .bind(datetime)
            .bind(status.as_str())
            .bind(ip)
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;

        debug!("DB insert: {nfcid} {datetime} {status} {ip}");
        Ok(())
    }

    async fn record_visit(
        &self,
        nfcid: &str,
        duration_secs: f64,
        ip: Option<&str>,
        datetime: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        check_duration(duration_secs)?;

        sqlx::query(
            "INSERT INTO visits (visit_key, nfcid, duration_secs, ip, datetime) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(visit_key(nfcid))
        .bind(nfcid)
        .bind(duration_secs)
        .bind(ip)
        .bind(datetime)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn list_latest_status_per_id(&self) -> Result<Vec<StatusRecord>, StoreError> {
        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT t.nfcid, t.status, t.datetime FROM tap t
             WHERE t.id = (
                 SELECT id FROM tap WHERE nfcid = t.nfcid ORDER BY datetime DESC, id DESC LIMIT 1
             )
             ORDER BY t.nfcid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(skip_corrupted(rows.into_iter().map(
            |(nfcid, status, datetime)| {
                Ok(StatusRecord {
                    status: parse_stored_status(&nfcid, &status)?,
                    nfcid,
                    datetime,
                })
            },
        )))
    }

    async fn list_visits(&self, nfcid: &str) -> Result<Vec<VisitRecord>, StoreError> {
        let rows: Vec<(f64, Option<String>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT duration_secs, ip, datetime FROM visits WHERE nfcid = ? ORDER BY datetime, id",
        )
        .bind(nfcid)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(rows
            .into_iter()
            .map(|(duration_secs, ip, datetime)| VisitRecord {
                nfcid: nfcid.to_string(),
                duration_secs,
                ip,
                datetime,
            })
            .collect())
    }

    async fn drop_all(&self) -> Result<(), StoreError> {
        warn!("Dropping tables tap and visits");

        for statement in ["DROP TABLE IF EXISTS tap", "DROP TABLE IF EXISTS visits"] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::backend)?;
        }

        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
