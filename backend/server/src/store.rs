//! # Status Store
//!
//! Persistence boundary for the checkpoint.
//!
//! Two things live here:
//! - The current **status** of every identifier ever scanned (`entering`/`exiting` + when)
//! - An append-only log of completed **visits** (identifier, duration, origin, exit time)
//!
//! ## Backends
//!
//! - [`relational::SqliteStore`](crate::relational::SqliteStore): one row per sighting, current status is
//!   the latest row for an identifier
//! - [`database::RedisStore`](crate::database::RedisStore): one hash field per identifier, overwritten on
//!   every sighting, plus a visit hash keyed by identifier and a random suffix
//! - [`memory::MemoryStore`](crate::memory::MemoryStore): process local, for development and tests
//!
//! The backend is picked once at startup from [`Config`]. Everything above this
//! module only ever sees `Arc<dyn StatusStore>`.
//!
//! ## Not found vs failure
//!
//! `get_status` returns `Ok(None)` for an identifier that was never seen. That is
//! the normal first-sighting path. `Err` is reserved for the backend being
//! unreachable or for a stored value that can't be a status.
use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::{Backend, Config},
    database::RedisStore,
    memory::MemoryStore,
    relational::SqliteStore,
};

pub const ENTERING: &str = "entering";
pub const EXITING: &str = "exiting";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Entering,
    Exiting,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Entering => ENTERING,
            Status::Exiting => EXITING,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ENTERING => Ok(Status::Entering),
            EXITING => Ok(Status::Exiting),
            other => Err(StoreError::Validation(format!("invalid status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub nfcid: String,
    pub status: Status,
    pub datetime: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub nfcid: String,
    pub duration_secs: f64,
    pub ip: Option<String>,
    pub datetime: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Validation error: {0}")]
    Validation(String),

    /// A stored value that can't have been written by us.
    #[error("Corrupted record for {nfcid}: {reason}")]
    Corrupted { nfcid: String, reason: String },
}

impl StoreError {
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(error))
    }

    pub(crate) fn corrupted(nfcid: &str, reason: impl Into<String>) -> Self {
        StoreError::Corrupted {
            nfcid: nfcid.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Create the backing table/schema if it is missing. Existing data is used as is.
    async fn provision(&self) -> Result<(), StoreError>;

    async fn get_status(&self, nfcid: &str) -> Result<Option<StatusRecord>, StoreError>;

    /// Last write wins.
    async fn set_status(
        &self,
        nfcid: &str,
        status: Status,
        datetime: DateTime<Utc>,
        ip: &str,
    ) -> Result<(), StoreError>;

    /// Appends one visit. Every call lands as its own entry, even for the same `nfcid`.
    async fn record_visit(
        &self,
        nfcid: &str,
        duration_secs: f64,
        ip: Option<&str>,
        datetime: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Latest status of every identifier. Rows that can't be read are logged and left out.
    async fn list_latest_status_per_id(&self) -> Result<Vec<StatusRecord>, StoreError>;

    /// Visits of one identifier, oldest first.
    async fn list_visits(&self, nfcid: &str) -> Result<Vec<VisitRecord>, StoreError>;

    /// Removes every status and visit. Operator only.
    async fn drop_all(&self) -> Result<(), StoreError>;

    async fn close(&self);
}

pub fn visit_key(nfcid: &str) -> String {
    format!("{nfcid}-{}", Uuid::new_v4())
}

pub(crate) fn check_duration(duration_secs: f64) -> Result<(), StoreError> {
    if !duration_secs.is_finite() || duration_secs < 0.0 {
        return Err(StoreError::Validation(format!(
            "invalid visit duration {duration_secs}"
        )));
    }

    Ok(())
}

pub(crate) fn parse_stored_status(nfcid: &str, raw: &str) -> Result<Status, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::corrupted(nfcid, format!("invalid status {raw:?}")))
}

pub async fn open_store(config: &Config) -> Result<Arc<dyn StatusStore>, StoreError> {
    let store: Arc<dyn StatusStore> = match &config.backend {
        Backend::Sqlite { database_url } => {
            info!("Opening SQLite store");
            Arc::new(SqliteStore::open(database_url).await?)
        }
        Backend::Redis { redis_url } => {
            info!("Opening Redis store at {}", config.masked_redis_url());
            Arc::new(RedisStore::open(redis_url, &config.table_name).await?)
        }
        Backend::Memory => {
            info!("Opening in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    Ok(store)
}

/// Drops unreadable rows from a listing, logging each one.
pub(crate) fn skip_corrupted<I>(rows: I) -> Vec<StatusRecord>
where
    I: IntoIterator<Item = Result<StatusRecord, StoreError>>,
{
    rows.into_iter()
        .filter_map(|row| {
            row.map_err(|e| error!("Skipping unreadable status row: {e}"))
                .ok()
        })
        .collect()
}

/// Logs the last status of every identifier. Diagnostic only, never fails the caller.
pub async fn log_latest_statuses(store: &dyn StatusStore) {
    info!("Last status for each NFC-id:");

    match store.list_latest_status_per_id().await {
        Ok(records) => {
            for record in records {
                info!("{} {} {}", record.nfcid, record.status, record.datetime);
            }
        }
        Err(e) => warn!("Couldn't list statuses: {e}"),
    }
}
