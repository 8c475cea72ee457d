//! # Redis
//!
//! Key/value variant of the status store.
//!
//! ## Layout
//!
//! Everything sits under one key prefix, the table name (`tapevents` by default):
//!
//! - `{table}:status`: hash, field is the NFC id, value is JSON `{status, datetime, ip}`.
//!   One field per id, overwritten on every sighting.
//! - `{table}:visit`: hash, field is `{nfcid}-{uuid}`, value is JSON visit.
//!   Written with `HSETNX` so an existing visit is never replaced.
//! - `{table}:created`: marker set once with `SETNX` when the table is first provisioned.
//!
//! ## Notes
//!
//! - Hash lookups are O(1) per id, `HGETALL` on the status hash is the startup listing
//! - Status values are kept as plain strings in the JSON so a bad value is reported as
//!   corruption instead of failing deserialization somewhere less obvious
//! - The connection manager reconnects on its own; we give it one retry and a short
//!   connect timeout and surface anything else to the caller
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{
    AsyncCommands, Client,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{
    Status, StatusRecord, StatusStore, StoreError, VisitRecord, check_duration,
    parse_stored_status, skip_corrupted, visit_key,
};

#[derive(Serialize, Deserialize)]
struct StoredStatus {
    status: String,
    datetime: DateTime<Utc>,
    ip: String,
}

fn decode_status(nfcid: &str, raw: &str) -> Result<StatusRecord, StoreError> {
    let stored: StoredStatus = serde_json::from_str(raw)
        .map_err(|e| StoreError::corrupted(nfcid, format!("unreadable status entry: {e}")))?;

    Ok(StatusRecord {
        nfcid: nfcid.to_string(),
        status: parse_stored_status(nfcid, &stored.status)?,
        datetime: stored.datetime,
    })
}

pub struct RedisStore {
    connection: ConnectionManager,
    status_key: String,
    visit_key: String,
    created_key: String,
}

impl RedisStore {
    pub async fn open(redis_url: &str, table_name: &str) -> Result<Self, StoreError> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(500));

        let client = Client::open(redis_url).map_err(StoreError::backend)?;
        let connection = client
            .get_connection_manager_with_config(config)
            .await
            .map_err(StoreError::backend)?;

        let store = Self {
            connection,
            status_key: format!("{table_name}:status"),
            visit_key: format!("{table_name}:visit"),
            created_key: format!("{table_name}:created"),
        };
        store.provision().await?;

        Ok(store)
    }

    fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl StatusStore for RedisStore {
    async fn provision(&self) -> Result<(), StoreError> {
        let created: bool = self
            .connection()
            .set_nx(&self.created_key, Utc::now().to_rfc3339())
            .await
            .map_err(StoreError::backend)?;

        if created {
            info!("Creating table {}", self.created_key);
        } else {
            info!("Loading existing table {}", self.created_key);
        }

        Ok(())
    }

    async fn get_status(&self, nfcid: &str) -> Result<Option<StatusRecord>, StoreError> {
        let raw: Option<String> = self
            .connection()
            .hget(&self.status_key, nfcid)
            .await
            .map_err(StoreError::backend)?;

        raw.map(|raw| decode_status(nfcid, &raw)).transpose()
    }

    async fn set_status(
        &self,
        nfcid: &str,
        status: Status,
        datetime: DateTime<Utc>,
        ip: &str,
    ) -> Result<(), StoreError> {
        let entry = serde_json::to_string(&StoredStatus {
            status: status.to_string(),
            datetime,
            ip: ip.to_string(),
        })
        .map_err(StoreError::backend)?;

        let _: () = self
            .connection()
            .hset(&self.status_key, nfcid, entry)
            .await
            .map_err(StoreError::backend)?;

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

        let entry = serde_json::to_string(&VisitRecord {
            nfcid: nfcid.to_string(),
            duration_secs,
            ip: ip.map(str::to_string),
            datetime,
        })
        .map_err(StoreError::backend)?;

        let inserted: bool = self
            .connection()
            .hset_nx(&self.visit_key, visit_key(nfcid), entry)
            .await
            .map_err(StoreError::backend)?;

        if !inserted {
            return Err(StoreError::Validation(format!(
                "visit key collision for {nfcid}"
            )));
        }

        Ok(())
    }

    async fn list_latest_status_per_id(&self) -> Result<Vec<StatusRecord>, StoreError> {
        let entries: HashMap<String, String> = self
            .connection()
            .hgetall(&self.status_key)
            .await
            .map_err(StoreError::backend)?;

        let mut records = skip_corrupted(
            entries
                .iter()
                .map(|(nfcid, raw)| decode_status(nfcid, raw)),
        );
        records.sort_by(|a, b| a.nfcid.cmp(&b.nfcid));

        Ok(records)
    }

    async fn list_visits(&self, nfcid: &str) -> Result<Vec<VisitRecord>, StoreError> {
        let entries: HashMap<String, String> = self
            .connection()
            .hgetall(&self.visit_key)
            .await
            .map_err(StoreError::backend)?;

        let mut visits = Vec::new();
        for (key, raw) in entries {
            // Ids may themselves contain '-', so match on the decoded record.
            if !key.starts_with(nfcid) {
                continue;
            }

            let visit: VisitRecord = serde_json::from_str(&raw)
                .map_err(|e| StoreError::corrupted(nfcid, format!("unreadable visit {key}: {e}")))?;
            if visit.nfcid == nfcid {
                visits.push(visit);
            }
        }
        visits.sort_by_key(|visit| visit.datetime);

        Ok(visits)
    }

    async fn drop_all(&self) -> Result<(), StoreError> {
        warn!("Dropping table {}", self.created_key);

        let _: () = self
            .connection()
            .del(vec![
                self.status_key.as_str(),
                self.visit_key.as_str(),
                self.created_key.as_str(),
            ])
            .await
            .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn close(&self) {
        // ConnectionManager closes when the last clone is dropped.
    }
}
