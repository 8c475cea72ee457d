use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::store::{
    Status, StatusRecord, StatusStore, StoreError, VisitRecord, check_duration,
    parse_stored_status, skip_corrupted, visit_key,
};

/// Process local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    statuses: DashMap<String, (String, DateTime<Utc>)>,
    visits: DashMap<String, VisitRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a status string as is, bypassing [`Status`].
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, nfcid: &str, status: &str, datetime: DateTime<Utc>) {
        self.statuses
            .insert(nfcid.to_string(), (status.to_string(), datetime));
    }

    #[cfg(test)]
    pub(crate) fn visit_count(&self) -> usize {
        self.visits.len()
    }

    #[cfg(test)]
    pub(crate) fn status_count(&self) -> usize {
        self.statuses.len()
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn provision(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_status(&self, nfcid: &str) -> Result<Option<StatusRecord>, StoreError> {
        let Some(entry) = self.statuses.get(nfcid) else {
            return Ok(None);
        };
        let (status, datetime) = entry.value();

        Ok(Some(StatusRecord {
            nfcid: nfcid.to_string(),
            status: parse_stored_status(nfcid, status)?,
            datetime: *datetime,
        }))
    }

    async fn set_status(
        &self,
        nfcid: &str,
        status: Status,
        datetime: DateTime<Utc>,
        _ip: &str,
    ) -> Result<(), StoreError> {
        self.statuses
            .insert(nfcid.to_string(), (status.to_string(), datetime));

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

        self.visits.insert(
            visit_key(nfcid),
            VisitRecord {
                nfcid: nfcid.to_string(),
                duration_secs,
                ip: ip.map(str::to_string),
                datetime,
            },
        );

        Ok(())
    }

    async fn list_latest_status_per_id(&self) -> Result<Vec<StatusRecord>, StoreError> {
        let mut records = skip_corrupted(self.statuses.iter().map(|entry| {
            let (status, datetime) = entry.value();

            Ok(StatusRecord {
                nfcid: entry.key().clone(),
                status: parse_stored_status(entry.key(), status)?,
                datetime: *datetime,
            })
        }));
        records.sort_by(|a, b| a.nfcid.cmp(&b.nfcid));

        Ok(records)
    }

    async fn list_visits(&self, nfcid: &str) -> Result<Vec<VisitRecord>, StoreError> {
        let mut visits: Vec<VisitRecord> = self
            .visits
            .iter()
            .filter(|entry| entry.value().nfcid == nfcid)
            .map(|entry| entry.value().clone())
            .collect();
        visits.sort_by_key(|visit| visit.datetime);

        Ok(visits)
    }

    async fn drop_all(&self) -> Result<(), StoreError> {
        self.statuses.clear();
        self.visits.clear();

        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2019, 5, 14, 10, 0, 0).unwrap();

        assert_eq!(store.get_status("a").await.unwrap(), None);

        store
            .set_status("a", Status::Entering, now, "10.0.0.1")
            .await
            .unwrap();
        store
            .set_status("a", Status::Entering, now, "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(store.status_count(), 1);

        store.record_visit("a", 5.0, None, now).await.unwrap();
        store.record_visit("a", 5.0, None, now).await.unwrap();
        assert_eq!(store.list_visits("a").await.unwrap().len(), 2);
        assert!(store.list_visits("b").await.unwrap().is_empty());

        assert!(matches!(
            store.record_visit("a", -1.0, None, now).await,
            Err(StoreError::Validation(_))
        ));
    }
}
