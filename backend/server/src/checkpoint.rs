//! # Checkpoint
//!
//! The toggle behind every scan.
//!
//! ## States
//!
//! Per identifier: `Unknown -> Entering -> Exiting -> Entering -> ...`
//!
//! - No stored status (never seen) or `exiting` flips to `entering`
//! - `entering` flips to `exiting`, and only that flip produces a visit
//! - Anything else in the store is corruption and fails the scan
//!
//! ## Order of a scan
//!
//! 1. Read the last status
//! 2. Work out the next one
//! 3. When exiting, compute `now - entered_at`. Negative means a skewed clock or a bad
//!    timestamp; the scan fails before anything is written
//! 4. Write the new status
//! 5. When exiting, append the visit
//!
//! No retries. A store failure anywhere aborts the scan and is reported to the caller.
//!
//! ## Concurrency
//!
//! Scans of the same identifier are serialized inside this process by [`IdLocks`].
//! Two processes sharing one backend can still interleave a read and a write for the
//! same badge; the store's last write wins.
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info};

use crate::store::{Status, StatusStore, StoreError};

pub const WELCOME: &str = "enjoy your stay!";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Error, Debug)]
pub enum ToggleError {
    #[error(transparent)]
    Store(StoreError),

    #[error("Stored state for {nfcid} is invalid: {reason}")]
    Invariant { nfcid: String, reason: String },

    #[error("Negative stay for {nfcid}: entered {entered_at}, now {now}")]
    NegativeDuration {
        nfcid: String,
        entered_at: DateTime<Utc>,
        now: DateTime<Utc>,
    },
}

impl From<StoreError> for ToggleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corrupted { nfcid, reason } => ToggleError::Invariant { nfcid, reason },
            other => ToggleError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Entered,
    Exited { stay: TimeDelta },
}

impl Outcome {
    pub fn status(&self) -> Status {
        match self {
            Outcome::Entered => Status::Entering,
            Outcome::Exited { .. } => Status::Exiting,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Outcome::Entered => WELCOME.to_string(),
            Outcome::Exited { stay } => {
                let (minutes, seconds) = minutes_and_seconds(*stay);
                format!("you stayed for {minutes} minutes and {seconds} seconds. Thanks for visiting!")
            }
        }
    }
}

/// Whole minutes and the leftover whole seconds. Sub-second parts are truncated.
pub fn minutes_and_seconds(stay: TimeDelta) -> (i64, i64) {
    let total = stay.num_seconds();
    (total / 60, total % 60)
}

fn total_seconds(stay: TimeDelta) -> f64 {
    stay.num_seconds() as f64 + f64::from(stay.subsec_nanos()) / 1e9
}

pub fn next_status(previous: Option<Status>) -> Status {
    match previous {
        None | Some(Status::Exiting) => Status::Entering,
        Some(Status::Entering) => Status::Exiting,
    }
}

/// Async locks keyed by identifier. An entry lives only while someone holds or waits on it.
#[derive(Default, Clone)]
pub struct IdLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

pub struct IdGuard {
    guard: Option<OwnedMutexGuard<()>>,
    nfcid: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl IdLocks {
    pub async fn lock(&self, nfcid: &str) -> IdGuard {
        let mutex = self
            .locks
            .entry(nfcid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        IdGuard {
            guard: Some(mutex.lock_owned().await),
            nfcid: nfcid.to_string(),
            locks: self.locks.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for IdGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        // The map holds one reference; anything above that is a waiter.
        self.locks
            .remove_if(&self.nfcid, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

pub struct Checkpoint {
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    locks: IdLocks,
}

impl Checkpoint {
    pub fn new(store: Arc<dyn StatusStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            locks: IdLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    pub async fn toggle(&self, nfcid: &str, ip: &str) -> Result<Outcome, ToggleError> {
        let _guard = self.locks.lock(nfcid).await;

        let now = self.clock.now();
        let previous = self.store.get_status(nfcid).await?;

        match &previous {
            None => info!("First time I see NFC ID {nfcid}"),
            Some(record) => info!("Last status of NFC ID {nfcid}: {}", record.status),
        }

        let status = next_status(previous.as_ref().map(|record| record.status));
        info!("Processing request from {ip} for NFC-ID {nfcid}, which is {status}");

        let outcome = match (status, &previous) {
            (Status::Exiting, Some(record)) => {
                let stay = now - record.datetime;
                if stay < TimeDelta::zero() {
                    error!("Negative stay for {nfcid}: entered {}, now {now}", record.datetime);
                    return Err(ToggleError::NegativeDuration {
                        nfcid: nfcid.to_string(),
                        entered_at: record.datetime,
                        now,
                    });
                }

                info!("Length of stay: {now} - {}", record.datetime);
                Outcome::Exited { stay }
            }
            _ => Outcome::Entered,
        };

        self.store.set_status(nfcid, status, now, ip).await?;

        if let Outcome::Exited { stay } = outcome {
            self.store
                .record_visit(nfcid, total_seconds(stay), Some(ip), now)
                .await?;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;

    use chrono::TimeZone;

    use super::*;
    use crate::memory::MemoryStore;

    /// Clock that only moves when told to.
    pub struct ManualClock(StdMutex<DateTime<Utc>>);

    impl ManualClock {
        pub fn at(now: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(StdMutex::new(now)))
        }

        pub fn set(&self, now: DateTime<Utc>) {
            *self.0.lock().unwrap() = now;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 5, 14, h, m, s).unwrap()
    }

    fn checkpoint() -> (Checkpoint, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::at(at(10, 0, 0));

        (Checkpoint::new(store.clone(), clock.clone()), store, clock)
    }

    #[tokio::test]
    async fn test_first_sighting_enters_without_visit() {
        let (checkpoint, store, _) = checkpoint();

        let outcome = checkpoint.toggle("abc", "10.0.0.1").await.unwrap();

        assert_eq!(outcome, Outcome::Entered);
        assert_eq!(outcome.message(), "enjoy your stay!");
        assert_eq!(store.visit_count(), 0);
        assert_eq!(
            store.get_status("abc").await.unwrap().unwrap().status,
            Status::Entering
        );
    }

    #[tokio::test]
    async fn test_toggles_alternate_and_exits_record_visits() {
        let (checkpoint, store, clock) = checkpoint();
        let mut seen = Vec::new();

        for step in 0..6 {
            clock.set(at(10, step, 0));
            seen.push(checkpoint.toggle("abc", "10.0.0.1").await.unwrap().status());
        }

        assert_eq!(
            seen,
            vec![
                Status::Entering,
                Status::Exiting,
                Status::Entering,
                Status::Exiting,
                Status::Entering,
                Status::Exiting,
            ]
        );
        assert_eq!(store.visit_count(), 3);

        let visits = store.list_visits("abc").await.unwrap();
        assert!(visits.iter().all(|visit| visit.duration_secs == 60.0));
        assert!(visits.iter().all(|visit| visit.ip.as_deref() == Some("10.0.0.1")));
    }

    #[tokio::test]
    async fn test_stay_is_reported_in_minutes_and_seconds() {
        let (checkpoint, store, clock) = checkpoint();

        checkpoint.toggle("abc", "10.0.0.1").await.unwrap();
        clock.set(at(10, 2, 30));
        let outcome = checkpoint.toggle("abc", "10.0.0.1").await.unwrap();

        assert_eq!(
            outcome.message(),
            "you stayed for 2 minutes and 30 seconds. Thanks for visiting!"
        );

        let visits = store.list_visits("abc").await.unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].duration_secs, 150.0);
        assert_eq!(visits[0].datetime, at(10, 2, 30));
    }

    #[test]
    fn test_minutes_and_seconds_truncate() {
        let stay = TimeDelta::milliseconds(119_999);

        assert_eq!(minutes_and_seconds(stay), (1, 59));
        assert_eq!(minutes_and_seconds(TimeDelta::zero()), (0, 0));
        assert_eq!(total_seconds(TimeDelta::milliseconds(1_500)), 1.5);
    }

    #[tokio::test]
    async fn test_corrupted_status_fails_loudly() {
        let (checkpoint, store, _) = checkpoint();
        store.insert_raw("abc", "wandering", at(9, 0, 0));

        let err = checkpoint.toggle("abc", "10.0.0.1").await.unwrap_err();

        assert!(matches!(err, ToggleError::Invariant { ref nfcid, .. } if nfcid == "abc"));
        assert_eq!(store.visit_count(), 0);
    }

    #[tokio::test]
    async fn test_negative_stay_is_an_error_and_writes_nothing() {
        let (checkpoint, store, clock) = checkpoint();

        checkpoint.toggle("abc", "10.0.0.1").await.unwrap();
        clock.set(at(9, 0, 0));
        let err = checkpoint.toggle("abc", "10.0.0.1").await.unwrap_err();

        assert!(matches!(err, ToggleError::NegativeDuration { .. }));
        assert_eq!(
            store.get_status("abc").await.unwrap().unwrap().status,
            Status::Entering
        );
        assert_eq!(store.visit_count(), 0);
    }

    #[tokio::test]
    async fn test_distinct_ids_do_not_interfere() {
        let (checkpoint, store, _) = checkpoint();
        let checkpoint = Arc::new(checkpoint);

        let mut handles = Vec::new();
        for n in 0..16 {
            let checkpoint = checkpoint.clone();
            handles.push(tokio::spawn(async move {
                let nfcid = format!("badge-{n}");
                let first = checkpoint.toggle(&nfcid, "10.0.0.1").await.unwrap();
                let second = checkpoint.toggle(&nfcid, "10.0.0.1").await.unwrap();
                (first.status(), second.status())
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), (Status::Entering, Status::Exiting));
        }
        assert_eq!(store.visit_count(), 16);
        assert_eq!(store.list_latest_status_per_id().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_same_id_scans_are_serialized() {
        let (checkpoint, store, _) = checkpoint();
        let checkpoint = Arc::new(checkpoint);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let checkpoint = checkpoint.clone();
                tokio::spawn(async move { checkpoint.toggle("abc", "10.0.0.1").await.unwrap() })
            })
            .collect();

        let mut exits = 0;
        for handle in handles {
            if let Outcome::Exited { .. } = handle.await.unwrap() {
                exits += 1;
            }
        }

        assert_eq!(exits, 4);
        assert_eq!(store.visit_count(), 4);
        assert!(checkpoint.locks.is_empty());
    }
}
