// Cache candidate and backing store interfaces, plus the status snapshot

use crate::errors::{CacheUpdateError, StoreError};
use chrono::{DateTime, NaiveTime, Utc};
use serde::Serialize;

/// Handle to the backing data store.
///
/// The scheduler passes it through to candidates untouched. It only uses the
/// identity to name the lock file and `probe` to detect a store that cannot
/// serve a refresh pass at all.
pub trait DataStore: Send + Sync {
    /// Stable identity shared by every process using this store
    fn identity(&self) -> String;

    /// Check the store can serve a refresh pass
    fn probe(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// One refreshable metadata cache.
///
/// `update_from_store` runs on a blocking worker thread and may take a long
/// time; `cancel_in_flight_update` is called from another thread and should
/// make a running update return early.
pub trait CacheCandidate: Send + Sync {
    /// Identity of the candidate, its implementation type by default
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn update_from_store(&self, store: &dyn DataStore) -> Result<(), CacheUpdateError>;

    fn cancel_in_flight_update(&self);

    /// Set by the candidate itself after a successful refresh
    fn last_updated_at(&self) -> Option<DateTime<Utc>>;
}

/// Per-candidate freshness for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateStatus {
    pub name: String,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl CandidateStatus {
    pub fn of(candidate: &dyn CacheCandidate) -> Self {
        Self {
            name: candidate.name().to_string(),
            last_updated_at: candidate.last_updated_at(),
        }
    }
}

/// Read-only status exposed to the request-handling layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub update_on_startup: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_update_time: Option<NaiveTime>,
    pub lock_held: bool,
    pub in_flight_updates: usize,
    pub candidates: Vec<CandidateStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticCandidate;

    impl CacheCandidate for StaticCandidate {
        fn update_from_store(&self, _store: &dyn DataStore) -> Result<(), CacheUpdateError> {
            Ok(())
        }

        fn cancel_in_flight_update(&self) {}

        fn last_updated_at(&self) -> Option<DateTime<Utc>> {
            None
        }
    }

    #[test]
    fn test_default_name_is_type_name() {
        let candidate: &dyn CacheCandidate = &StaticCandidate;
        assert!(candidate.name().ends_with("StaticCandidate"));
    }

    #[test]
    fn test_status_serialization() {
        let status = CacheStatus {
            update_on_startup: true,
            daily_update_time: NaiveTime::from_hms_opt(4, 0, 0),
            lock_held: false,
            in_flight_updates: 0,
            candidates: vec![CandidateStatus::of(&StaticCandidate)],
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["update_on_startup"], true);
        assert_eq!(json["daily_update_time"], "04:00:00");
        assert!(json["candidates"][0]["last_updated_at"].is_null());
    }
}
