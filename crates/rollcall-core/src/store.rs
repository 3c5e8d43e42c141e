//! Storage interfaces for identities, templates and attendance records.
//!
//! Implementations return owned copies, so whatever a caller reads is a
//! consistent snapshot for the rest of its computation regardless of
//! concurrent enrollment.

use crate::types::{
    gallery_of, AttendanceRecord, Descriptor, Identity, IdentityId, NewIdentity, Template,
};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_RECORD_LIMIT: usize = 10;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity not found: {0}")]
    IdentityNotFound(IdentityId),
    #[error("roll number {0} is already registered")]
    DuplicateRollNumber(u32),
    #[error("token is already assigned to another identity")]
    DuplicateToken,
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Read and append access to the identity set.
pub trait IdentityStore {
    /// All identities of a cohort, ordered by roll number.
    fn roster(&self, cohort: &str) -> Result<Vec<Identity>, StoreError>;

    /// Snapshot of every enrolled template in a cohort.
    fn gallery(&self, cohort: &str) -> Result<Vec<Template>, StoreError> {
        Ok(gallery_of(&self.roster(cohort)?))
    }

    fn identity(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError>;

    /// Exact-match lookup of a scan token.
    fn find_by_token(&self, token: &str) -> Result<Option<Identity>, StoreError>;

    fn insert_identity(&mut self, new: NewIdentity) -> Result<Identity, StoreError>;

    /// Append a descriptor, returning how many the identity now has.
    fn append_descriptor(
        &mut self,
        id: &IdentityId,
        descriptor: Descriptor,
    ) -> Result<usize, StoreError>;

    /// Set or replace the identity's token.
    fn assign_token(&mut self, id: &IdentityId, token: &str) -> Result<(), StoreError>;
}

/// Append-only attendance record storage.
pub trait RecordStore {
    /// Persist a record in a single all-or-nothing write.
    fn append_record(&mut self, record: &AttendanceRecord) -> Result<(), StoreError>;

    /// Records matching `query`, newest first.
    fn records(&self, query: &RecordQuery) -> Result<Vec<AttendanceRecord>, StoreError>;
}

/// Filter for reading back attendance records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordQuery {
    #[serde(default)]
    pub cohort: Option<String>,
    /// Calendar day (UTC) the records were committed on.
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_RECORD_LIMIT
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            cohort: None,
            date: None,
            limit: DEFAULT_RECORD_LIMIT,
        }
    }
}

impl RecordQuery {
    /// Half-open UTC interval `[start, end)` covering `date`, if one is set.
    pub fn day_bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self.date?.and_time(NaiveTime::MIN).and_utc();
        let end = start
            .checked_add_signed(Duration::days(1))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some((start, end))
    }

    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        if let Some(cohort) = &self.cohort {
            if &record.cohort != cohort {
                return false;
            }
        }
        match self.day_bounds() {
            Some((start, end)) => record.recorded_at >= start && record.recorded_at < end,
            None => true,
        }
    }
}

/// In-process store for both identities and records.
#[derive(Debug, Default)]
pub struct MemoryStore {
    identities: Vec<Identity>,
    records: Vec<AttendanceRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_mut(&mut self, id: &IdentityId) -> Result<&mut Identity, StoreError> {
        self.identities
            .iter_mut()
            .find(|i| &i.id == id)
            .ok_or_else(|| StoreError::IdentityNotFound(id.clone()))
    }
}

impl IdentityStore for MemoryStore {
    fn roster(&self, cohort: &str) -> Result<Vec<Identity>, StoreError> {
        let mut roster: Vec<Identity> = self
            .identities
            .iter()
            .filter(|i| i.cohort == cohort)
            .cloned()
            .collect();
        roster.sort_by_key(|i| i.roll_number);
        Ok(roster)
    }

    fn identity(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError> {
        Ok(self.identities.iter().find(|i| &i.id == id).cloned())
    }

    fn find_by_token(&self, token: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .identities
            .iter()
            .find(|i| i.token.as_deref() == Some(token))
            .cloned())
    }

    fn insert_identity(&mut self, new: NewIdentity) -> Result<Identity, StoreError> {
        if self.identities.iter().any(|i| i.roll_number == new.roll_number) {
            return Err(StoreError::DuplicateRollNumber(new.roll_number));
        }
        let identity = Identity {
            id: IdentityId::generate(),
            name: new.name,
            roll_number: new.roll_number,
            cohort: new.cohort,
            descriptors: Vec::new(),
            token: None,
        };
        self.identities.push(identity.clone());
        Ok(identity)
    }

    fn append_descriptor(
        &mut self,
        id: &IdentityId,
        descriptor: Descriptor,
    ) -> Result<usize, StoreError> {
        let identity = self.find_mut(id)?;
        identity.descriptors.push(descriptor);
        Ok(identity.descriptors.len())
    }

    fn assign_token(&mut self, id: &IdentityId, token: &str) -> Result<(), StoreError> {
        let taken = self
            .identities
            .iter()
            .any(|i| &i.id != id && i.token.as_deref() == Some(token));
        if taken {
            return Err(StoreError::DuplicateToken);
        }
        self.find_mut(id)?.token = Some(token.to_string());
        Ok(())
    }
}

impl RecordStore for MemoryStore {
    fn append_record(&mut self, record: &AttendanceRecord) -> Result<(), StoreError> {
        self.records.push(record.clone());
        Ok(())
    }

    fn records(&self, query: &RecordQuery) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut found: Vec<AttendanceRecord> = self
            .records
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        found.truncate(query.limit);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Method, RecordId};
    use chrono::TimeZone;

    fn new_identity(name: &str, cohort: &str, roll: u32) -> NewIdentity {
        NewIdentity {
            name: name.into(),
            cohort: cohort.into(),
            roll_number: roll,
        }
    }

    fn record_at(cohort: &str, at: DateTime<Utc>) -> AttendanceRecord {
        AttendanceRecord {
            id: RecordId::generate(),
            cohort: cohort.into(),
            subject: "Math".into(),
            recorded_at: at,
            method: Method::Manual,
            present: Default::default(),
            absent: Default::default(),
            recorded_by: "system".into(),
        }
    }

    #[test]
    fn test_roster_filters_and_orders_by_roll() {
        let mut store = MemoryStore::new();
        store.insert_identity(new_identity("Cleo", "C1", 3)).unwrap();
        store.insert_identity(new_identity("Ada", "C1", 1)).unwrap();
        store.insert_identity(new_identity("Bo", "C2", 2)).unwrap();

        let roster = store.roster("C1").unwrap();
        let names: Vec<&str> = roster.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Ada", "Cleo"]);
        assert!(store.roster("C9").unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_roll_number_rejected() {
        let mut store = MemoryStore::new();
        store.insert_identity(new_identity("Ada", "C1", 1)).unwrap();
        let err = store.insert_identity(new_identity("Bo", "C2", 1)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRollNumber(1)));
    }

    #[test]
    fn test_append_descriptor_counts() {
        let mut store = MemoryStore::new();
        let ada = store.insert_identity(new_identity("Ada", "C1", 1)).unwrap();
        assert_eq!(store.append_descriptor(&ada.id, vec![1.0].into()).unwrap(), 1);
        assert_eq!(store.append_descriptor(&ada.id, vec![2.0].into()).unwrap(), 2);
        assert_eq!(store.gallery("C1").unwrap().len(), 2);

        let missing = store.append_descriptor(&"nobody".into(), vec![1.0].into());
        assert!(matches!(missing, Err(StoreError::IdentityNotFound(_))));
    }

    #[test]
    fn test_token_uniqueness() {
        let mut store = MemoryStore::new();
        let ada = store.insert_identity(new_identity("Ada", "C1", 1)).unwrap();
        let bo = store.insert_identity(new_identity("Bo", "C1", 2)).unwrap();

        store.assign_token(&ada.id, "QR_A").unwrap();
        // Reassigning the same token to its owner is fine.
        store.assign_token(&ada.id, "QR_A").unwrap();
        assert!(matches!(
            store.assign_token(&bo.id, "QR_A"),
            Err(StoreError::DuplicateToken)
        ));

        let found = store.find_by_token("QR_A").unwrap().unwrap();
        assert_eq!(found.id, ada.id);
        assert!(store.find_by_token("QR_B").unwrap().is_none());
    }

    #[test]
    fn test_records_newest_first_with_limit() {
        let mut store = MemoryStore::new();
        for hour in [8, 10, 9] {
            let at = Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap();
            store.append_record(&record_at("C1", at)).unwrap();
        }
        let query = RecordQuery {
            limit: 2,
            ..Default::default()
        };
        let found = store.records(&query).unwrap();
        let hours: Vec<u32> = found
            .iter()
            .map(|r| chrono::Timelike::hour(&r.recorded_at))
            .collect();
        assert_eq!(hours, vec![10, 9]);
    }

    #[test]
    fn test_records_filter_by_cohort_and_day() {
        let mut store = MemoryStore::new();
        let monday = Utc.with_ymd_and_hms(2026, 3, 2, 23, 59, 59).unwrap();
        let tuesday = Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap();
        store.append_record(&record_at("C1", monday)).unwrap();
        store.append_record(&record_at("C1", tuesday)).unwrap();
        store.append_record(&record_at("C2", monday)).unwrap();

        let query = RecordQuery {
            cohort: Some("C1".into()),
            date: NaiveDate::from_ymd_opt(2026, 3, 2),
            limit: 10,
        };
        let found = store.records(&query).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].recorded_at, monday);
    }

    #[test]
    fn test_query_defaults_from_json() {
        let query: RecordQuery = serde_json::from_str(r#"{"cohort":"C1"}"#).unwrap();
        assert_eq!(query.limit, 10);
        assert!(query.date.is_none());
    }
}
