//! SQLite-backed identity and attendance record store.

use crate::codec::{self, CodecError};
use rollcall_core::{
    AttendanceRecord, Descriptor, Identity, IdentityId, IdentityStore, Method, NewIdentity,
    RecordId, RecordQuery, RecordStore, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS identities (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    cohort      TEXT NOT NULL,
    roll_number INTEGER NOT NULL UNIQUE,
    token       TEXT UNIQUE,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_identities_cohort ON identities(cohort, roll_number);

CREATE TABLE IF NOT EXISTS descriptors (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id TEXT NOT NULL REFERENCES identities(id),
    dim         INTEGER NOT NULL,
    data        BLOB NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_descriptors_identity ON descriptors(identity_id);

CREATE TABLE IF NOT EXISTS attendance_records (
    id          TEXT PRIMARY KEY,
    cohort      TEXT NOT NULL,
    subject     TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    method      TEXT NOT NULL,
    recorded_by TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_records_cohort_time ON attendance_records(cohort, recorded_at);

CREATE TABLE IF NOT EXISTS attendance_entries (
    record_id   TEXT NOT NULL REFERENCES attendance_records(id),
    identity_id TEXT NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('present', 'absent')),
    PRIMARY KEY (record_id, identity_id)
);
";

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid database value: {0}")]
    InvalidDbValue(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SqliteStoreError> for StoreError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::Store(inner) => inner,
            other => StoreError::Backend(other.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, SqliteStoreError>;

/// Row counts reported by [`SqliteStore::counts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCounts {
    pub identities: u64,
    pub descriptors: u64,
    pub records: u64,
}

/// Persistent store for identities, descriptors and attendance records.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Self::init(conn)
    }

    /// Private, non-persistent store; used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let count = |table: &str| -> Result<u64> {
            let n: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            i64_to_u64(n, table)
        };
        Ok(StoreCounts {
            identities: count("identities")?,
            descriptors: count("descriptors")?,
            records: count("attendance_records")?,
        })
    }

    fn load_identities(&self, sql: &str, param: &str) -> Result<Vec<Identity>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([param], decode_identity_row)?;
        let mut identities = Vec::new();
        for row in rows {
            let (mut identity, roll) = row?;
            identity.roll_number = u32::try_from(roll)
                .map_err(|_| SqliteStoreError::InvalidDbValue(format!("roll number {roll}")))?;
            identity.descriptors = self.load_descriptors(&identity.id)?;
            identities.push(identity);
        }
        Ok(identities)
    }

    fn load_descriptors(&self, id: &IdentityId) -> Result<Vec<Descriptor>> {
        let mut stmt = self
            .conn
            .prepare("SELECT dim, data FROM descriptors WHERE identity_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map([id.as_str()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut descriptors = Vec::new();
        for row in rows {
            let (dim, blob) = row?;
            let dim = usize::try_from(dim)
                .map_err(|_| SqliteStoreError::InvalidDbValue(format!("descriptor dim {dim}")))?;
            descriptors.push(codec::decode_descriptor(&blob, dim)?);
        }
        Ok(descriptors)
    }

    fn one_identity(&self, sql: &str, param: &str) -> Result<Option<Identity>> {
        Ok(self.load_identities(sql, param)?.into_iter().next())
    }

    fn exists(&self, id: &IdentityId) -> Result<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM identities WHERE id = ?1", [id.as_str()], |_| Ok(()))
            .optional()?
            .is_some())
    }

    fn roster_snapshot(&self, cohort: &str) -> Result<Vec<Identity>> {
        // One read transaction so identities and descriptors agree.
        let tx = self.conn.unchecked_transaction()?;
        let roster = self.load_identities(
            "SELECT id, name, cohort, roll_number, token FROM identities
             WHERE cohort = ?1 ORDER BY roll_number",
            cohort,
        )?;
        tx.commit()?;
        Ok(roster)
    }

    fn insert_identity_inner(&mut self, new: NewIdentity) -> Result<Identity> {
        let tx = self.conn.transaction()?;
        let taken = tx
            .query_row(
                "SELECT 1 FROM identities WHERE roll_number = ?1",
                [new.roll_number],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if taken {
            return Err(StoreError::DuplicateRollNumber(new.roll_number).into());
        }

        let id = IdentityId::generate();
        tx.execute(
            "INSERT INTO identities (id, name, cohort, roll_number, token, created_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
            params![
                id.as_str(),
                new.name,
                new.cohort,
                new.roll_number,
                codec::encode_timestamp(&chrono::Utc::now())
            ],
        )?;
        tx.commit()?;

        Ok(Identity {
            id,
            name: new.name,
            roll_number: new.roll_number,
            cohort: new.cohort,
            descriptors: Vec::new(),
            token: None,
        })
    }

    fn append_descriptor_inner(
        &mut self,
        id: &IdentityId,
        descriptor: &Descriptor,
    ) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let found = tx
            .query_row("SELECT 1 FROM identities WHERE id = ?1", [id.as_str()], |_| Ok(()))
            .optional()?
            .is_some();
        if !found {
            return Err(StoreError::IdentityNotFound(id.clone()).into());
        }
        tx.execute(
            "INSERT INTO descriptors (identity_id, dim, data, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                id.as_str(),
                usize_to_i64(descriptor.len(), "descriptor dim")?,
                codec::encode_descriptor(descriptor),
                codec::encode_timestamp(&chrono::Utc::now())
            ],
        )?;
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM descriptors WHERE identity_id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        usize::try_from(count)
            .map_err(|_| SqliteStoreError::InvalidDbValue(format!("count {count}")))
    }

    fn assign_token_inner(&mut self, id: &IdentityId, token: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        let owner: Option<String> = tx
            .query_row("SELECT id FROM identities WHERE token = ?1", [token], |row| row.get(0))
            .optional()?;
        if owner.as_deref().is_some_and(|owner| owner != id.as_str()) {
            return Err(StoreError::DuplicateToken.into());
        }
        let updated = tx.execute(
            "UPDATE identities SET token = ?2 WHERE id = ?1",
            params![id.as_str(), token],
        )?;
        if updated == 0 {
            return Err(StoreError::IdentityNotFound(id.clone()).into());
        }
        tx.commit()?;
        Ok(())
    }

    fn append_record_inner(&mut self, record: &AttendanceRecord) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO attendance_records (id, cohort, subject, recorded_at, method, recorded_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.to_string(),
                record.cohort,
                record.subject,
                codec::encode_timestamp(&record.recorded_at),
                record.method.as_str(),
                record.recorded_by
            ],
        )?;
        {
            let mut entry = tx.prepare(
                "INSERT INTO attendance_entries (record_id, identity_id, status) VALUES (?1, ?2, ?3)",
            )?;
            let record_id = record.id.to_string();
            for id in &record.present {
                entry.execute(params![record_id, id.as_str(), "present"])?;
            }
            for id in &record.absent {
                entry.execute(params![record_id, id.as_str(), "absent"])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn records_inner(&self, query: &RecordQuery) -> Result<Vec<AttendanceRecord>> {
        let bounds = query.day_bounds();
        let start = bounds.map(|(start, _)| codec::encode_timestamp(&start));
        let end = bounds.map(|(_, end)| codec::encode_timestamp(&end));

        let tx = self.conn.unchecked_transaction()?;
        let headers = {
            let mut stmt = tx.prepare(
                "SELECT id, cohort, subject, recorded_at, method, recorded_by
                 FROM attendance_records
                 WHERE (?1 IS NULL OR cohort = ?1)
                   AND (?2 IS NULL OR recorded_at >= ?2)
                   AND (?3 IS NULL OR recorded_at < ?3)
                 ORDER BY recorded_at DESC, rowid DESC
                 LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![query.cohort, start, end, usize_to_i64(query.limit, "limit")?],
                |row| {
                    Ok(RecordHeader {
                        id: row.get(0)?,
                        cohort: row.get(1)?,
                        subject: row.get(2)?,
                        recorded_at: row.get(3)?,
                        method: row.get(4)?,
                        recorded_by: row.get(5)?,
                    })
                },
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut records = Vec::with_capacity(headers.len());
        {
            let mut entries = tx.prepare(
                "SELECT identity_id, status FROM attendance_entries WHERE record_id = ?1",
            )?;
            for header in headers {
                let rows = entries
                    .query_map([header.id.as_str()], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut present = BTreeSet::new();
                let mut absent = BTreeSet::new();
                for (identity, status) in rows {
                    match status.as_str() {
                        "present" => present.insert(IdentityId::new(identity)),
                        "absent" => absent.insert(IdentityId::new(identity)),
                        other => {
                            return Err(SqliteStoreError::InvalidDbValue(format!(
                                "attendance status {other}"
                            )))
                        }
                    };
                }
                records.push(header.into_record(present, absent)?);
            }
        }
        tx.commit()?;
        Ok(records)
    }
}

struct RecordHeader {
    id: String,
    cohort: String,
    subject: String,
    recorded_at: String,
    method: String,
    recorded_by: String,
}

impl RecordHeader {
    fn into_record(
        self,
        present: BTreeSet<IdentityId>,
        absent: BTreeSet<IdentityId>,
    ) -> Result<AttendanceRecord> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| SqliteStoreError::InvalidDbValue(format!("record id {}: {e}", self.id)))?;
        let method: Method = self.method.parse().map_err(SqliteStoreError::InvalidDbValue)?;
        Ok(AttendanceRecord {
            id: RecordId::from_uuid(id),
            cohort: self.cohort,
            subject: self.subject,
            recorded_at: codec::decode_timestamp(&self.recorded_at)?,
            method,
            present,
            absent,
            recorded_by: self.recorded_by,
        })
    }
}

/// Decode the identity columns; roll number is range-checked by the caller.
fn decode_identity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Identity, i64)> {
    let identity = Identity {
        id: IdentityId::new(row.get::<_, String>(0)?),
        name: row.get(1)?,
        cohort: row.get(2)?,
        roll_number: 0,
        descriptors: Vec::new(),
        token: row.get(4)?,
    };
    Ok((identity, row.get(3)?))
}

fn usize_to_i64(value: usize, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| SqliteStoreError::InvalidDbValue(format!("{field} overflow")))
}

fn i64_to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| SqliteStoreError::InvalidDbValue(format!("{field}: {value}")))
}

impl IdentityStore for SqliteStore {
    fn roster(&self, cohort: &str) -> std::result::Result<Vec<Identity>, StoreError> {
        Ok(self.roster_snapshot(cohort)?)
    }

    fn identity(&self, id: &IdentityId) -> std::result::Result<Option<Identity>, StoreError> {
        Ok(self.one_identity(
            "SELECT id, name, cohort, roll_number, token FROM identities WHERE id = ?1",
            id.as_str(),
        )?)
    }

    fn find_by_token(&self, token: &str) -> std::result::Result<Option<Identity>, StoreError> {
        Ok(self.one_identity(
            "SELECT id, name, cohort, roll_number, token FROM identities WHERE token = ?1",
            token,
        )?)
    }

    fn insert_identity(&mut self, new: NewIdentity) -> std::result::Result<Identity, StoreError> {
        Ok(self.insert_identity_inner(new)?)
    }

    fn append_descriptor(
        &mut self,
        id: &IdentityId,
        descriptor: Descriptor,
    ) -> std::result::Result<usize, StoreError> {
        Ok(self.append_descriptor_inner(id, &descriptor)?)
    }

    fn assign_token(
        &mut self,
        id: &IdentityId,
        token: &str,
    ) -> std::result::Result<(), StoreError> {
        if !self.exists(id)? {
            return Err(StoreError::IdentityNotFound(id.clone()));
        }
        Ok(self.assign_token_inner(id, token)?)
    }
}

impl RecordStore for SqliteStore {
    fn append_record(&mut self, record: &AttendanceRecord) -> std::result::Result<(), StoreError> {
        Ok(self.append_record_inner(record)?)
    }

    fn records(
        &self,
        query: &RecordQuery,
    ) -> std::result::Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self.records_inner(query)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rollcall_core::reconciler::{commit_at, CommitRequest};
    use rollcall_core::BatchRecognizer;

    fn new_identity(name: &str, cohort: &str, roll: u32) -> NewIdentity {
        NewIdentity {
            name: name.into(),
            cohort: cohort.into(),
            roll_number: roll,
        }
    }

    fn seeded() -> (SqliteStore, Vec<IdentityId>) {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let ids = [("Ada", 1), ("Bo", 2), ("Cleo", 3)]
            .into_iter()
            .map(|(name, roll)| store.insert_identity(new_identity(name, "C1", roll)).unwrap().id)
            .collect();
        (store, ids)
    }

    fn request(present: &[IdentityId]) -> CommitRequest {
        CommitRequest {
            cohort: "C1".into(),
            subject: "Chemistry".into(),
            present: present.iter().cloned().collect(),
            method: Method::FaceRecognition,
            recorded_by: "instructor".into(),
        }
    }

    #[test]
    fn test_roster_round_trips_identities_and_descriptors() {
        let (mut store, ids) = seeded();
        store.append_descriptor(&ids[1], vec![0.5, -1.0].into()).unwrap();
        assert_eq!(store.append_descriptor(&ids[1], vec![0.25, 2.0].into()).unwrap(), 2);
        store.assign_token(&ids[1], "QR_BO").unwrap();

        let roster = store.roster("C1").unwrap();
        let names: Vec<&str> = roster.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Ada", "Bo", "Cleo"]);

        let bo = &roster[1];
        assert_eq!(bo.roll_number, 2);
        assert_eq!(bo.token.as_deref(), Some("QR_BO"));
        assert_eq!(bo.descriptors[0].values, vec![0.5, -1.0]);
        assert_eq!(bo.descriptors[1].values, vec![0.25, 2.0]);

        assert_eq!(store.gallery("C1").unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_roll_number() {
        let (mut store, _) = seeded();
        let err = store.insert_identity(new_identity("Dee", "C2", 3)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRollNumber(3)));
    }

    #[test]
    fn test_token_lookup_and_uniqueness() {
        let (mut store, ids) = seeded();
        store.assign_token(&ids[0], "QR_ADA").unwrap();
        assert!(matches!(
            store.assign_token(&ids[2], "QR_ADA"),
            Err(StoreError::DuplicateToken)
        ));
        assert_eq!(store.find_by_token("QR_ADA").unwrap().unwrap().id, ids[0]);
        assert!(store.find_by_token("QR_NONE").unwrap().is_none());
        assert!(matches!(
            store.assign_token(&"ghost".into(), "QR_X"),
            Err(StoreError::IdentityNotFound(_))
        ));
    }

    #[test]
    fn test_append_descriptor_unknown_identity() {
        let (mut store, _) = seeded();
        let err = store.append_descriptor(&"ghost".into(), vec![1.0].into()).unwrap_err();
        assert!(matches!(err, StoreError::IdentityNotFound(_)));
    }

    #[test]
    fn test_committed_record_reads_back_exactly() {
        let (mut store, ids) = seeded();
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let record = commit_at(&mut store, request(&ids[..1]), at).unwrap();

        let found = store.records(&RecordQuery::default()).unwrap();
        assert_eq!(found, vec![record.clone()]);
        assert_eq!(record.absent, ids[1..].iter().cloned().collect::<BTreeSet<_>>());
    }

    #[test]
    fn test_records_filtered_by_day_and_cohort() {
        let (mut store, ids) = seeded();
        store.insert_identity(new_identity("Zed", "C2", 9)).unwrap();

        let monday = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let monday_late = Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap();
        let tuesday = Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 0).unwrap();
        commit_at(&mut store, request(&ids[..1]), monday).unwrap();
        commit_at(&mut store, request(&ids[..2]), monday_late).unwrap();
        commit_at(&mut store, request(&[]), tuesday).unwrap();
        let mut other = request(&[]);
        other.cohort = "C2".into();
        commit_at(&mut store, other, monday).unwrap();

        let found = store
            .records(&RecordQuery {
                cohort: Some("C1".into()),
                date: NaiveDate::from_ymd_opt(2026, 3, 2),
                limit: 10,
            })
            .unwrap();
        let times: Vec<_> = found.iter().map(|r| r.recorded_at).collect();
        assert_eq!(times, vec![monday_late, monday]);

        let latest = store
            .records(&RecordQuery {
                limit: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(latest[0].recorded_at, tuesday);
    }

    #[test]
    fn test_rejected_commit_writes_nothing() {
        let (mut store, ids) = seeded();
        let zed = store.insert_identity(new_identity("Zed", "C2", 9)).unwrap();
        let present = vec![ids[0].clone(), zed.id];
        assert!(commit_at(&mut store, request(&present), Utc::now()).is_err());
        assert_eq!(store.counts().unwrap().records, 0);
    }

    #[test]
    fn test_recognition_over_sqlite_snapshot() {
        let (mut store, ids) = seeded();
        store.append_descriptor(&ids[0], vec![0.0, 0.0].into()).unwrap();
        store.append_descriptor(&ids[2], vec![1.0, 1.0].into()).unwrap();

        let result = BatchRecognizer::new(0.6)
            .recognize_cohort(&store, "C1", &[vec![0.1, 0.0].into(), vec![3.0, 3.0].into()])
            .unwrap();
        assert_eq!(result.present, [ids[0].clone()].into_iter().collect::<BTreeSet<_>>());
        assert_eq!(result.detected_count, 2);
    }

    #[test]
    fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("attendance.db");

        let id = {
            let mut store = SqliteStore::open(&path).unwrap();
            let id = store.insert_identity(new_identity("Ada", "C1", 1)).unwrap().id;
            store.append_descriptor(&id, vec![0.5; 4].into()).unwrap();
            id
        };

        let store = SqliteStore::open(&path).unwrap();
        let ada = store.identity(&id).unwrap().unwrap();
        assert_eq!(ada.descriptors.len(), 1);
        assert_eq!(
            store.counts().unwrap(),
            StoreCounts {
                identities: 1,
                descriptors: 1,
                records: 0
            }
        );
    }
}
