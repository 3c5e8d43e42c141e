//! Turns a present-set into a committed attendance record.

use crate::error::{AttendanceError, Result, Stage};
use crate::store::{IdentityStore, RecordStore};
use crate::types::{AttendanceRecord, IdentityId, Method, RecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const DEFAULT_RECORDER: &str = "system";

/// Everything the caller asserts about one finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub cohort: String,
    pub subject: String,
    pub present: BTreeSet<IdentityId>,
    pub method: Method,
    #[serde(default)]
    pub recorded_by: String,
}

/// Commit a session stamped with the current time.
pub fn commit<S>(store: &mut S, request: CommitRequest) -> Result<AttendanceRecord>
where
    S: IdentityStore + RecordStore + ?Sized,
{
    commit_at(store, request, Utc::now())
}

/// Commit a session stamped with `at`.
///
/// The roster is read once; every present id must be on it, otherwise
/// nothing is written. The rest of the roster becomes the absent-set. Each
/// call appends a new record, even for a cohort and subject already taken.
pub fn commit_at<S>(
    store: &mut S,
    request: CommitRequest,
    at: DateTime<Utc>,
) -> Result<AttendanceRecord>
where
    S: IdentityStore + RecordStore + ?Sized,
{
    if request.cohort.trim().is_empty() {
        return Err(AttendanceError::InvalidRequest("cohort must not be empty".into()));
    }
    if request.subject.trim().is_empty() {
        return Err(AttendanceError::InvalidRequest("subject must not be empty".into()));
    }

    let roster: BTreeSet<IdentityId> = store
        .roster(&request.cohort)
        .map_err(AttendanceError::storage(Stage::Commit))?
        .into_iter()
        .map(|identity| identity.id)
        .collect();

    if let Some(stray) = request.present.iter().find(|id| !roster.contains(*id)) {
        tracing::warn!(
            cohort = %request.cohort,
            identity = %stray,
            "present id is not on the cohort roster; refusing to commit"
        );
        return Err(AttendanceError::UnknownIdentityForCohort {
            identity: stray.clone(),
            cohort: request.cohort,
        });
    }

    let absent: BTreeSet<IdentityId> = roster.difference(&request.present).cloned().collect();

    let recorded_by = if request.recorded_by.trim().is_empty() {
        DEFAULT_RECORDER.to_string()
    } else {
        request.recorded_by
    };

    let record = AttendanceRecord {
        id: RecordId::generate(),
        cohort: request.cohort,
        subject: request.subject,
        recorded_at: at,
        method: request.method,
        present: request.present,
        absent,
        recorded_by,
    };

    store
        .append_record(&record)
        .map_err(AttendanceError::storage(Stage::Commit))?;

    tracing::info!(
        record_id = %record.id,
        cohort = %record.cohort,
        subject = %record.subject,
        method = %record.method,
        present = record.present.len(),
        absent = record.absent.len(),
        "attendance committed"
    );
    Ok(record)
}
