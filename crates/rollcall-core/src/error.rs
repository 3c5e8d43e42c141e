use crate::store::StoreError;
use crate::types::IdentityId;
use std::fmt;
use thiserror::Error;

/// Step of an attendance operation that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Enrollment,
    Extraction,
    Recognition,
    TokenResolution,
    Commit,
    Query,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Enrollment => "enrollment",
            Stage::Extraction => "extraction",
            Stage::Recognition => "recognition",
            Stage::TokenResolution => "token resolution",
            Stage::Commit => "commit",
            Stage::Query => "query",
        })
    }
}

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("no enrolled templates for cohort {cohort}; use the token channel")]
    NoEnrolledTemplates { cohort: String },
    #[error("{stage}: no face detected")]
    NoFaceDetected { stage: Stage },
    #[error("{stage}: extraction failed: {reason}")]
    ExtractionFailed { stage: Stage, reason: String },
    #[error("no identity owns token {token}")]
    UnknownToken { token: String },
    #[error("identity {identity} belongs to cohort {actual}, not {expected}")]
    CohortMismatch {
        token: String,
        identity: IdentityId,
        expected: String,
        actual: String,
    },
    #[error("identity {identity} is not on the roster of cohort {cohort}")]
    UnknownIdentityForCohort { identity: IdentityId, cohort: String },
    #[error("identity not found: {0}")]
    IdentityNotFound(IdentityId),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{stage}: storage failure: {source}")]
    Storage {
        stage: Stage,
        #[source]
        source: StoreError,
    },
}

impl AttendanceError {
    /// Stable name of the error kind, for callers choosing a follow-up action.
    pub fn kind(&self) -> &'static str {
        match self {
            AttendanceError::NoEnrolledTemplates { .. } => "NoEnrolledTemplates",
            AttendanceError::NoFaceDetected { .. } => "NoFaceDetected",
            AttendanceError::ExtractionFailed { .. } => "ExtractionFailed",
            AttendanceError::UnknownToken { .. } => "UnknownToken",
            AttendanceError::CohortMismatch { .. } => "CohortMismatch",
            AttendanceError::UnknownIdentityForCohort { .. } => "UnknownIdentityForCohort",
            AttendanceError::IdentityNotFound(_) => "IdentityNotFound",
            AttendanceError::InvalidDescriptor(_) => "InvalidDescriptor",
            AttendanceError::InvalidRequest(_) => "InvalidRequest",
            AttendanceError::Storage { .. } => "StorageFailure",
        }
    }

    /// Map a store error raised during `stage`.
    ///
    /// Lookups of a missing identity are reported as such rather than as a
    /// storage failure.
    pub fn storage(stage: Stage) -> impl FnOnce(StoreError) -> AttendanceError {
        move |source| match source {
            StoreError::IdentityNotFound(id) => AttendanceError::IdentityNotFound(id),
            source => AttendanceError::Storage { stage, source },
        }
    }
}

pub type Result<T> = std::result::Result<T, AttendanceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_maps_missing_identity() {
        let err =
            AttendanceError::storage(Stage::Commit)(StoreError::IdentityNotFound("s9".into()));
        assert!(matches!(err, AttendanceError::IdentityNotFound(ref id) if id.as_str() == "s9"));
    }

    #[test]
    fn test_storage_tags_stage() {
        let err = AttendanceError::storage(Stage::Commit)(StoreError::Backend("disk full".into()));
        assert_eq!(err.kind(), "StorageFailure");
        assert_eq!(err.to_string(), "commit: storage failure: storage backend: disk full");
    }

    #[test]
    fn test_cohort_mismatch_message_names_actual_cohort() {
        let err = AttendanceError::CohortMismatch {
            token: "QR_s1_00".into(),
            identity: "s1".into(),
            expected: "CSE-3B".into(),
            actual: "CSE-3A".into(),
        };
        assert_eq!(err.kind(), "CohortMismatch");
        assert!(err.to_string().contains("CSE-3A"));
    }
}
