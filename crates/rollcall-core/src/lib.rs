//! rollcall-core — Attendance identity resolution and reconciliation.
//!
//! Matches biometric descriptors from a group capture against enrolled
//! templates, resolves scanned tokens, and turns the resulting present-set
//! into an immutable attendance record for a cohort.

pub mod enroll;
pub mod error;
pub mod extractor;
pub mod matcher;
pub mod publisher;
pub mod reconciler;
pub mod recognizer;
pub mod store;
pub mod token;
pub mod types;

pub use error::{AttendanceError, Stage};
pub use extractor::{ExtractError, Extractor};
pub use matcher::{
    EuclideanMatcher, MatchResult, Matcher, DEFAULT_DESCRIPTOR_DIM, DEFAULT_MATCH_THRESHOLD,
};
pub use publisher::{EventPublisher, PublishError, Subscriber};
pub use reconciler::CommitRequest;
pub use recognizer::{BatchRecognizer, ProbeOutcome, RecognitionResult};
pub use store::{IdentityStore, MemoryStore, RecordQuery, RecordStore, StoreError};
pub use types::{
    AttendanceEvent, AttendanceRecord, Descriptor, Identity, IdentityId, Method, NewIdentity,
    RecordId, Template,
};
