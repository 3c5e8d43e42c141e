use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a cohort member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier for a newly registered identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a committed attendance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Biometric descriptor (typically 128-dimensional).
///
/// Serialized as a bare JSON array of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True if every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two descriptors.
    ///
    /// Only meaningful for equal-length descriptors; callers compare lengths
    /// first.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// A known cohort member with its enrolled descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    /// Unique across the whole identity set.
    pub roll_number: u32,
    pub cohort: String,
    #[serde(default)]
    pub descriptors: Vec<Descriptor>,
    /// Scan code, globally unique when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Identity {
    pub fn has_templates(&self) -> bool {
        !self.descriptors.is_empty()
    }
}

/// Fields required to register a new identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIdentity {
    pub name: String,
    pub cohort: String,
    pub roll_number: u32,
}

/// One enrolled descriptor paired with its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub identity: IdentityId,
    pub descriptor: Descriptor,
}

/// Flatten a roster into its ordered list of templates.
///
/// Order follows the roster, then enrollment order within an identity.
pub fn gallery_of(roster: &[Identity]) -> Vec<Template> {
    roster
        .iter()
        .flat_map(|identity| {
            identity.descriptors.iter().map(|d| Template {
                identity: identity.id.clone(),
                descriptor: d.clone(),
            })
        })
        .collect()
}

/// One descriptor detected in a capture, awaiting resolution.
#[derive(Debug, Clone)]
pub struct Probe {
    /// Detection index within the capture.
    pub index: usize,
    pub descriptor: Descriptor,
}

/// Channel an attendance record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    FaceRecognition,
    QrCode,
    Manual,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::FaceRecognition => "face_recognition",
            Method::QrCode => "qr_code",
            Method::Manual => "manual",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "face_recognition" => Ok(Method::FaceRecognition),
            "qr_code" => Ok(Method::QrCode),
            "manual" => Ok(Method::Manual),
            other => Err(format!("unknown attendance method: {other}")),
        }
    }
}

/// The committed result of one attendance session.
///
/// `present` and `absent` partition the cohort roster as it was at commit
/// time. Stores only ever append records; corrections are new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: RecordId,
    pub cohort: String,
    pub subject: String,
    pub recorded_at: DateTime<Utc>,
    pub method: Method,
    pub present: BTreeSet<IdentityId>,
    pub absent: BTreeSet<IdentityId>,
    pub recorded_by: String,
}

/// Summary of a committed record sent to live observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub record_id: RecordId,
    pub cohort: String,
    pub subject: String,
    pub present: BTreeSet<IdentityId>,
    pub at: DateTime<Utc>,
}

impl From<&AttendanceRecord> for AttendanceEvent {
    fn from(record: &AttendanceRecord) -> Self {
        Self {
            record_id: record.id,
            cohort: record.cohort.clone(),
            subject: record.subject.clone(),
            present: record.present.clone(),
            at: record.recorded_at,
        }
    }
}
