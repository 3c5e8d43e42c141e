use crate::engine::{EngineError, EngineHandle};
use chrono::NaiveDate;
use rollcall_core::{
    AttendanceEvent, AttendanceRecord, BatchRecognizer, CommitRequest, Descriptor, EventPublisher,
    IdentityId, Method, NewIdentity, PublishError, RecordQuery, Subscriber,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::fdo;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.freedesktop.Rollcall1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Rollcall1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.freedesktop.Rollcall1
/// Object path: /org/freedesktop/Rollcall1
///
/// Structured arguments and results travel as JSON strings.
pub struct RollcallService {
    engine: EngineHandle,
    publisher: Arc<EventPublisher>,
    recognizer: BatchRecognizer,
    descriptor_dim: usize,
    db_path: PathBuf,
}

impl RollcallService {
    pub fn new(
        engine: EngineHandle,
        publisher: Arc<EventPublisher>,
        recognizer: BatchRecognizer,
        descriptor_dim: usize,
        db_path: PathBuf,
    ) -> Self {
        Self {
            engine,
            publisher,
            recognizer,
            descriptor_dim,
            db_path,
        }
    }

    fn committed(&self, record: &AttendanceRecord) -> fdo::Result<String> {
        let delivered = self.publisher.publish(record);
        tracing::debug!(record_id = %record.id, delivered, "attendance event published");
        to_json(record)
    }
}

#[interface(name = "org.freedesktop.Rollcall1")]
impl RollcallService {
    /// Register a new identity in a cohort. Returns the identity as JSON.
    async fn register_identity(
        &self,
        name: &str,
        cohort: &str,
        roll_number: u32,
    ) -> fdo::Result<String> {
        tracing::info!(cohort, roll_number, "register_identity requested");
        let identity = self
            .engine
            .register(NewIdentity {
                name: name.to_string(),
                cohort: cohort.to_string(),
                roll_number,
            })
            .await
            .map_err(to_fdo)?;
        to_json(&identity)
    }

    /// Append one descriptor (a JSON array of floats) to an identity.
    /// Returns the identity's descriptor count.
    async fn enroll(&self, identity: &str, descriptor: &str) -> fdo::Result<u32> {
        tracing::info!(identity, "enroll requested");
        let values: Vec<f32> = from_json(descriptor, "descriptor")?;
        let count = self
            .engine
            .enroll(IdentityId::from(identity), Descriptor::new(values))
            .await
            .map_err(to_fdo)?;
        descriptor_count(count)
    }

    /// Issue (or reissue) the scannable token of an identity.
    async fn issue_token(&self, identity: &str) -> fdo::Result<String> {
        tracing::info!(identity, "issue_token requested");
        self.engine
            .issue_token(IdentityId::from(identity))
            .await
            .map_err(to_fdo)
    }

    /// Cohort roster ordered by roll number, as JSON.
    async fn roster(&self, cohort: &str) -> fdo::Result<String> {
        let roster = self
            .engine
            .roster(cohort.to_string())
            .await
            .map_err(to_fdo)?;
        to_json(&roster)
    }

    /// Match probe descriptors (a JSON array of float arrays) against the
    /// cohort gallery. Returns the recognition result as JSON.
    async fn recognize(&self, cohort: &str, probes: &str) -> fdo::Result<String> {
        let probes: Vec<Vec<f32>> = from_json(probes, "probes")?;
        tracing::info!(cohort, probes = probes.len(), "recognize requested");
        let result = self
            .engine
            .recognize(
                self.recognizer.clone(),
                cohort.to_string(),
                probes.into_iter().map(Descriptor::new).collect(),
            )
            .await
            .map_err(to_fdo)?;
        to_json(&result)
    }

    /// Resolve a scanned token to an identity id within a cohort.
    async fn resolve_token(&self, cohort: &str, token: &str) -> fdo::Result<String> {
        let identity = self
            .engine
            .resolve_token(cohort.to_string(), token.to_string())
            .await
            .map_err(to_fdo)?;
        Ok(identity.to_string())
    }

    /// Commit a session's present-set (a JSON array of identity ids).
    /// Returns the stored record as JSON.
    async fn commit(
        &self,
        cohort: &str,
        subject: &str,
        present: &str,
        method: &str,
        recorded_by: &str,
    ) -> fdo::Result<String> {
        let present: BTreeSet<IdentityId> = from_json(present, "present")?;
        let method: Method = method.parse().map_err(fdo::Error::InvalidArgs)?;
        tracing::info!(cohort, subject, %method, present = present.len(), "commit requested");
        let record = self
            .engine
            .commit(CommitRequest {
                cohort: cohort.to_string(),
                subject: subject.to_string(),
                present,
                method,
                recorded_by: recorded_by.to_string(),
            })
            .await
            .map_err(to_fdo)?;
        self.committed(&record)
    }

    /// Resolve a token and commit it as the sole attendee of a session.
    async fn mark_by_token(
        &self,
        cohort: &str,
        subject: &str,
        token: &str,
        recorded_by: &str,
    ) -> fdo::Result<String> {
        tracing::info!(cohort, subject, "mark_by_token requested");
        let record = self
            .engine
            .mark_by_token(
                cohort.to_string(),
                subject.to_string(),
                token.to_string(),
                recorded_by.to_string(),
            )
            .await
            .map_err(to_fdo)?;
        self.committed(&record)
    }

    /// Recent records, newest first. Empty `cohort` or `date` means any;
    /// `date` is `YYYY-MM-DD` (UTC); a zero `limit` uses the default.
    async fn list_records(&self, cohort: &str, date: &str, limit: u32) -> fdo::Result<String> {
        let mut query = RecordQuery::default();
        if !cohort.is_empty() {
            query.cohort = Some(cohort.to_string());
        }
        if !date.is_empty() {
            let day = date
                .parse::<NaiveDate>()
                .map_err(|e| fdo::Error::InvalidArgs(format!("invalid date {date:?}: {e}")))?;
            query.date = Some(day);
        }
        if limit > 0 {
            query.limit = limit as usize;
        }
        let records = self.engine.records(query).await.map_err(to_fdo)?;
        to_json(&records)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let counts = self.engine.counts().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "db_path": self.db_path.display().to_string(),
            "match_threshold": self.recognizer.threshold(),
            "descriptor_dim": self.descriptor_dim,
            "identities": counts.identities,
            "descriptors": counts.descriptors,
            "records": counts.records,
            "subscribers": self.publisher.len(),
        })
        .to_string())
    }

    /// Emitted after every committed attendance record.
    #[zbus(signal)]
    async fn attendance_committed(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;
}

/// Forwards attendance events as `AttendanceCommitted` D-Bus signals.
pub struct SignalSubscriber {
    emitter: SignalEmitter<'static>,
    runtime: tokio::runtime::Handle,
}

impl SignalSubscriber {
    pub fn new(conn: &zbus::Connection, runtime: tokio::runtime::Handle) -> zbus::Result<Self> {
        Ok(Self {
            emitter: SignalEmitter::new(conn, OBJECT_PATH)?,
            runtime,
        })
    }
}

impl Subscriber for SignalSubscriber {
    fn name(&self) -> &str {
        "dbus-signal"
    }

    fn deliver(&self, event: &AttendanceEvent) -> Result<(), PublishError> {
        let body = serde_json::to_string(event)
            .map_err(|e| PublishError::new(self.name(), e.to_string()))?;
        let emitter = self.emitter.clone();
        let record_id = event.record_id;
        self.runtime.spawn(async move {
            if let Err(e) = RollcallService::attendance_committed(&emitter, &body).await {
                tracing::warn!(%record_id, error = %e, "failed to emit AttendanceCommitted");
            }
        });
        Ok(())
    }
}

/// Map an engine error onto a D-Bus error whose message starts with the
/// error kind, so clients can branch on it.
fn to_fdo(err: EngineError) -> fdo::Error {
    let kind = err.kind();
    match kind {
        "InvalidRequest" | "InvalidDescriptor" => fdo::Error::InvalidArgs(format!("{kind}: {err}")),
        "Timeout" => fdo::Error::TimedOut(format!("{kind}: {err}")),
        _ => {
            tracing::warn!(kind, error = %err, "request failed");
            fdo::Error::Failed(format!("{kind}: {err}"))
        }
    }
}

fn descriptor_count(count: usize) -> fdo::Result<u32> {
    u32::try_from(count)
        .map_err(|_| fdo::Error::Failed(format!("descriptor count {count} exceeds u32")))
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> fdo::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| fdo::Error::InvalidArgs(format!("InvalidRequest: malformed {what}: {e}")))
}
