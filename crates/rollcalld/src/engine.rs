use rollcall_core::reconciler::{self, CommitRequest};
use rollcall_core::store::RecordQuery;
use rollcall_core::{
    enroll, token, AttendanceError, AttendanceRecord, BatchRecognizer, Descriptor, Identity,
    IdentityId, IdentityStore, Method, NewIdentity, RecognitionResult, RecordStore, Stage, Template,
};
use rollcall_store::{SqliteStore, StoreCounts};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Attendance(#[from] AttendanceError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine request timed out after {0:?}")]
    Timeout(Duration),
    #[error("recognition worker failed: {0}")]
    Worker(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Taxonomy name used in D-Bus error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Attendance(err) => err.kind(),
            EngineError::Timeout(_) => "Timeout",
            EngineError::Spawn(_) | EngineError::Worker(_) | EngineError::ChannelClosed => {
                "StorageFailure"
            }
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, AttendanceError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Register {
        new: NewIdentity,
        reply: Reply<Identity>,
    },
    Enroll {
        identity: IdentityId,
        descriptor: Descriptor,
        reply: Reply<usize>,
    },
    IssueToken {
        identity: IdentityId,
        reply: Reply<String>,
    },
    Roster {
        cohort: String,
        reply: Reply<Vec<Identity>>,
    },
    Gallery {
        cohort: String,
        reply: Reply<Vec<Template>>,
    },
    ResolveToken {
        cohort: String,
        token: String,
        reply: Reply<IdentityId>,
    },
    Commit {
        request: CommitRequest,
        reply: Reply<AttendanceRecord>,
    },
    MarkByToken {
        cohort: String,
        subject: String,
        token: String,
        recorded_by: String,
        reply: Reply<AttendanceRecord>,
    },
    Records {
        query: RecordQuery,
        reply: Reply<Vec<AttendanceRecord>>,
    },
    Counts {
        reply: Reply<StoreCounts>,
    },
}

impl EngineRequest {
    /// A write whose caller has already given up (timed out or dropped).
    /// Running it would persist a change the caller was told failed.
    fn abandoned_write(&self) -> Option<&'static str> {
        let (name, closed) = match self {
            EngineRequest::Register { reply, .. } => ("register", reply.is_closed()),
            EngineRequest::Enroll { reply, .. } => ("enroll", reply.is_closed()),
            EngineRequest::IssueToken { reply, .. } => ("issue_token", reply.is_closed()),
            EngineRequest::Commit { reply, .. } => ("commit", reply.is_closed()),
            EngineRequest::MarkByToken { reply, .. } => ("mark_by_token", reply.is_closed()),
            _ => return None,
        };
        closed.then_some(name)
    }
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
    descriptor_dim: usize,
}

impl EngineHandle {
    /// Send one request and wait for its reply, bounded by the request timeout.
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(make(reply_tx))
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            let result = reply_rx.await.map_err(|_| EngineError::ChannelClosed)?;
            result.map_err(EngineError::from)
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
    }

    pub async fn register(&self, new: NewIdentity) -> Result<Identity, EngineError> {
        self.call(|reply| EngineRequest::Register { new, reply }).await
    }

    /// Append a descriptor; returns the identity's descriptor count.
    pub async fn enroll(
        &self,
        identity: IdentityId,
        descriptor: Descriptor,
    ) -> Result<usize, EngineError> {
        self.call(|reply| EngineRequest::Enroll {
            identity,
            descriptor,
            reply,
        })
        .await
    }

    pub async fn issue_token(&self, identity: IdentityId) -> Result<String, EngineError> {
        self.call(|reply| EngineRequest::IssueToken { identity, reply })
            .await
    }

    pub async fn roster(&self, cohort: String) -> Result<Vec<Identity>, EngineError> {
        self.call(|reply| EngineRequest::Roster { cohort, reply }).await
    }

    /// Snapshot the cohort gallery, then match off the engine thread.
    ///
    /// Probes must have the enrolled descriptor dimension.
    pub async fn recognize(
        &self,
        recognizer: BatchRecognizer,
        cohort: String,
        probes: Vec<Descriptor>,
    ) -> Result<RecognitionResult, EngineError> {
        for probe in &probes {
            enroll::validate_descriptor(probe, self.descriptor_dim)?;
        }
        let gallery = self
            .call(|reply| EngineRequest::Gallery {
                cohort: cohort.clone(),
                reply,
            })
            .await?;
        let result = tokio::task::spawn_blocking(move || {
            recognizer.recognize(&cohort, &gallery, &probes)
        })
        .await
        .map_err(|e| EngineError::Worker(e.to_string()))??;
        Ok(result)
    }

    pub async fn resolve_token(
        &self,
        cohort: String,
        token: String,
    ) -> Result<IdentityId, EngineError> {
        self.call(|reply| EngineRequest::ResolveToken {
            cohort,
            token,
            reply,
        })
        .await
    }

    pub async fn commit(&self, request: CommitRequest) -> Result<AttendanceRecord, EngineError> {
        self.call(|reply| EngineRequest::Commit { request, reply })
            .await
    }

    /// Resolve a token and commit a single-attendee record in one engine step.
    pub async fn mark_by_token(
        &self,
        cohort: String,
        subject: String,
        token: String,
        recorded_by: String,
    ) -> Result<AttendanceRecord, EngineError> {
        self.call(|reply| EngineRequest::MarkByToken {
            cohort,
            subject,
            token,
            recorded_by,
            reply,
        })
        .await
    }

    pub async fn records(&self, query: RecordQuery) -> Result<Vec<AttendanceRecord>, EngineError> {
        self.call(|reply| EngineRequest::Records { query, reply })
            .await
    }

    pub async fn counts(&self) -> Result<StoreCounts, EngineError> {
        self.call(|reply| EngineRequest::Counts { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread that owns the store.
///
/// All store access is serialized through the request channel.
pub fn spawn_engine(
    store: SqliteStore,
    descriptor_dim: usize,
    timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            let mut store = store;
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle_request(&mut store, descriptor_dim, req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        timeout,
        descriptor_dim,
    })
}

fn handle_request(store: &mut SqliteStore, descriptor_dim: usize, req: EngineRequest) {
    if let Some(request) = req.abandoned_write() {
        tracing::warn!(request, "caller gave up before the engine ran it; skipping write");
        return;
    }
    // Reads whose caller is gone are answered into a dropped reply.
    match req {
        EngineRequest::Register { new, reply } => {
            let _ = reply.send(enroll::register(store, new));
        }
        EngineRequest::Enroll {
            identity,
            descriptor,
            reply,
        } => {
            let _ = reply.send(enroll::enroll_descriptor(
                store,
                &identity,
                descriptor,
                descriptor_dim,
            ));
        }
        EngineRequest::IssueToken { identity, reply } => {
            let _ = reply.send(token::issue_token(store, &identity, &mut rand::thread_rng()));
        }
        EngineRequest::Roster { cohort, reply } => {
            let _ = reply.send(
                store
                    .roster(&cohort)
                    .map_err(AttendanceError::storage(Stage::Query)),
            );
        }
        EngineRequest::Gallery { cohort, reply } => {
            let _ = reply.send(
                store
                    .gallery(&cohort)
                    .map_err(AttendanceError::storage(Stage::Recognition)),
            );
        }
        EngineRequest::ResolveToken {
            cohort,
            token,
            reply,
        } => {
            let _ = reply.send(token::resolve(store, &cohort, &token));
        }
        EngineRequest::Commit { request, reply } => {
            let _ = reply.send(reconciler::commit(store, request));
        }
        EngineRequest::MarkByToken {
            cohort,
            subject,
            token,
            recorded_by,
            reply,
        } => {
            let result = token::resolve(store, &cohort, &token).and_then(|identity| {
                reconciler::commit(
                    store,
                    CommitRequest {
                        cohort,
                        subject,
                        present: [identity].into_iter().collect(),
                        method: Method::QrCode,
                        recorded_by,
                    },
                )
            });
            let _ = reply.send(result);
        }
        EngineRequest::Records { query, reply } => {
            let _ = reply.send(
                store
                    .records(&query)
                    .map_err(AttendanceError::storage(Stage::Query)),
            );
        }
        EngineRequest::Counts { reply } => {
            let _ = reply.send(store.counts().map_err(|e| AttendanceError::Storage {
                stage: Stage::Query,
                source: e.into(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn engine() -> EngineHandle {
        let store = SqliteStore::open_in_memory().unwrap();
        spawn_engine(store, 2, Duration::from_secs(5)).unwrap()
    }

    async fn register(engine: &EngineHandle, name: &str, cohort: &str, roll: u32) -> IdentityId {
        engine
            .register(NewIdentity {
                name: name.into(),
                cohort: cohort.into(),
                roll_number: roll,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_enroll_recognize_commit() {
        let engine = engine();
        let s1 = register(&engine, "S1", "C1", 1).await;
        let s2 = register(&engine, "S2", "C1", 2).await;
        let s3 = register(&engine, "S3", "C1", 3).await;
        engine.enroll(s1.clone(), vec![0.0, 0.0].into()).await.unwrap();
        engine.enroll(s2.clone(), vec![2.0, 0.0].into()).await.unwrap();

        let result = engine
            .recognize(
                BatchRecognizer::new(0.6),
                "C1".into(),
                vec![vec![0.1, 0.0].into(), vec![1.0, 0.0].into()],
            )
            .await
            .unwrap();
        assert_eq!(result.detected_count, 2);
        assert_eq!(result.present.iter().collect::<Vec<_>>(), vec![&s1]);

        let record = engine
            .commit(CommitRequest {
                cohort: "C1".into(),
                subject: "Biology".into(),
                present: result.present,
                method: Method::FaceRecognition,
                recorded_by: "instructor".into(),
            })
            .await
            .unwrap();
        assert_eq!(record.absent, [s2, s3].into_iter().collect::<BTreeSet<_>>());

        let stored = engine.records(RecordQuery::default()).await.unwrap();
        assert_eq!(stored, vec![record]);
    }

    #[tokio::test]
    async fn test_recognize_without_templates() {
        let engine = engine();
        register(&engine, "S1", "C1", 1).await;
        let err = engine
            .recognize(BatchRecognizer::default(), "C1".into(), vec![vec![0.0, 0.0].into()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NoEnrolledTemplates");
    }

    #[tokio::test]
    async fn test_recognize_rejects_probe_of_wrong_dimension() {
        let engine = engine();
        let s1 = register(&engine, "S1", "C1", 1).await;
        engine.enroll(s1, vec![0.0, 0.0].into()).await.unwrap();

        let err = engine
            .recognize(
                BatchRecognizer::default(),
                "C1".into(),
                vec![vec![0.0, 0.0].into(), vec![0.0, 0.0, 0.0].into()],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidDescriptor");
    }

    #[tokio::test]
    async fn test_abandoned_commit_is_not_written() {
        let engine = engine();
        let s1 = register(&engine, "S1", "C1", 1).await;

        // Same state a timed-out caller leaves behind: receiver already gone.
        let (reply, reply_rx) = oneshot::channel();
        drop(reply_rx);
        engine
            .tx
            .send(EngineRequest::Commit {
                request: CommitRequest {
                    cohort: "C1".into(),
                    subject: "Biology".into(),
                    present: [s1].into_iter().collect(),
                    method: Method::Manual,
                    recorded_by: String::new(),
                },
                reply,
            })
            .await
            .unwrap();

        // Requests are served in order, so the commit was handled by now.
        assert_eq!(engine.counts().await.unwrap().records, 0);
    }

    #[tokio::test]
    async fn test_abandoned_register_is_not_written() {
        let engine = engine();
        let (reply, reply_rx) = oneshot::channel();
        drop(reply_rx);
        engine
            .tx
            .send(EngineRequest::Register {
                new: NewIdentity {
                    name: "S1".into(),
                    cohort: "C1".into(),
                    roll_number: 1,
                },
                reply,
            })
            .await
            .unwrap();

        assert_eq!(engine.counts().await.unwrap().identities, 0);
    }

    #[tokio::test]
    async fn test_enroll_checks_dimension() {
        let engine = engine();
        let s1 = register(&engine, "S1", "C1", 1).await;
        let err = engine.enroll(s1, vec![0.0; 3].into()).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidDescriptor");
    }

    #[tokio::test]
    async fn test_mark_by_token() {
        let engine = engine();
        let s1 = register(&engine, "S1", "A", 1).await;
        let s2 = register(&engine, "S2", "A", 2).await;
        let token = engine.issue_token(s1.clone()).await.unwrap();

        let record = engine
            .mark_by_token("A".into(), "History".into(), token.clone(), String::new())
            .await
            .unwrap();
        assert_eq!(record.method, Method::QrCode);
        assert_eq!(record.present.iter().collect::<Vec<_>>(), vec![&s1]);
        assert_eq!(record.absent.iter().collect::<Vec<_>>(), vec![&s2]);
        assert_eq!(record.recorded_by, "system");

        let err = engine
            .mark_by_token("B".into(), "History".into(), token, String::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "CohortMismatch");
        assert_eq!(engine.counts().await.unwrap().records, 1);
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let engine = engine();
        let err = engine
            .resolve_token("A".into(), "QR_missing".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UnknownToken");
    }

    #[tokio::test]
    async fn test_closed_engine_reports_channel_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = EngineHandle {
            tx,
            timeout: Duration::from_secs(1),
            descriptor_dim: 2,
        };
        assert!(matches!(
            handle.counts().await,
            Err(EngineError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_stalled_engine_times_out() {
        // Receiver kept alive but never serviced.
        let (tx, _rx) = mpsc::channel(1);
        let handle = EngineHandle {
            tx,
            timeout: Duration::from_millis(20),
            descriptor_dim: 2,
        };
        let err = handle.counts().await.unwrap_err();
        assert_eq!(err.kind(), "Timeout");
    }
}
