//! In-process event bus for committed attendance records.

use rollcall_core::{AttendanceEvent, PublishError, Subscriber};
use tokio::sync::broadcast;

/// Broadcasts attendance events to in-process observers.
pub struct EventBus {
    sender: broadcast::Sender<AttendanceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttendanceEvent> {
        self.sender.subscribe()
    }

    /// Publisher-side adapter feeding this bus.
    pub fn subscriber(&self) -> BusSubscriber {
        BusSubscriber {
            sender: self.sender.clone(),
        }
    }
}

pub struct BusSubscriber {
    sender: broadcast::Sender<AttendanceEvent>,
}

impl Subscriber for BusSubscriber {
    fn name(&self) -> &str {
        "event-bus"
    }

    fn deliver(&self, event: &AttendanceEvent) -> Result<(), PublishError> {
        // No live receivers is not a delivery failure.
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

/// Log every event seen on the bus until it closes.
pub async fn log_events(mut rx: broadcast::Receiver<AttendanceEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => tracing::info!(
                record_id = %event.record_id,
                cohort = %event.cohort,
                subject = %event.subject,
                present = event.present.len(),
                "attendance event"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event log lagging; events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
