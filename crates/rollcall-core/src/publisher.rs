//! Best-effort fan-out of committed records to live observers.
//!
//! Delivery is not part of the durability contract: a record is committed
//! whether or not any subscriber hears about it.

use crate::types::{AttendanceEvent, AttendanceRecord};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("publish to {subscriber} failed: {reason}")]
pub struct PublishError {
    pub subscriber: String,
    pub reason: String,
}

impl PublishError {
    pub fn new(subscriber: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subscriber: subscriber.into(),
            reason: reason.into(),
        }
    }
}

/// One observer transport (in-process channel, bus signal, network push...).
///
/// Implementations must not block; queue or spawn instead.
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;

    fn deliver(&self, event: &AttendanceEvent) -> Result<(), PublishError>;
}

/// Fans each committed record out to every registered subscriber.
#[derive(Default)]
pub struct EventPublisher {
    subscribers: Vec<Box<dyn Subscriber>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: Box<dyn Subscriber>) {
        tracing::debug!(subscriber = subscriber.name(), "subscriber registered");
        self.subscribers.push(subscriber);
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Deliver `record` once to each subscriber.
    ///
    /// Failures are logged and dropped. Returns how many deliveries succeeded.
    pub fn publish(&self, record: &AttendanceRecord) -> usize {
        let event = AttendanceEvent::from(record);
        let mut delivered = 0;
        for subscriber in &self.subscribers {
            match subscriber.deliver(&event) {
                Ok(()) => delivered += 1,
                Err(err) => tracing::warn!(
                    record_id = %record.id,
                    error = %err,
                    "attendance event not delivered"
                ),
            }
        }
        delivered
    }
}
