//! Change Data Capture: the trait boundary between "something changed in
//! the application database" and the reference registry, plus the
//! transports this crate implements end to end.

mod external;
mod outbox;

pub use external::ExternalFeedTransport;
pub use outbox::OutboxTransport;

use async_trait::async_trait;

use crate::error::Result;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Delete,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: String,
    pub op: ChangeOp,
    /// `(source, event_id)` the transport uses to make this event's
    /// application idempotent against replay — e.g. an outbox row id,
    /// re-delivered after a crash before its row was deleted. `None` when
    /// the transport has no stable per-event id to dedup against (the
    /// in-process feed, or a synthesized event like [`apply_update`]'s).
    pub dedup: Option<(String, i64)>,
}

/// Applies a single change event to the reference registry. The default
/// implementation is what every transport drives; tests can substitute a
/// recording handler.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, event: ChangeEvent) -> Result<()>;
}

/// A `ChangeHandler` that increments/decrements the registry directly.
/// This is the handler every real transport is constructed with.
pub struct RegistryHandler {
    registry: Registry,
}

impl RegistryHandler {
    pub fn new(registry: Registry) -> Self {
        RegistryHandler { registry }
    }
}

#[async_trait]
impl ChangeHandler for RegistryHandler {
    async fn handle(&self, event: ChangeEvent) -> Result<()> {
        let is_insert = matches!(event.op, ChangeOp::Insert);
        match event.dedup {
            Some((source, event_id)) => {
                self.registry.apply_cdc_change(&source, event_id, &event.key, is_insert).await?;
            }
            None if is_insert => {
                self.registry.increment(&event.key).await?;
            }
            None => {
                self.registry.decrement(&event.key).await?;
            }
        }
        Ok(())
    }
}

/// A pluggable source of change events. A WAL/binlog decoder for a specific
/// vendor implements this trait directly; it is not provided by this crate
/// (vendor-specific wire protocols are an external collaborator's
/// responsibility). It must deliver events in commit order and must not
/// advance its own checkpoint until `handler.handle` has returned `Ok`, so
/// a crash mid-batch replays rather than silently drops a change.
#[async_trait]
pub trait CdcTransport: Send + Sync {
    async fn run(&mut self, handler: &dyn ChangeHandler) -> Result<()>;
    async fn stop(&mut self);
}

/// Applies an "old row -> new row" update as a delete of every key
/// extracted from the old value followed by an insert of every key
/// extracted from the new value, in that order, even if the two sets are
/// identical (the net effect is then a correct no-op, not a skip).
pub async fn apply_update(
    handler: &dyn ChangeHandler,
    old_value: &str,
    new_value: &str,
) -> Result<()> {
    for key in crate::keys::extract_keys(old_value) {
        handler.handle(ChangeEvent { key, op: ChangeOp::Delete, dedup: None }).await?;
    }
    for key in crate::keys::extract_keys(new_value) {
        handler.handle(ChangeEvent { key, op: ChangeOp::Insert, dedup: None }).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHandler {
        events: Mutex<Vec<ChangeEvent>>,
    }

    #[async_trait]
    impl ChangeHandler for RecordingHandler {
        async fn handle(&self, event: ChangeEvent) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn update_deletes_old_keys_before_inserting_new_keys() {
        let handler = RecordingHandler { events: Mutex::new(Vec::new()) };
        apply_update(&handler, "old/key.jpg", "new/key.jpg").await.unwrap();

        let events = handler.events.into_inner().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].op, ChangeOp::Delete);
        assert_eq!(events[0].key, "old/key.jpg");
        assert_eq!(events[1].op, ChangeOp::Insert);
        assert_eq!(events[1].key, "new/key.jpg");
    }

    #[tokio::test]
    async fn update_with_identical_old_and_new_is_a_net_no_op_but_still_fires_both() {
        let handler = RecordingHandler { events: Mutex::new(Vec::new()) };
        apply_update(&handler, "same.jpg", "same.jpg").await.unwrap();

        let events = handler.events.into_inner().unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn registry_handler_ignores_a_replayed_event_with_the_same_dedup_id() {
        let registry = crate::registry::Registry::open_in_memory().await.unwrap();
        let handler = RegistryHandler::new(registry.clone());

        let event = ChangeEvent {
            key: "a.jpg".to_string(),
            op: ChangeOp::Insert,
            dedup: Some(("outbox".to_string(), 42)),
        };
        handler.handle(event.clone()).await.unwrap();
        assert_eq!(registry.get_count("a.jpg").await.unwrap(), 1);

        // A crash-and-retry of the same outbox row must not double-count.
        handler.handle(event).await.unwrap();
        assert_eq!(registry.get_count("a.jpg").await.unwrap(), 1);
    }
}
