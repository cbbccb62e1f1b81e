use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CdcTransport, ChangeEvent, ChangeHandler};
use crate::error::Result;

/// A transport fed directly by the embedding process through an
/// `mpsc::Sender<ChangeEvent>`, for callers that already have their own
/// change stream (or for tests) and don't need this crate to own a
/// database connection.
pub struct ExternalFeedTransport {
    receiver: mpsc::Receiver<ChangeEvent>,
}

impl ExternalFeedTransport {
    /// Returns a transport and the sender used to feed it events.
    pub fn channel(buffer: usize) -> (mpsc::Sender<ChangeEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, ExternalFeedTransport { receiver: rx })
    }
}

#[async_trait]
impl CdcTransport for ExternalFeedTransport {
    async fn run(&mut self, handler: &dyn ChangeHandler) -> Result<()> {
        while let Some(event) = self.receiver.recv().await {
            handler.handle(event).await?;
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.receiver.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::ChangeOp;
    use std::sync::Mutex;

    struct RecordingHandler {
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChangeHandler for RecordingHandler {
        async fn handle(&self, event: ChangeEvent) -> Result<()> {
            self.keys.lock().unwrap().push(event.key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_events_until_sender_dropped() {
        let (tx, mut transport) = ExternalFeedTransport::channel(8);
        let handler = RecordingHandler { keys: Mutex::new(Vec::new()) };

        tx.send(ChangeEvent { key: "a".into(), op: ChangeOp::Insert, dedup: None }).await.unwrap();
        tx.send(ChangeEvent { key: "b".into(), op: ChangeOp::Insert, dedup: None }).await.unwrap();
        drop(tx);

        transport.run(&handler).await.unwrap();
        assert_eq!(handler.keys.into_inner().unwrap(), vec!["a", "b"]);
    }
}
