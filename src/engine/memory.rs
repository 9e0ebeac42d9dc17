//! In-process engine fed through a channel.
//!
//! Each batch handed to a [`BatchSender`] is delivered to the consumer and
//! the sender waits until the batch is acknowledged. A batch dropped by an
//! immediate stop is reported back as unacknowledged.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CaptureEngine, ChangeRecord, EngineContext, RecordCommitter};
use crate::{Error, Result};

struct Delivery {
    records: Vec<ChangeRecord>,
    ack: oneshot::Sender<()>,
}

/// Producer side of a [`MemoryEngine`].
#[derive(Clone)]
pub struct BatchSender {
    sender: mpsc::Sender<Delivery>,
    committed: Arc<AtomicU64>,
}

impl BatchSender {
    /// Delivers `records` as one batch and waits for its acknowledgement.
    pub async fn send(&self, records: Vec<ChangeRecord>) -> Result<()> {
        let (ack, acked) = oneshot::channel();
        self.sender
            .send(Delivery { records, ack })
            .await
            .map_err(|_| Error::Engine("Memory engine is gone".to_string()))?;
        acked
            .await
            .map_err(|_| Error::Engine("Batch was dropped without being acknowledged".to_string()))
    }

    /// Number of batches acknowledged so far.
    pub fn committed_batches(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }
}

pub struct MemoryEngine {
    receiver: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    committed: Arc<AtomicU64>,
    closed: Mutex<CancellationToken>,
    startup_failure: Option<String>,
}

impl MemoryEngine {
    pub fn channel(capacity: usize) -> (Self, BatchSender) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let committed = Arc::new(AtomicU64::new(0));
        let engine = Self {
            receiver: tokio::sync::Mutex::new(receiver),
            committed: committed.clone(),
            closed: Mutex::new(CancellationToken::new()),
            startup_failure: None,
        };
        (engine, BatchSender { sender, committed })
    }

    /// Makes every run report `message` as its startup failure.
    pub fn failing_on_start(mut self, message: impl Into<String>) -> Self {
        self.startup_failure = Some(message.into());
        self
    }

    fn reset_closed(&self) -> Result<CancellationToken> {
        let mut slot = self
            .closed
            .lock()
            .map_err(|_| Error::Engine("Memory engine state is poisoned".to_string()))?;
        *slot = CancellationToken::new();
        Ok(slot.clone())
    }
}

struct AckCommitter {
    ack: Option<oneshot::Sender<()>>,
    committed: Arc<AtomicU64>,
}

#[async_trait]
impl RecordCommitter for AckCommitter {
    async fn mark_batch_finished(&mut self) -> Result<()> {
        let ack = self
            .ack
            .take()
            .ok_or_else(|| Error::Engine("Batch already acknowledged".to_string()))?;
        self.committed.fetch_add(1, Ordering::SeqCst);
        // The producer may have given up waiting; the commit still stands.
        let _ = ack.send(());
        Ok(())
    }
}

#[async_trait]
impl CaptureEngine for MemoryEngine {
    async fn run(&self, context: EngineContext) -> Result<()> {
        if let Some(message) = &self.startup_failure {
            context.startup.failed(message.clone());
            return Err(Error::Engine(message.clone()));
        }

        let mut receiver = self
            .receiver
            .try_lock()
            .map_err(|_| Error::Engine("Memory engine is already running".to_string()))?;
        let closed = self.reset_closed()?;

        context.startup.started();
        info!("Memory engine started");

        loop {
            tokio::select! {
                _ = context.shutdown.cancelled() => break,
                _ = closed.cancelled() => break,
                delivery = receiver.recv() => match delivery {
                    Some(Delivery { records, ack }) => {
                        debug!(records = records.len(), "Delivering batch");
                        let mut committer = AckCommitter {
                            ack: Some(ack),
                            committed: self.committed.clone(),
                        };
                        context.consumer.handle_batch(records, &mut committer).await;
                    }
                    None => break,
                },
            }
        }

        info!("Memory engine stopped");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let closed = self
            .closed
            .lock()
            .map_err(|_| Error::Engine("Memory engine state is poisoned".to_string()))?;
        closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ChangeConsumer, EngineProperties, StartupOutcome, StartupSignal};
    use std::time::Duration;

    #[derive(Default)]
    struct CollectingConsumer {
        values: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChangeConsumer for CollectingConsumer {
        async fn handle_batch(&self, records: Vec<ChangeRecord>, committer: &mut dyn RecordCommitter) {
            self.values.lock().unwrap().extend(records.into_iter().map(|r| r.value));
            committer.mark_batch_finished().await.unwrap();
        }
    }

    fn create_context(consumer: Arc<dyn ChangeConsumer>) -> (EngineContext, oneshot::Receiver<StartupOutcome>) {
        let (startup, outcome) = StartupSignal::channel();
        let context = EngineContext {
            properties: EngineProperties::new(),
            consumer,
            startup,
            shutdown: CancellationToken::new(),
        };
        (context, outcome)
    }

    #[tokio::test]
    async fn test_batches_are_delivered_and_acknowledged() {
        let (engine, sender) = MemoryEngine::channel(4);
        let engine = Arc::new(engine);
        let consumer = Arc::new(CollectingConsumer::default());
        let (context, outcome) = create_context(consumer.clone());

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(context).await }
        });
        assert_eq!(outcome.await.unwrap(), StartupOutcome::Started);

        sender.send(vec![ChangeRecord::new("a"), ChangeRecord::new("b")]).await.unwrap();
        sender.send(vec![ChangeRecord::new("c")]).await.unwrap();
        assert_eq!(sender.committed_batches(), 2);
        assert_eq!(*consumer.values.lock().unwrap(), vec!["a", "b", "c"]);

        engine.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_startup_failure_is_reported() {
        let (engine, _sender) = MemoryEngine::channel(1);
        let engine = engine.failing_on_start("source unreachable");
        let (context, outcome) = create_context(Arc::new(CollectingConsumer::default()));

        assert!(engine.run(context).await.is_err());
        assert_eq!(
            outcome.await.unwrap(),
            StartupOutcome::Failed("source unreachable".to_string())
        );
    }
}
