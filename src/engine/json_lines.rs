//! Engine that tails a file of newline-delimited change events.
//!
//! Each non-empty line is one record value. Lines are delivered in batches of
//! at most `max.batch.size`; once the end of the file is reached the engine
//! polls for appended lines every `poll.interval.ms`. The committed position
//! is the number of lines acknowledged, optionally persisted to
//! `offset.storage.path` so a restart resumes after the last committed batch.
//!
//! ```rust,no_run
//! use cdc_listener::engine::{EngineProperties, JsonLinesEngine};
//!
//! # fn main() -> cdc_listener::Result<()> {
//! let properties = EngineProperties::new()
//!     .with("input.path", "/var/lib/cdc/events.jsonl")
//!     .with("max.batch.size", 512);
//! let engine = JsonLinesEngine::from_properties(&properties)?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CaptureEngine, ChangeRecord, EngineContext, EngineFactory, EngineProperties, RecordCommitter};
use crate::{Error, Result};

pub const INPUT_PATH: &str = "input.path";
pub const MAX_BATCH_SIZE: &str = "max.batch.size";
pub const POLL_INTERVAL_MS: &str = "poll.interval.ms";
pub const OFFSET_STORAGE_PATH: &str = "offset.storage.path";

const DEFAULT_MAX_BATCH_SIZE: usize = 2048;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

pub struct JsonLinesEngine {
    path: PathBuf,
    offset_path: Option<PathBuf>,
    max_batch_size: usize,
    poll_interval: Duration,
    committed: Arc<AtomicU64>,
    closed: Mutex<CancellationToken>,
}

impl JsonLinesEngine {
    pub fn from_properties(properties: &EngineProperties) -> Result<Self> {
        let path = PathBuf::from(properties.require(INPUT_PATH)?);
        let max_batch_size = properties
            .parse::<usize>(MAX_BATCH_SIZE)?
            .unwrap_or(DEFAULT_MAX_BATCH_SIZE);
        if max_batch_size == 0 {
            return Err(Error::Config(format!("'{}' must be greater than zero", MAX_BATCH_SIZE)));
        }
        let poll_interval = Duration::from_millis(
            properties
                .parse::<u64>(POLL_INTERVAL_MS)?
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        );

        Ok(Self {
            path,
            offset_path: properties.get(OFFSET_STORAGE_PATH).map(PathBuf::from),
            max_batch_size,
            poll_interval,
            committed: Arc::new(AtomicU64::new(0)),
            closed: Mutex::new(CancellationToken::new()),
        })
    }

    /// Lines acknowledged so far, including blank ones.
    pub fn committed_offset(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    async fn load_offset(&self) -> Result<u64> {
        let Some(path) = &self.offset_path else {
            return Ok(self.committed_offset());
        };
        match fs::read_to_string(path).await {
            Ok(contents) => contents
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::Engine(format!("Corrupt offset file '{}'", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_closed(&self) -> Result<CancellationToken> {
        let mut slot = self
            .closed
            .lock()
            .map_err(|_| Error::Engine("Engine state is poisoned".to_string()))?;
        *slot = CancellationToken::new();
        Ok(slot.clone())
    }
}

pub struct JsonLinesEngineFactory;

impl EngineFactory for JsonLinesEngineFactory {
    fn create(&self, properties: &EngineProperties) -> Result<Arc<dyn CaptureEngine>> {
        Ok(Arc::new(JsonLinesEngine::from_properties(properties)?))
    }
}

struct LineCommitter {
    committed: Arc<AtomicU64>,
    offset_path: Option<PathBuf>,
    position: u64,
}

#[async_trait]
impl RecordCommitter for LineCommitter {
    async fn mark_batch_finished(&mut self) -> Result<()> {
        if let Some(path) = &self.offset_path {
            store_offset(path, self.position).await?;
        }
        self.committed.store(self.position, Ordering::SeqCst);
        debug!(offset = self.position, "Committed line offset");
        Ok(())
    }
}

async fn store_offset(path: &Path, offset: u64) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(offset.to_string().as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[async_trait]
impl CaptureEngine for JsonLinesEngine {
    async fn run(&self, context: EngineContext) -> Result<()> {
        let opened = async {
            let offset = self.load_offset().await?;
            let file = fs::File::open(&self.path).await?;
            Ok::<_, Error>((offset, file))
        }
        .await;
        let (offset, file) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let message = format!("Unable to open '{}': {}", self.path.display(), e);
                context.startup.failed(message.clone());
                return Err(Error::Engine(message));
            }
        };
        let closed = self.reset_closed()?;
        self.committed.store(offset, Ordering::SeqCst);

        context.startup.started();
        info!(path = %self.path.display(), offset, "JSON lines engine started");

        let mut reader = BufReader::new(file);
        let mut pending = String::new();
        let mut position = 0u64;

        loop {
            if closed.is_cancelled() || context.shutdown.is_cancelled() {
                break;
            }

            let start = position;
            let mut batch = Vec::new();
            while batch.len() < self.max_batch_size {
                if reader.read_line(&mut pending).await? == 0 || !pending.ends_with('\n') {
                    // End of file, keep any partial line for the next poll.
                    break;
                }
                let line = std::mem::take(&mut pending);
                position += 1;
                if position <= offset {
                    continue;
                }
                let value = line.trim();
                if !value.is_empty() {
                    batch.push(ChangeRecord::new(value));
                }
            }

            if position == start {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                    _ = closed.cancelled() => break,
                    _ = context.shutdown.cancelled() => break,
                }
            }
            if position <= offset {
                continue;
            }

            let mut committer = LineCommitter {
                committed: self.committed.clone(),
                offset_path: self.offset_path.clone(),
                position,
            };
            if batch.is_empty() {
                // Only blank lines; advance the offset past them.
                if let Err(e) = committer.mark_batch_finished().await {
                    warn!(error = %e, "Failed to commit blank lines");
                }
            } else {
                context.consumer.handle_batch(batch, &mut committer).await;
            }

            // Reading on would deliver lines the stored offset cannot account for.
            if self.committed_offset() < position {
                return Err(Error::Engine(format!(
                    "Unable to persist line offset {}, last stored offset is {}",
                    position,
                    self.committed_offset()
                )));
            }
        }

        info!(path = %self.path.display(), offset = self.committed_offset(), "JSON lines engine stopped");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let closed = self
            .closed
            .lock()
            .map_err(|_| Error::Engine("Engine state is poisoned".to_string()))?;
        closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ChangeConsumer, StartupOutcome, StartupSignal};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct AcknowledgingConsumer {
        records: AtomicUsize,
    }

    #[async_trait]
    impl ChangeConsumer for AcknowledgingConsumer {
        async fn handle_batch(&self, records: Vec<ChangeRecord>, committer: &mut dyn RecordCommitter) {
            self.records.fetch_add(records.len(), Ordering::SeqCst);
            committer.mark_batch_finished().await.ok();
        }
    }

    #[test]
    fn test_from_properties_defaults() {
        let properties = EngineProperties::new().with(INPUT_PATH, "/tmp/events.jsonl");
        let engine = JsonLinesEngine::from_properties(&properties).unwrap();

        assert_eq!(engine.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(engine.poll_interval, Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
        assert!(engine.offset_path.is_none());
        assert_eq!(engine.committed_offset(), 0);
    }

    #[test]
    fn test_from_properties_requires_input() {
        assert!(JsonLinesEngine::from_properties(&EngineProperties::new()).is_err());

        let properties = EngineProperties::new()
            .with(INPUT_PATH, "/tmp/events.jsonl")
            .with(MAX_BATCH_SIZE, 0);
        assert!(JsonLinesEngine::from_properties(&properties).is_err());
    }

    #[tokio::test]
    async fn test_offset_is_stored_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offset");

        store_offset(&path, 42).await.unwrap();
        assert_eq!(fs::read_to_string(&path).await.unwrap(), "42");
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_unstored_offset_stops_engine() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("events.jsonl");
        std::fs::write(&input, "{\"id\":1}\n{\"id\":2}\n{\"id\":3}\n").unwrap();
        let properties = EngineProperties::new()
            .with(INPUT_PATH, input.display())
            .with(OFFSET_STORAGE_PATH, dir.path().join("missing").join("offset").display())
            .with(MAX_BATCH_SIZE, 1)
            .with(POLL_INTERVAL_MS, 10);
        let engine = JsonLinesEngine::from_properties(&properties).unwrap();
        let consumer = Arc::new(AcknowledgingConsumer::default());
        let (startup, outcome) = StartupSignal::channel();
        let context = EngineContext {
            properties,
            consumer: consumer.clone(),
            startup,
            shutdown: CancellationToken::new(),
        };

        let err = tokio::time::timeout(Duration::from_secs(5), engine.run(context))
            .await
            .unwrap()
            .unwrap_err();

        assert!(err.to_string().contains("Unable to persist line offset 1"));
        assert_eq!(outcome.await.unwrap(), StartupOutcome::Started);
        // Nothing after the first batch was read.
        assert_eq!(consumer.records.load(Ordering::SeqCst), 1);
        assert_eq!(engine.committed_offset(), 0);
    }
}
