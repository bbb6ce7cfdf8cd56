//! # In-memory sync topic.
//!
//! A single-partition, totally ordered log held in process memory. Used by
//! the simulation tests and demos; production deployments plug a real log
//! client into the same port.
//!
//! ## Semantics
//! - One global order: offsets are indexes into the record vector.
//! - Per-consumer positions; consumers may seek anywhere.
//! - [`MemoryLogClient::halt`] makes that client's producers drop records
//!   silently, simulating a node whose publishes stopped reaching the
//!   cluster (crash or partition) while its consumer still works.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{LogClient, LogConsumer, LogError, LogProducer, LogRecord, Offset, StartPosition};

struct Shared {
    topic: String,
    records: Mutex<Vec<(String, String)>>,
    appended: Notify,
}

/// The topic itself. Cheap to clone handles off; see [`MemoryLog::client`].
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl MemoryLog {
    /// Creates an empty topic.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                topic: topic.into(),
                records: Mutex::new(Vec::new()),
                appended: Notify::new(),
            }),
        }
    }

    /// Creates a per-node client handle for this topic.
    ///
    /// Each node gets its own client so tests can halt one node's publishes
    /// without touching the others.
    pub fn client(&self) -> MemoryLogClient {
        MemoryLogClient {
            shared: Arc::clone(&self.shared),
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Snapshot of every record currently in the topic.
    pub fn records(&self) -> Vec<LogRecord> {
        let records = self.shared.records.lock().expect("log poisoned");
        records
            .iter()
            .enumerate()
            .map(|(i, (key, value))| LogRecord {
                offset: i as Offset,
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }
}

/// Per-node handle implementing [`LogClient`].
pub struct MemoryLogClient {
    shared: Arc<Shared>,
    halted: Arc<AtomicBool>,
}

impl MemoryLogClient {
    /// Makes every producer created from this client drop records from now
    /// on. The consumer side keeps working.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LogClient for MemoryLogClient {
    fn topic(&self) -> &str {
        &self.shared.topic
    }

    async fn producer(&self) -> Result<Box<dyn LogProducer>, LogError> {
        Ok(Box::new(MemoryProducer {
            shared: Arc::clone(&self.shared),
            halted: Arc::clone(&self.halted),
        }))
    }

    async fn consumer(&self, start: StartPosition) -> Result<Box<dyn LogConsumer>, LogError> {
        let position = match start {
            StartPosition::Earliest => 0,
            StartPosition::Latest => {
                let records = self.shared.records.lock().expect("log poisoned");
                records.len() as Offset
            }
        };
        Ok(Box::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            position,
        }))
    }
}

struct MemoryProducer {
    shared: Arc<Shared>,
    halted: Arc<AtomicBool>,
}

#[async_trait]
impl LogProducer for MemoryProducer {
    async fn send(&self, key: &str, value: String) -> Result<Offset, LogError> {
        let mut records = self.shared.records.lock().expect("log poisoned");
        if self.halted.load(Ordering::SeqCst) {
            // The record vanishes, as it would on a dead network path.
            return Ok(records.len() as Offset);
        }
        let offset = records.len() as Offset;
        records.push((key.to_string(), value));
        drop(records);
        self.shared.appended.notify_waiters();
        Ok(offset)
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    position: Offset,
}

impl MemoryConsumer {
    fn take_batch(&mut self) -> Vec<LogRecord> {
        let records = self.shared.records.lock().expect("log poisoned");
        let from = self.position as usize;
        if from >= records.len() {
            return Vec::new();
        }
        let batch: Vec<LogRecord> = records[from..]
            .iter()
            .enumerate()
            .map(|(i, (key, value))| LogRecord {
                offset: (from + i) as Offset,
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        self.position = records.len() as Offset;
        batch
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>, LogError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.appended.notified();
            tokio::pin!(notified);
            // Register before checking so an append between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            let batch = self.take_batch();
            if !batch.is_empty() {
                return Ok(batch);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    fn position(&self) -> Offset {
        self.position
    }

    fn seek(&mut self, offset: Offset) {
        self.position = offset;
    }

    async fn end_offset(&mut self) -> Result<Offset, LogError> {
        let records = self.shared.records.lock().expect("log poisoned");
        Ok(records.len() as Offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assigns_sequential_offsets() {
        let log = MemoryLog::new("sync");
        let client = log.client();
        let producer = client.producer().await.unwrap();
        assert_eq!(producer.send("t", "a".into()).await.unwrap(), 0);
        assert_eq!(producer.send("t", "b".into()).await.unwrap(), 1);
        assert_eq!(log.records().len(), 2);
    }

    #[tokio::test]
    async fn consumer_observes_in_order_from_earliest() {
        let log = MemoryLog::new("sync");
        let client = log.client();
        let producer = client.producer().await.unwrap();
        producer.send("t", "a".into()).await.unwrap();
        producer.send("t", "b".into()).await.unwrap();

        let mut consumer = client.consumer(StartPosition::Earliest).await.unwrap();
        let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        let values: Vec<&str> = batch.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, ["a", "b"]);
        assert_eq!(consumer.position(), 2);
    }

    #[tokio::test]
    async fn latest_consumer_skips_history() {
        let log = MemoryLog::new("sync");
        let client = log.client();
        let producer = client.producer().await.unwrap();
        producer.send("t", "old".into()).await.unwrap();

        let mut consumer = client.consumer(StartPosition::Latest).await.unwrap();
        producer.send("t", "new".into()).await.unwrap();
        let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, "new");
        assert_eq!(batch[0].offset, 1);
    }

    #[tokio::test]
    async fn poll_times_out_empty() {
        let log = MemoryLog::new("sync");
        let client = log.client();
        let mut consumer = client.consumer(StartPosition::Earliest).await.unwrap();
        let batch = consumer.poll(Duration::from_millis(5)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn halted_client_drops_records() {
        let log = MemoryLog::new("sync");
        let healthy = log.client();
        let crashed = log.client();
        let p1 = healthy.producer().await.unwrap();
        let p2 = crashed.producer().await.unwrap();

        crashed.halt();
        p2.send("t", "lost".into()).await.unwrap();
        p1.send("t", "kept".into()).await.unwrap();

        let values: Vec<String> = log.records().into_iter().map(|r| r.value).collect();
        assert_eq!(values, ["kept"]);
    }

    #[tokio::test]
    async fn seek_rewinds_for_replay() {
        let log = MemoryLog::new("sync");
        let client = log.client();
        let producer = client.producer().await.unwrap();
        producer.send("t", "a".into()).await.unwrap();
        producer.send("t", "b".into()).await.unwrap();

        let mut consumer = client.consumer(StartPosition::Latest).await.unwrap();
        assert_eq!(consumer.end_offset().await.unwrap(), 2);
        consumer.seek(0);
        let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 2);
    }
}
