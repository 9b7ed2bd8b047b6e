//! In-memory durable log
//!
//! Single-process implementation of [`DurableLog`] with the delivery rules of
//! a JetStream work stream: subject-filtered durable consumers, explicit
//! acknowledgement, redelivery after an ack wait, and age-based retention.
//! Several handles created with `clone()` share the same log, which lets
//! producers and consumers in one process (or one test) talk to each other.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{subject_matches, DurableLog, LogConsumer, LogMessage, StreamConfig};
use crate::error::{Result, StreamError};

/// Time a delivered message may stay unacknowledged before redelivery
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Shared in-memory durable log
#[derive(Debug, Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<LogState>,
    notify: Notify,
    ack_wait: Duration,
}

#[derive(Debug, Default)]
struct LogState {
    streams: HashMap<String, Stream>,
}

#[derive(Debug)]
struct Stream {
    config: StreamConfig,
    messages: VecDeque<StoredMessage>,
    last_sequence: u64,
    consumers: HashMap<String, Cursor>,
}

#[derive(Debug)]
struct StoredMessage {
    sequence: u64,
    subject: String,
    payload: Vec<u8>,
    published_at: Instant,
}

#[derive(Debug)]
struct Cursor {
    filter: String,
    /// Next sequence never delivered to this consumer
    next_sequence: u64,
    /// Delivered but unacknowledged, by sequence
    pending: BTreeMap<u64, Pending>,
    attached: bool,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    redeliver_at: Instant,
    deliveries: u64,
}

enum Next {
    Message(LogMessage),
    /// Nothing deliverable; the earliest pending redelivery, if any
    Wait(Option<Instant>),
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::with_ack_wait(DEFAULT_ACK_WAIT)
    }

    /// Create a log whose consumers redeliver after `ack_wait`
    pub fn with_ack_wait(ack_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState::default()),
                notify: Notify::new(),
                ack_wait,
            }),
        }
    }

    /// Number of retained messages in `stream`
    pub fn stream_len(&self, stream: &str) -> Option<usize> {
        let state = self.shared.lock();
        state.streams.get(stream).map(|s| s.messages.len())
    }

    /// Number of delivered but unacknowledged messages for a consumer
    pub fn pending_count(&self, stream: &str, durable: &str) -> Option<usize> {
        let state = self.shared.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .map(|c| c.pending.len())
    }

    /// Whether a reader is currently attached to the consumer
    pub fn is_attached(&self, stream: &str, durable: &str) -> bool {
        let state = self.shared.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .is_some_and(|c| c.attached)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next(&self, stream: &str, durable: &str) -> Result<Next> {
        let now = Instant::now();
        let mut state = self.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::NoStream(stream.to_string()))?;
        stream_state.prune(now);

        let Stream {
            messages,
            consumers,
            last_sequence,
            ..
        } = stream_state;
        let messages: &VecDeque<StoredMessage> = messages;

        let cursor = consumers
            .get_mut(durable)
            .filter(|c| c.attached)
            .ok_or_else(|| StreamError::ConsumerNotFound {
                stream: stream.to_string(),
                durable: durable.to_string(),
            })?;

        cursor.pending.retain(|sequence, _| lookup(messages, *sequence).is_some());

        let due = cursor
            .pending
            .iter()
            .find(|(_, p)| p.redeliver_at <= now)
            .map(|(sequence, _)| *sequence);

        if let Some(sequence) = due {
            if let (Some(pending), Some(stored)) =
                (cursor.pending.get_mut(&sequence), lookup(messages, sequence))
            {
                pending.deliveries += 1;
                pending.redeliver_at = now + self.ack_wait;
                debug!(stream, durable, sequence, deliveries = pending.deliveries, "Redelivering message");
                return Ok(Next::Message(stored.to_message(pending.deliveries)));
            }
        }

        let start = messages
            .front()
            .map_or(cursor.next_sequence, |m| cursor.next_sequence.max(m.sequence));
        let found = messages
            .iter()
            .skip_while(|m| m.sequence < start)
            .find(|m| subject_matches(&cursor.filter, &m.subject));

        match found {
            Some(stored) => {
                cursor.next_sequence = stored.sequence + 1;
                cursor.pending.insert(
                    stored.sequence,
                    Pending {
                        redeliver_at: now + self.ack_wait,
                        deliveries: 1,
                    },
                );
                Ok(Next::Message(stored.to_message(1)))
            }
            None => {
                cursor.next_sequence = *last_sequence + 1;
                let earliest = cursor.pending.values().map(|p| p.redeliver_at).min();
                Ok(Next::Wait(earliest))
            }
        }
    }

    fn with_cursor<T>(
        &self,
        stream: &str,
        durable: &str,
        f: impl FnOnce(&mut Cursor) -> T,
    ) -> Result<T> {
        let mut state = self.lock();
        let cursor = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::NoStream(stream.to_string()))?
            .consumers
            .get_mut(durable)
            .ok_or_else(|| StreamError::ConsumerNotFound {
                stream: stream.to_string(),
                durable: durable.to_string(),
            })?;
        Ok(f(cursor))
    }
}

impl Stream {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            messages: VecDeque::new(),
            last_sequence: 0,
            consumers: HashMap::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.messages.front() {
            if now.saturating_duration_since(front.published_at) <= self.config.max_age {
                break;
            }
            self.messages.pop_front();
        }
    }

    fn captures(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|filter| subject_matches(filter, subject))
    }
}

impl StoredMessage {
    fn to_message(&self, delivery_count: u64) -> LogMessage {
        LogMessage {
            subject: self.subject.clone(),
            payload: self.payload.clone(),
            sequence: self.sequence,
            delivery_count,
        }
    }
}

/// Retained messages are contiguous by sequence
fn lookup(messages: &VecDeque<StoredMessage>, sequence: u64) -> Option<&StoredMessage> {
    let first = messages.front()?.sequence;
    let offset = sequence.checked_sub(first)?;
    messages.get(usize::try_from(offset).ok()?)
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<()> {
        let mut state = self.shared.lock();
        if state.streams.contains_key(&config.name) {
            debug!(stream = %config.name, "Stream already exists");
            return Ok(());
        }

        state
            .streams
            .insert(config.name.clone(), Stream::new(config.clone()));
        info!(
            stream = %config.name,
            subjects = ?config.subjects,
            max_age_secs = config.max_age.as_secs(),
            "Created stream"
        );
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64> {
        let now = Instant::now();
        let sequence = {
            let mut state = self.shared.lock();
            let stream = state
                .streams
                .values_mut()
                .find(|s| s.captures(subject))
                .ok_or_else(|| StreamError::NoStream(subject.to_string()))?;

            stream.prune(now);
            stream.last_sequence += 1;
            stream.messages.push_back(StoredMessage {
                sequence: stream.last_sequence,
                subject: subject.to_string(),
                payload,
                published_at: now,
            });
            stream.last_sequence
        };

        self.shared.notify.notify_waiters();
        debug!(subject, sequence, "Published message");
        Ok(sequence)
    }

    async fn attach_consumer(
        &self,
        stream: &str,
        durable: &str,
        filter_subject: &str,
    ) -> Result<Box<dyn LogConsumer>> {
        let now = Instant::now();
        {
            let mut state = self.shared.lock();
            let stream_state = state
                .streams
                .get_mut(stream)
                .ok_or_else(|| StreamError::NoStream(stream.to_string()))?;

            match stream_state.consumers.get_mut(durable) {
                Some(cursor) => {
                    cursor.attached = true;
                    cursor.filter = filter_subject.to_string();
                    for pending in cursor.pending.values_mut() {
                        pending.redeliver_at = now;
                    }
                    info!(stream, durable, pending = cursor.pending.len(), "Reattached consumer");
                }
                None => {
                    stream_state.consumers.insert(
                        durable.to_string(),
                        Cursor {
                            filter: filter_subject.to_string(),
                            next_sequence: 1,
                            pending: BTreeMap::new(),
                            attached: true,
                        },
                    );
                    info!(stream, durable, filter = filter_subject, "Created consumer");
                }
            }
        }

        self.shared.notify.notify_waiters();
        Ok(Box::new(MemoryConsumer {
            shared: self.shared.clone(),
            stream: stream.to_string(),
            durable: durable.to_string(),
        }))
    }

    async fn detach_consumer(&self, stream: &str, durable: &str) -> Result<()> {
        self.shared.with_cursor(stream, durable, |cursor| cursor.attached = false)?;
        self.shared.notify.notify_waiters();
        info!(stream, durable, "Detached consumer");
        Ok(())
    }
}

/// Reader handle returned by [`MemoryLog::attach_consumer`]
struct MemoryConsumer {
    shared: Arc<Shared>,
    stream: String,
    durable: String,
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn fetch(&mut self, max_wait: Duration) -> Result<Option<LogMessage>> {
        let deadline = Instant::now() + max_wait;

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.shared.next(&self.stream, &self.durable)? {
                Next::Message(message) => return Ok(Some(message)),
                Next::Wait(redelivery) => redelivery.map_or(deadline, |at| at.min(deadline)),
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&mut self, message: &LogMessage) -> Result<()> {
        self.shared.with_cursor(&self.stream, &self.durable, |cursor| {
            cursor.pending.remove(&message.sequence);
        })
    }

    async fn nak(&mut self, message: &LogMessage) -> Result<()> {
        let now = Instant::now();
        self.shared.with_cursor(&self.stream, &self.durable, |cursor| {
            if let Some(pending) = cursor.pending.get_mut(&message.sequence) {
                pending.redeliver_at = now;
            }
        })?;
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::ONE_YEAR;

    const WAIT: Duration = Duration::from_millis(200);

    async fn log_with_stream() -> MemoryLog {
        let log = MemoryLog::new();
        log.ensure_stream(&StreamConfig::for_domain("ATTESTATION", ONE_YEAR))
            .await
            .unwrap();
        log
    }

    #[tokio::test]
    async fn test_publish_requires_stream() {
        let log = MemoryLog::new();
        let result = log.publish("ATTESTATION.harbor", b"x".to_vec()).await;
        assert!(matches!(result, Err(StreamError::NoStream(_))));
    }

    #[tokio::test]
    async fn test_ensure_stream_is_idempotent() {
        let log = log_with_stream().await;
        log.publish("ATTESTATION.harbor", b"x".to_vec()).await.unwrap();
        log.ensure_stream(&StreamConfig::for_domain("ATTESTATION", ONE_YEAR))
            .await
            .unwrap();
        assert_eq!(log.stream_len("ATTESTATION"), Some(1));
    }

    #[tokio::test]
    async fn test_consumer_reads_filtered_subject_in_order() {
        let log = log_with_stream().await;
        log.publish("ATTESTATION.harbor", b"1".to_vec()).await.unwrap();
        log.publish("ATTESTATION.other", b"2".to_vec()).await.unwrap();
        log.publish("ATTESTATION.harbor", b"3".to_vec()).await.unwrap();

        let mut consumer = log
            .attach_consumer("ATTESTATION", "harbor", "ATTESTATION.harbor")
            .await
            .unwrap();

        let first = consumer.fetch(WAIT).await.unwrap().unwrap();
        assert_eq!(first.payload, b"1");
        assert_eq!(first.sequence, 1);
        consumer.ack(&first).await.unwrap();

        let second = consumer.fetch(WAIT).await.unwrap().unwrap();
        assert_eq!(second.payload, b"3");
        consumer.ack(&second).await.unwrap();

        assert!(consumer.fetch(Duration::from_millis(20)).await.unwrap().is_none());
        assert_eq!(log.pending_count("ATTESTATION", "harbor"), Some(0));
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_publish() {
        let log = log_with_stream().await;
        let mut consumer = log
            .attach_consumer("ATTESTATION", "harbor", "ATTESTATION.harbor")
            .await
            .unwrap();

        let producer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer
                .publish("ATTESTATION.harbor", b"late".to_vec())
                .await
                .unwrap();
        });

        let message = consumer.fetch(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(message.payload, b"late");
    }

    #[tokio::test]
    async fn test_nak_redelivers_immediately() {
        let log = log_with_stream().await;
        log.publish("ATTESTATION.harbor", b"x".to_vec()).await.unwrap();
        let mut consumer = log
            .attach_consumer("ATTESTATION", "harbor", "ATTESTATION.harbor")
            .await
            .unwrap();

        let first = consumer.fetch(WAIT).await.unwrap().unwrap();
        consumer.nak(&first).await.unwrap();

        let again = consumer.fetch(WAIT).await.unwrap().unwrap();
        assert_eq!(again.sequence, first.sequence);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_unacked_message_redelivered_after_ack_wait() {
        let log = MemoryLog::with_ack_wait(Duration::from_millis(50));
        log.ensure_stream(&StreamConfig::for_domain("ATTESTATION", ONE_YEAR))
            .await
            .unwrap();
        log.publish("ATTESTATION.harbor", b"x".to_vec()).await.unwrap();
        let mut consumer = log
            .attach_consumer("ATTESTATION", "harbor", "ATTESTATION.harbor")
            .await
            .unwrap();

        let first = consumer.fetch(WAIT).await.unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);

        let again = consumer.fetch(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(again.sequence, first.sequence);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_reattach_resumes_and_redelivers_pending() {
        let log = log_with_stream().await;
        for payload in [b"1", b"2", b"3"] {
            log.publish("ATTESTATION.harbor", payload.to_vec()).await.unwrap();
        }

        let mut consumer = log
            .attach_consumer("ATTESTATION", "harbor", "ATTESTATION.harbor")
            .await
            .unwrap();
        let first = consumer.fetch(WAIT).await.unwrap().unwrap();
        consumer.ack(&first).await.unwrap();
        let unacked = consumer.fetch(WAIT).await.unwrap().unwrap();
        assert_eq!(unacked.payload, b"2");

        log.detach_consumer("ATTESTATION", "harbor").await.unwrap();
        assert!(!log.is_attached("ATTESTATION", "harbor"));
        assert!(matches!(
            consumer.fetch(WAIT).await,
            Err(StreamError::ConsumerNotFound { .. })
        ));

        let mut consumer = log
            .attach_consumer("ATTESTATION", "harbor", "ATTESTATION.harbor")
            .await
            .unwrap();
        let redelivered = consumer.fetch(WAIT).await.unwrap().unwrap();
        assert_eq!(redelivered.payload, b"2");
        assert_eq!(redelivered.delivery_count, 2);
        consumer.ack(&redelivered).await.unwrap();

        let next = consumer.fetch(WAIT).await.unwrap().unwrap();
        assert_eq!(next.payload, b"3");
    }

    #[tokio::test]
    async fn test_expired_messages_are_not_delivered() {
        let log = MemoryLog::new();
        log.ensure_stream(&StreamConfig::for_domain("ATTESTATION", Duration::from_millis(10)))
            .await
            .unwrap();
        log.publish("ATTESTATION.harbor", b"old".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut consumer = log
            .attach_consumer("ATTESTATION", "harbor", "ATTESTATION.harbor")
            .await
            .unwrap();
        assert!(consumer.fetch(Duration::from_millis(20)).await.unwrap().is_none());
        assert_eq!(log.stream_len("ATTESTATION"), Some(0));
    }

    #[tokio::test]
    async fn test_attach_requires_stream() {
        let log = MemoryLog::new();
        let result = log.attach_consumer("MISSING", "harbor", "MISSING.harbor").await;
        assert!(matches!(result, Err(StreamError::NoStream(_))));
    }
}
