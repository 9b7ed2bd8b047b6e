//! Event manager
//!
//! Publishes attestations to one durable stream per domain (subject
//! `<domain>.<attester>`) and runs one reader per subscribed attester.
//! Subscriptions are reference counted: every subscriber of an attester shares
//! the same durable consumer and read loop, which starts on the first
//! subscription and is drained when the last one goes away.
//!
//! Per attester the consumer moves through
//! `NoConsumer -> Active -> Draining -> NoConsumer`. Transitions for one
//! attester are serialized; different attesters never wait on each other.
//! A slot back in `NoConsumer` with no waiting subscriber is forgotten.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use attest_core::{AttestError, AttestationMessage, AttestationPublisher, Occurrence, OccurrenceStore};

use crate::error::{Result, StreamError};
use crate::log::{DurableLog, LogConsumer, LogMessage, StreamConfig, ONE_YEAR};

/// Default stream name and subject prefix
pub const DEFAULT_DOMAIN: &str = "ATTESTATION";

/// Pause after a failed fetch before trying again
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Event manager configuration
#[derive(Debug, Clone)]
pub struct EventManagerConfig {
    /// Stream name and subject prefix
    pub domain: String,
    /// Longest a single fetch waits for a message
    pub fetch_wait: Duration,
    /// Stream retention
    pub max_age: Duration,
}

impl Default for EventManagerConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            fetch_wait: Duration::from_secs(1),
            max_age: ONE_YEAR,
        }
    }
}

/// Lifecycle of an attester's consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerPhase {
    NoConsumer,
    Active,
    Draining,
}

#[derive(Debug)]
struct ConsumerSlot {
    /// Held for the whole of a subscribe or unsubscribe
    transition: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
}

#[derive(Debug)]
struct SlotState {
    ref_count: usize,
    phase: ConsumerPhase,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl ConsumerSlot {
    fn new() -> Self {
        Self {
            transition: tokio::sync::Mutex::new(()),
            state: Mutex::new(SlotState {
                ref_count: 0,
                phase: ConsumerPhase::NoConsumer,
                cancel: None,
                task: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Publish/subscribe façade over a durable log
#[derive(Debug)]
pub struct EventManager {
    log: Arc<dyn DurableLog>,
    /// Where consumed attestations are recorded
    sink: Arc<dyn OccurrenceStore>,
    config: EventManagerConfig,
    stream_ready: OnceCell<()>,
    slots: Mutex<HashMap<String, Arc<ConsumerSlot>>>,
}

impl EventManager {
    pub fn new(
        log: Arc<dyn DurableLog>,
        sink: Arc<dyn OccurrenceStore>,
        config: EventManagerConfig,
    ) -> Self {
        Self {
            log,
            sink,
            config,
            stream_ready: OnceCell::new(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EventManagerConfig {
        &self.config
    }

    /// Subject attestations from `attester` are published on
    pub fn subject(&self, attester: &str) -> String {
        format!("{}.{}", self.config.domain, attester)
    }

    async fn ensure_stream(&self) -> Result<()> {
        self.stream_ready
            .get_or_try_init(|| async {
                let config = StreamConfig::for_domain(&self.config.domain, self.config.max_age);
                self.log.ensure_stream(&config).await
            })
            .await?;
        Ok(())
    }

    /// Publish an attestation produced by `attester`.
    ///
    /// Succeeds whether or not anyone is subscribed. Returns the stream
    /// sequence of the message.
    pub async fn publish(&self, attester: &str, attestation: &Occurrence) -> Result<u64> {
        self.ensure_stream().await?;

        let payload = AttestationMessage::from_occurrence(attestation)?.to_bytes()?;
        let subject = self.subject(attester);
        let sequence = self.log.publish(&subject, payload).await?;

        debug!(
            attester = %attester,
            resource = %attestation.resource_uri(),
            sequence,
            "Published attestation"
        );
        Ok(sequence)
    }

    fn slot(&self, attester: &str) -> Arc<ConsumerSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(attester.to_string())
            .or_insert_with(|| Arc::new(ConsumerSlot::new()))
            .clone()
    }

    fn existing_slot(&self, attester: &str) -> Option<Arc<ConsumerSlot>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(attester).cloned()
    }

    /// Forget `attester`'s slot once it is idle and nobody else holds it.
    ///
    /// Slots are only handed out under the map lock, so a count of two (the
    /// map and `slot`) means no subscribe is waiting on its transition lock.
    fn release_slot(&self, attester: &str, slot: &Arc<ConsumerSlot>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = {
            let state = slot.state();
            state.ref_count == 0 && state.phase == ConsumerPhase::NoConsumer
        };
        let owned = slots.get(attester).is_some_and(|s| Arc::ptr_eq(s, slot));
        if idle && owned && Arc::strong_count(slot) == 2 {
            slots.remove(attester);
            debug!(attester = %attester, "Released consumer slot");
        }
    }

    /// Add a reference to `attester`'s consumer, starting it if this is the
    /// first one.
    ///
    /// On failure the reference is not taken.
    pub async fn subscribe(&self, attester: &str) -> Result<()> {
        let slot = self.slot(attester);
        let _transition = slot.transition.lock().await;

        let ref_count = {
            let mut state = slot.state();
            state.ref_count += 1;
            state.ref_count
        };
        if ref_count > 1 {
            debug!(attester = %attester, ref_count, "Consumer already running");
            return Ok(());
        }

        match self.start_consumer(attester).await {
            Ok((cancel, task)) => {
                let mut state = slot.state();
                state.phase = ConsumerPhase::Active;
                state.cancel = Some(cancel);
                state.task = Some(task);
                info!(attester = %attester, "Consumer started");
                Ok(())
            }
            Err(err) => {
                slot.state().ref_count -= 1;
                warn!(attester = %attester, error = %err, "Failed to start consumer");
                self.release_slot(attester, &slot);
                Err(err)
            }
        }
    }

    async fn start_consumer(&self, attester: &str) -> Result<(CancellationToken, JoinHandle<()>)> {
        self.ensure_stream().await?;
        let consumer = self
            .log
            .attach_consumer(&self.config.domain, attester, &self.subject(attester))
            .await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_consumer(
            attester.to_string(),
            consumer,
            self.sink.clone(),
            cancel.clone(),
            self.config.fetch_wait,
        ));
        Ok((cancel, task))
    }

    /// Drop a reference to `attester`'s consumer.
    ///
    /// The last reference cancels the read loop, waits for it to finish, then
    /// detaches the durable consumer. Calls without a matching subscription
    /// are ignored.
    pub async fn unsubscribe(&self, attester: &str) -> Result<()> {
        let Some(slot) = self.existing_slot(attester) else {
            warn!(attester = %attester, "Unsubscribe without subscription");
            return Ok(());
        };
        let _transition = slot.transition.lock().await;

        let (cancel, task) = {
            let mut state = slot.state();
            if state.ref_count == 0 {
                warn!(attester = %attester, "Unsubscribe without subscription");
                return Ok(());
            }
            state.ref_count -= 1;
            if state.ref_count > 0 {
                debug!(attester = %attester, ref_count = state.ref_count, "Consumer still referenced");
                return Ok(());
            }
            state.phase = ConsumerPhase::Draining;
            (state.cancel.take(), state.task.take())
        };

        self.drain(attester, &slot, cancel, task).await
    }

    async fn drain(
        &self,
        attester: &str,
        slot: &Arc<ConsumerSlot>,
        cancel: Option<CancellationToken>,
        task: Option<JoinHandle<()>>,
    ) -> Result<()> {
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(attester = %attester, error = %err, "Consumer task ended abnormally");
            }
        }

        let detached = self.log.detach_consumer(&self.config.domain, attester).await;
        slot.state().phase = ConsumerPhase::NoConsumer;
        self.release_slot(attester, slot);

        match &detached {
            Ok(()) => info!(attester = %attester, "Consumer drained"),
            Err(err) => warn!(attester = %attester, error = %err, "Consumer stopped but detach failed"),
        }
        detached
    }

    /// Stop every consumer regardless of outstanding references
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Arc<ConsumerSlot>)> = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.iter().map(|(n, s)| (n.clone(), s.clone())).collect()
        };

        for (attester, slot) in slots {
            let _transition = slot.transition.lock().await;
            let (cancel, task) = {
                let mut state = slot.state();
                if state.ref_count == 0 {
                    continue;
                }
                state.ref_count = 0;
                state.phase = ConsumerPhase::Draining;
                (state.cancel.take(), state.task.take())
            };
            // Errors are logged by drain
            let _ = self.drain(&attester, &slot, cancel, task).await;
        }
    }

    /// Outstanding subscriptions for `attester`
    pub fn reference_count(&self, attester: &str) -> usize {
        self.existing_slot(attester)
            .map_or(0, |slot| slot.state().ref_count)
    }

    pub fn phase(&self, attester: &str) -> ConsumerPhase {
        self.existing_slot(attester)
            .map_or(ConsumerPhase::NoConsumer, |slot| slot.state().phase)
    }

    /// Attesters with a running consumer, sorted by name
    pub fn active_consumers(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut active: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.state().phase == ConsumerPhase::Active)
            .map(|(name, _)| name.clone())
            .collect();
        active.sort();
        active
    }
}

#[async_trait]
impl AttestationPublisher for EventManager {
    async fn publish_attestation(
        &self,
        attester: &str,
        attestation: &Occurrence,
    ) -> attest_core::Result<()> {
        self.publish(attester, attestation)
            .await
            .map(|_| ())
            .map_err(AttestError::from)
    }
}

/// Read loop for one attester's consumer. Returns once `cancel` fires.
async fn run_consumer(
    attester: String,
    mut consumer: Box<dyn LogConsumer>,
    sink: Arc<dyn OccurrenceStore>,
    cancel: CancellationToken,
    fetch_wait: Duration,
) {
    debug!(attester = %attester, "Consumer loop started");

    loop {
        let fetched = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            fetched = consumer.fetch(fetch_wait) => fetched,
        };

        let message = match fetched {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(err) => {
                warn!(attester = %attester, error = %err, "Fetch failed");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(FETCH_RETRY_DELAY) => continue,
                }
            }
        };

        match deliver(sink.as_ref(), &message).await {
            Ok(()) => {
                if let Err(err) = consumer.ack(&message).await {
                    warn!(attester = %attester, sequence = message.sequence, error = %err, "Ack failed");
                }
            }
            Err(err) => {
                warn!(
                    attester = %attester,
                    sequence = message.sequence,
                    deliveries = message.delivery_count,
                    error = %err,
                    "Failed to record attestation, requesting redelivery"
                );
                if let Err(err) = consumer.nak(&message).await {
                    warn!(attester = %attester, sequence = message.sequence, error = %err, "Nak failed");
                }
            }
        }
    }

    debug!(attester = %attester, "Consumer loop stopped");
}

async fn deliver(sink: &dyn OccurrenceStore, message: &LogMessage) -> Result<()> {
    let occurrence = AttestationMessage::from_bytes(&message.payload)
        .and_then(AttestationMessage::into_occurrence)
        .map_err(|e| StreamError::Decode {
            subject: message.subject.clone(),
            message: e.to_string(),
        })?;

    sink.create_occurrences(vec![occurrence])
        .await
        .map_err(AttestError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use attest_core::occurrence::attester_note_name;
    use attest_core::{MemoryStore, StoreError};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const RESOURCE: &str = "repo/img@sha256:abc";

    /// MemoryLog that counts consumer attaches and detaches
    #[derive(Debug, Default)]
    struct CountingLog {
        inner: MemoryLog,
        attaches: AtomicUsize,
        detaches: AtomicUsize,
    }

    #[async_trait]
    impl DurableLog for CountingLog {
        async fn ensure_stream(&self, config: &StreamConfig) -> Result<()> {
            self.inner.ensure_stream(config).await
        }

        async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64> {
            self.inner.publish(subject, payload).await
        }

        async fn attach_consumer(
            &self,
            stream: &str,
            durable: &str,
            filter_subject: &str,
        ) -> Result<Box<dyn LogConsumer>> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            self.inner.attach_consumer(stream, durable, filter_subject).await
        }

        async fn detach_consumer(&self, stream: &str, durable: &str) -> Result<()> {
            self.detaches.fetch_add(1, Ordering::SeqCst);
            self.inner.detach_consumer(stream, durable).await
        }
    }

    fn config() -> EventManagerConfig {
        EventManagerConfig {
            fetch_wait: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn attestation(name: &str) -> Occurrence {
        let mut occurrence =
            Occurrence::attestation(RESOURCE, attester_note_name("harbor"), vec![1, 2, 3], "KEY");
        occurrence.name = format!("projects/attest-gate/occurrences/{}", name);
        occurrence.create_time = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        occurrence
    }

    async fn wait_for(store: &dyn OccurrenceStore, count: usize) {
        for _ in 0..200 {
            if store.list_occurrences(RESOURCE).await.unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} occurrences", count);
    }

    #[tokio::test]
    async fn test_subscribes_share_one_consumer() {
        let log = Arc::new(CountingLog::default());
        let manager = EventManager::new(log.clone(), Arc::new(MemoryStore::new()), config());

        for _ in 0..3 {
            manager.subscribe("harbor").await.unwrap();
        }

        assert_eq!(log.attaches.load(Ordering::SeqCst), 1);
        assert_eq!(manager.reference_count("harbor"), 3);
        assert_eq!(manager.phase("harbor"), ConsumerPhase::Active);
        assert_eq!(manager.active_consumers(), vec!["harbor".to_string()]);

        for expected in [2, 1] {
            manager.unsubscribe("harbor").await.unwrap();
            assert_eq!(manager.reference_count("harbor"), expected);
            assert_eq!(manager.phase("harbor"), ConsumerPhase::Active);
        }
        assert_eq!(log.detaches.load(Ordering::SeqCst), 0);

        manager.unsubscribe("harbor").await.unwrap();
        assert_eq!(manager.phase("harbor"), ConsumerPhase::NoConsumer);
        assert_eq!(log.detaches.load(Ordering::SeqCst), 1);
        assert!(manager.active_consumers().is_empty());
    }

    #[tokio::test]
    async fn test_extra_unsubscribes_are_ignored() {
        let log = Arc::new(CountingLog::default());
        let manager = EventManager::new(log.clone(), Arc::new(MemoryStore::new()), config());

        manager.unsubscribe("never-subscribed").await.unwrap();

        manager.subscribe("harbor").await.unwrap();
        manager.unsubscribe("harbor").await.unwrap();
        manager.unsubscribe("harbor").await.unwrap();
        manager.unsubscribe("harbor").await.unwrap();

        assert_eq!(manager.reference_count("harbor"), 0);
        assert_eq!(log.detaches.load(Ordering::SeqCst), 1);
    }

    fn tracked_slots(manager: &EventManager) -> usize {
        manager.slots.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_drained_slots_are_released() {
        let log = Arc::new(CountingLog::default());
        let manager = EventManager::new(log.clone(), Arc::new(MemoryStore::new()), config());

        for round in 0..3 {
            manager.subscribe(&format!("attester-{}", round)).await.unwrap();
        }
        manager.subscribe("attester-0").await.unwrap();
        assert_eq!(tracked_slots(&manager), 3);

        for round in 0..3 {
            manager.unsubscribe(&format!("attester-{}", round)).await.unwrap();
        }
        // attester-0 still has a subscriber
        assert_eq!(tracked_slots(&manager), 1);
        assert_eq!(manager.phase("attester-0"), ConsumerPhase::Active);

        manager.unsubscribe("attester-0").await.unwrap();
        assert_eq!(tracked_slots(&manager), 0);
        assert_eq!(manager.reference_count("attester-0"), 0);
        assert_eq!(manager.phase("attester-0"), ConsumerPhase::NoConsumer);

        // A fresh subscription starts a new consumer
        manager.subscribe("attester-0").await.unwrap();
        assert_eq!(log.attaches.load(Ordering::SeqCst), 4);
        assert_eq!(manager.active_consumers(), vec!["attester-0".to_string()]);
        manager.shutdown().await;
        assert_eq!(tracked_slots(&manager), 0);
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_start_one_loop() {
        let log = Arc::new(CountingLog::default());
        let manager = Arc::new(EventManager::new(
            log.clone(),
            Arc::new(MemoryStore::new()),
            config(),
        ));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.subscribe("harbor").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(log.attaches.load(Ordering::SeqCst), 1);
        assert_eq!(manager.reference_count("harbor"), 16);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let manager = EventManager::new(
            Arc::new(MemoryLog::new()),
            Arc::new(MemoryStore::new()),
            config(),
        );

        assert_eq!(manager.publish("harbor", &attestation("1")).await.unwrap(), 1);
        assert_eq!(manager.publish("harbor", &attestation("2")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_publish_rejects_non_attestation() {
        let manager = EventManager::new(
            Arc::new(MemoryLog::new()),
            Arc::new(MemoryStore::new()),
            config(),
        );
        let discovery = Occurrence::discovery(
            RESOURCE,
            "notes/scan",
            attest_core::AnalysisStatus::FinishedSuccess,
        );

        let result = manager.publish("harbor", &discovery).await;
        assert!(matches!(
            result,
            Err(StreamError::Core(AttestError::InvalidOccurrence(_)))
        ));
    }

    #[tokio::test]
    async fn test_consumed_attestations_reach_sink() {
        let sink = Arc::new(MemoryStore::new());
        let manager = EventManager::new(Arc::new(MemoryLog::new()), sink.clone(), config());

        let original = attestation("1");
        manager.publish("harbor", &original).await.unwrap();
        manager.publish("other", &attestation("2")).await.unwrap();
        manager.subscribe("harbor").await.unwrap();

        wait_for(sink.as_ref(), 1).await;
        let stored = sink.list_occurrences(RESOURCE).await.unwrap();
        assert_eq!(stored, vec![original]);

        manager.unsubscribe("harbor").await.unwrap();
    }

    #[tokio::test]
    async fn test_resubscribe_resumes_after_drain() {
        let sink = Arc::new(MemoryStore::new());
        let manager = EventManager::new(Arc::new(MemoryLog::new()), sink.clone(), config());

        manager.subscribe("harbor").await.unwrap();
        manager.publish("harbor", &attestation("1")).await.unwrap();
        wait_for(sink.as_ref(), 1).await;
        manager.unsubscribe("harbor").await.unwrap();

        manager.publish("harbor", &attestation("2")).await.unwrap();
        manager.subscribe("harbor").await.unwrap();
        wait_for(sink.as_ref(), 2).await;

        // Already-acknowledged messages are not delivered twice
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.len(), 2);
        manager.shutdown().await;
        assert_eq!(manager.phase("harbor"), ConsumerPhase::NoConsumer);
    }

    /// Store that fails the first `failures` creates
    #[derive(Debug)]
    struct FailingStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl OccurrenceStore for FailingStore {
        async fn create_occurrences(
            &self,
            occurrences: Vec<Occurrence>,
        ) -> std::result::Result<Vec<Occurrence>, StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Backend("unavailable".into()));
            }
            self.inner.create_occurrences(occurrences).await
        }

        async fn list_occurrences(
            &self,
            resource_uri: &str,
        ) -> std::result::Result<Vec<Occurrence>, StoreError> {
            self.inner.list_occurrences(resource_uri).await
        }
    }

    #[tokio::test]
    async fn test_failed_delivery_is_redelivered() {
        let sink = Arc::new(FailingStore {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(2),
        });
        let manager = EventManager::new(Arc::new(MemoryLog::new()), sink.clone(), config());

        manager.publish("harbor", &attestation("1")).await.unwrap();
        manager.subscribe("harbor").await.unwrap();

        wait_for(sink.as_ref(), 1).await;
        assert_eq!(sink.failures.load(Ordering::SeqCst), 0);
        assert_eq!(sink.inner.len(), 1);
        manager.unsubscribe("harbor").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_does_not_take_reference() {
        #[derive(Debug)]
        struct BrokenLog;

        #[async_trait]
        impl DurableLog for BrokenLog {
            async fn ensure_stream(&self, _config: &StreamConfig) -> Result<()> {
                Err(StreamError::Log("unreachable".into()))
            }

            async fn publish(&self, _subject: &str, _payload: Vec<u8>) -> Result<u64> {
                Err(StreamError::Log("unreachable".into()))
            }

            async fn attach_consumer(
                &self,
                _stream: &str,
                _durable: &str,
                _filter_subject: &str,
            ) -> Result<Box<dyn LogConsumer>> {
                Err(StreamError::Log("unreachable".into()))
            }

            async fn detach_consumer(&self, _stream: &str, _durable: &str) -> Result<()> {
                Ok(())
            }
        }

        let manager = EventManager::new(Arc::new(BrokenLog), Arc::new(MemoryStore::new()), config());

        assert!(manager.subscribe("harbor").await.is_err());
        assert_eq!(manager.reference_count("harbor"), 0);
        assert_eq!(manager.phase("harbor"), ConsumerPhase::NoConsumer);
        assert_eq!(tracked_slots(&manager), 0);

        let published = manager.publish_attestation("harbor", &attestation("1")).await;
        assert!(matches!(published, Err(AttestError::Publish(_))));
    }
}
