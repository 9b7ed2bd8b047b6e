//! Durable log abstraction
//!
//! A durable log holds named streams that capture messages by subject, and
//! named (durable) consumers that read a filtered view of a stream with
//! explicit acknowledgement. Unacknowledged messages are delivered again,
//! so delivery is at-least-once.
//!
//! Subjects are dot-separated tokens. Filters may use `*` to match exactly
//! one token and a trailing `>` to match one or more remaining tokens.

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use memory::MemoryLog;
#[cfg(feature = "nats")]
pub use nats::NatsLog;

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::Result;

/// Retention applied to attestation streams
pub const ONE_YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Definition of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    /// Subjects captured by the stream
    pub subjects: Vec<String>,
    /// Messages older than this are discarded
    pub max_age: Duration,
}

impl StreamConfig {
    /// A stream named `domain` capturing every `<domain>.*` subject
    pub fn for_domain(domain: &str, max_age: Duration) -> Self {
        Self {
            name: domain.to_string(),
            subjects: vec![format!("{}.*", domain)],
            max_age,
        }
    }
}

/// A message delivered to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Position in the stream, starting at 1
    pub sequence: u64,
    /// How many times this message has been delivered to the consumer
    pub delivery_count: u64,
}

/// Durable, subject-addressed message log
#[async_trait]
pub trait DurableLog: Send + Sync + Debug {
    /// Create `config.name` if it does not exist. Idempotent.
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<()>;

    /// Append to the stream capturing `subject`, returning the sequence
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64>;

    /// Create or reattach the durable consumer `durable` on `stream`.
    ///
    /// A new consumer starts at the beginning of the stream. A reattached
    /// consumer resumes where it left off, and messages it had not
    /// acknowledged become deliverable immediately.
    async fn attach_consumer(
        &self,
        stream: &str,
        durable: &str,
        filter_subject: &str,
    ) -> Result<Box<dyn LogConsumer>>;

    /// Release the reader attached to `durable`. The consumer's position is kept.
    async fn detach_consumer(&self, stream: &str, durable: &str) -> Result<()>;
}

/// Reader bound to one durable consumer
#[async_trait]
pub trait LogConsumer: Send {
    /// Wait up to `max_wait` for the next message
    async fn fetch(&mut self, max_wait: Duration) -> Result<Option<LogMessage>>;

    /// Acknowledge `message`; it will not be delivered again
    async fn ack(&mut self, message: &LogMessage) -> Result<()>;

    /// Reject `message` for prompt redelivery
    async fn nak(&mut self, message: &LogMessage) -> Result<()>;
}

/// Whether `subject` is matched by `filter`
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return filter_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
