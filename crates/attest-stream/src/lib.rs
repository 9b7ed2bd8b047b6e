//! # Attest Stream
//!
//! Durable event stream for attestations. Producers publish every persisted
//! attestation; enforcement processes subscribe per attester and record what
//! they receive in their local fact store.
//!
//! ## Components
//!
//! - [`DurableLog`]: subject-addressed streams with durable, explicitly
//!   acknowledged consumers. [`MemoryLog`] runs in process; `NatsLog`
//!   (feature `nats`) uses NATS JetStream.
//! - [`EventManager`]: publishes attestations and runs one reference-counted
//!   reader per subscribed attester.

pub mod error;
pub mod log;
pub mod manager;

pub use error::{Result, StreamError};
pub use log::{DurableLog, LogConsumer, LogMessage, MemoryLog, StreamConfig, ONE_YEAR};
#[cfg(feature = "nats")]
pub use log::NatsLog;
pub use manager::{ConsumerPhase, EventManager, EventManagerConfig, DEFAULT_DOMAIN};
