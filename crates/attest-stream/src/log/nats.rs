//! NATS JetStream durable log
//!
//! Streams map to JetStream streams and durable consumers to explicit-ack
//! pull consumers, so consumer positions survive process restarts.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream, AckKind,
};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use super::{DurableLog, LogConsumer, LogMessage, StreamConfig};
use crate::error::{Result, StreamError};

/// JetStream-backed durable log
#[derive(Debug, Clone)]
pub struct NatsLog {
    context: jetstream::Context,
}

impl NatsLog {
    /// Connect to the NATS server at `url`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| StreamError::Log(format!("Failed to connect to {}: {}", url, e)))?;

        info!(url = %url, "Connected to NATS");
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        Self {
            context: jetstream::new(client),
        }
    }

    async fn stream(&self, name: &str) -> Result<stream::Stream> {
        self.context
            .get_stream(name)
            .await
            .map_err(|e| StreamError::NoStream(format!("{}: {}", name, e)))
    }
}

#[async_trait]
impl DurableLog for NatsLog {
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<()> {
        self.context
            .get_or_create_stream(stream::Config {
                name: config.name.clone(),
                subjects: config.subjects.clone(),
                max_age: config.max_age,
                ..Default::default()
            })
            .await
            .map_err(|e| StreamError::Log(e.to_string()))?;

        debug!(stream = %config.name, "Stream ready");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64> {
        let ack = self
            .context
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| StreamError::Log(e.to_string()))?
            .await
            .map_err(|e| StreamError::Log(e.to_string()))?;

        Ok(ack.sequence)
    }

    async fn attach_consumer(
        &self,
        stream: &str,
        durable: &str,
        filter_subject: &str,
    ) -> Result<Box<dyn LogConsumer>> {
        let consumer: PullConsumer = self
            .stream(stream)
            .await?
            .get_or_create_consumer(
                durable,
                pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: filter_subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| StreamError::Log(e.to_string()))?;

        info!(stream, durable, filter = filter_subject, "Attached JetStream consumer");
        Ok(Box::new(NatsConsumer {
            consumer,
            in_flight: HashMap::new(),
        }))
    }

    async fn detach_consumer(&self, stream: &str, durable: &str) -> Result<()> {
        // The durable consumer stays on the server; only check it exists
        let stream_handle = self.stream(stream).await?;
        stream_handle
            .consumer_info(durable)
            .await
            .map_err(|_| StreamError::ConsumerNotFound {
                stream: stream.to_string(),
                durable: durable.to_string(),
            })?;

        info!(stream, durable, "Detached JetStream consumer");
        Ok(())
    }
}

struct NatsConsumer {
    consumer: PullConsumer,
    /// Delivered messages awaiting ack or nak, by stream sequence
    in_flight: HashMap<u64, jetstream::Message>,
}

#[async_trait]
impl LogConsumer for NatsConsumer {
    async fn fetch(&mut self, max_wait: Duration) -> Result<Option<LogMessage>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| StreamError::Log(e.to_string()))?;

        let message = match batch.next().await {
            Some(message) => message.map_err(|e| StreamError::Log(e.to_string()))?,
            None => return Ok(None),
        };

        let (sequence, delivered) = {
            let info = message.info().map_err(|e| StreamError::Log(e.to_string()))?;
            (info.stream_sequence, info.delivered)
        };

        let log_message = LogMessage {
            subject: message.subject.to_string(),
            payload: message.payload.to_vec(),
            sequence,
            delivery_count: u64::try_from(delivered).unwrap_or_default(),
        };
        self.in_flight.insert(sequence, message);

        Ok(Some(log_message))
    }

    async fn ack(&mut self, message: &LogMessage) -> Result<()> {
        if let Some(delivered) = self.in_flight.remove(&message.sequence) {
            delivered
                .ack()
                .await
                .map_err(|e| StreamError::Log(e.to_string()))?;
        }
        Ok(())
    }

    async fn nak(&mut self, message: &LogMessage) -> Result<()> {
        if let Some(delivered) = self.in_flight.remove(&message.sequence) {
            delivered
                .ack_with(AckKind::Nak(None))
                .await
                .map_err(|e| StreamError::Log(e.to_string()))?;
        }
        Ok(())
    }
}
