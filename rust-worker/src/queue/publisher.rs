//! Publishing and acknowledging on a worker's channel.
//!
//! Workers talk to the broker through [`JobChannel`] so the per-delivery
//! logic can run against an in-memory channel in tests.

use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicPublishOptions},
    BasicProperties, Channel,
};

use crate::error::DeliveryError;

/// AMQP delivery mode for non-persistent messages.
const TRANSIENT: u8 = 1;

/// Broker operations a worker performs on its channel.
#[async_trait]
pub trait JobChannel: Send + Sync {
    /// Publish a job body to an exchange.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), DeliveryError>;

    /// Acknowledge a single delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), DeliveryError>;

    /// Close the channel once its consumer has ended.
    async fn close(&self) -> Result<(), lapin::Error>;
}

/// Properties stamped on every republished job.
pub fn job_properties() -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(TRANSIENT)
        .with_content_type("application/json".into())
}

#[async_trait]
impl JobChannel for Channel {
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), DeliveryError> {
        let to_error = |source| DeliveryError::Publish {
            exchange: exchange.to_string(),
            source,
        };

        self.basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            body,
            job_properties(),
        )
        .await
        .map_err(to_error)?
        .await
        .map_err(to_error)?;

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), DeliveryError> {
        self.basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|source| DeliveryError::Ack {
                delivery_tag,
                source,
            })
    }

    async fn close(&self) -> Result<(), lapin::Error> {
        Channel::close(self, 200, "Consumer ended").await
    }
}
