//! Error types.
//!
//! Two kinds of failure are kept apart on purpose:
//! - [`ConfigurationError`]: the deployment is broken (broker unreachable,
//!   topology cannot be declared, bad consumer file). These propagate to
//!   `main` and terminate the process.
//! - [`DeliveryError`]: a single message could not be handled. These are
//!   logged by the worker, which then moves on to the next delivery.

use std::path::PathBuf;

use thiserror::Error;

use crate::queue::Tier;

/// Unrecoverable startup or supervision failure.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Could not read the consumer topology file.
    #[error("failed to read consumer config {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The consumer topology file is not valid TOML for our schema.
    #[error("failed to parse consumer config: {0}")]
    ParseConfig(#[from] toml::de::Error),

    /// The consumer topology file parsed but describes something unusable.
    #[error("invalid consumer config: {message}")]
    Invalid { message: String },

    /// Initial dial of a broker endpoint failed.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: lapin::Error,
    },

    /// Redial after an unexpected connection close failed.
    #[error("failed to reconnect to {endpoint}: {source}")]
    Reconnect {
        endpoint: String,
        #[source]
        source: lapin::Error,
    },

    /// Opening or configuring a channel failed.
    #[error("channel setup failed for {endpoint} ({step}): {source}")]
    Channel {
        endpoint: String,
        step: &'static str,
        #[source]
        source: lapin::Error,
    },

    /// Declaring or binding an exchange or queue failed.
    #[error("failed to declare {object} `{name}`: {source}")]
    Declare {
        object: &'static str,
        name: String,
        #[source]
        source: lapin::Error,
    },

    /// A built binding is missing one of its delayed tiers.
    #[error("binding `{binding}` has no delayed queue for tier {tier}")]
    MissingTier { binding: String, tier: Tier },

    /// A binding refers to an endpoint the supervisor does not own.
    #[error("no connection registered for endpoint {endpoint}")]
    UnknownEndpoint { endpoint: String },

    /// A supervised task panicked or was cancelled.
    #[error("{task} task failed: {message}")]
    TaskFailed { task: &'static str, message: String },
}

impl ConfigurationError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Per-message failure. Never fatal.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The delivery body is not a valid job.
    #[error("malformed job payload: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The job could not be serialized for republishing.
    #[error("failed to serialize job {job_id}: {source}")]
    Serialize {
        job_id: u64,
        #[source]
        source: serde_json::Error,
    },

    /// Publishing to an exchange failed.
    #[error("failed to publish to `{exchange}`: {source}")]
    Publish {
        exchange: String,
        #[source]
        source: lapin::Error,
    },

    /// Acknowledging a delivery failed.
    #[error("failed to ack delivery {delivery_tag}: {source}")]
    Ack {
        delivery_tag: u64,
        #[source]
        source: lapin::Error,
    },
}
