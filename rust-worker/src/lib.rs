//! Mailroute - retry routing for a queue-backed mail dispatch pipeline.
//!
//! This library provides the pieces used by the `mailroute-worker` binary:
//! - `queue`: retry tiers, per-binding queue topology, job payloads
//! - `retry`: the decision of where a failed job goes next
//! - `supervisor`: broker connections and reconnection
//! - `worker`: worker pools that drain a binding's primary queue
//! - `sender`: hand-off to the external sender service
//!
//! ## Architecture
//!
//! ```text
//! {exchange} → Worker → Sender
//!                 │ failure
//!                 ├→ {exchange}.dlx.<tier> ─(ttl)→ {exchange}
//!                 └→ {exchange}.fail
//! ```

pub mod config;
pub mod error;
pub mod queue;
pub mod retry;
pub mod sender;
pub mod supervisor;
pub mod web;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, ConsumersConfig};
pub use error::{ConfigurationError, DeliveryError};
pub use queue::{Binding, Job, JobError, Tier};
pub use retry::{route, Route};
pub use sender::{HttpSender, Sender, Verdict};
pub use supervisor::{ConnectionHandle, ConnectionSupervisor};
pub use worker::WorkerPool;
