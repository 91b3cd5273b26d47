//! Queue module for RabbitMQ topology and job messages.
//!
//! This module provides:
//! - The retry tier table
//! - Topology derivation and declaration per binding
//! - The job payload type
//! - The channel operations workers use to republish and acknowledge
//!
//! ## Topology
//!
//! ```text
//! producer → {exchange} → {queue} → worker ─┬→ {exchange}.dlx.<tier> ─(ttl)→ {exchange}
//!                                           └→ {exchange}.fail
//! ```

pub mod publisher;
pub mod tier;
pub mod topology;
pub mod types;

pub use publisher::JobChannel;
pub use tier::{Tier, DELAYED_TIERS, ESCALATION_LADDER, OVERLIMIT_LADDER};
pub use topology::{declare, Binding, ExchangeType, QueueDescriptor, TopologyChannel};
pub use types::{Job, JobError};
