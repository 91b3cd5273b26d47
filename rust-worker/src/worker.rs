//! Worker pool draining one binding's primary queue.
//!
//! Each worker owns its channel and handles deliveries strictly one at a
//! time: decode, hand to the sender, wait for the verdict, republish on
//! failure, then acknowledge. Concurrency is therefore bounded by the number
//! of workers, and prefetch bounds how many unacknowledged jobs each worker
//! holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection,
};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{ConfigurationError, DeliveryError};
use crate::queue::{Binding, Job, JobChannel, QueueDescriptor, Tier};
use crate::retry::{self, AbandonReason, Route};
use crate::sender::{self, Sender, Verdict};
use crate::supervisor::ConnectionHandle;

/// Prefetch budget for one worker.
///
/// With more senders than workers, each worker keeps three jobs per sender
/// share in flight so a sender never waits on the broker; otherwise one.
pub fn prefetch_count(total_senders: usize, total_workers: usize) -> u16 {
    if total_workers == 0 || total_senders <= total_workers {
        return 1;
    }
    u16::try_from((total_senders / total_workers) * 3).unwrap_or(u16::MAX)
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The sender delivered the job
    Delivered,
    /// Republished to a delayed tier
    Retried(Tier),
    /// Republished to the failure queue
    Failed,
    /// Dropped without republishing
    Abandoned(AbandonReason),
    /// Payload was not a job; raw body sent to the failure queue
    Malformed,
    /// A republish was attempted and did not reach the broker
    PublishFailed,
}

/// Per-pool counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    received: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    malformed: AtomicU64,
    publish_failed: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub malformed: u64,
    pub publish_failed: u64,
}

impl PoolStats {
    fn record(&self, outcome: Outcome) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Delivered => &self.delivered,
            Outcome::Retried(_) => &self.retried,
            Outcome::Failed => &self.failed,
            Outcome::Abandoned(_) => &self.abandoned,
            Outcome::Malformed => &self.malformed,
            Outcome::PublishFailed => &self.publish_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
        }
    }
}

/// Handle one delivery end to end and acknowledge it exactly once.
pub async fn handle_delivery<C>(
    channel: &C,
    binding: &Binding,
    sender: &dyn Sender,
    stats: &PoolStats,
    delivery_tag: u64,
    data: &[u8],
) -> Outcome
where
    C: JobChannel + ?Sized,
{
    let outcome = process(channel, binding, sender, delivery_tag, data).await;
    stats.record(outcome);

    // Always ack: by now the job is either done or sits in another queue.
    if let Err(e) = channel.ack(delivery_tag).await {
        error!(binding = %binding.name, delivery_tag, error = %e, "rabbitmq_ack_failed");
    }

    outcome
}

async fn process<C>(
    channel: &C,
    binding: &Binding,
    sender: &dyn Sender,
    delivery_tag: u64,
    data: &[u8],
) -> Outcome
where
    C: JobChannel + ?Sized,
{
    let mut job = match Job::from_slice(data) {
        Ok(job) => job,
        Err(e) => {
            let e = DeliveryError::Malformed(e);
            warn!(
                binding = %binding.name,
                delivery_tag,
                error = %e,
                body_preview = %String::from_utf8_lossy(&data[..data.len().min(500)]),
                "job_parse_failed"
            );
            let failure = binding.failure();
            if let Err(e) = channel.publish(&failure.exchange, &failure.routing_key, data).await {
                error!(binding = %binding.name, delivery_tag, error = %e, "job_quarantine_failed");
                return Outcome::PublishFailed;
            }
            return Outcome::Malformed;
        }
    };

    info!(
        binding = %binding.name,
        job_id = job.id,
        recipient = %job.recipient,
        hostname = %job.hostname,
        tier = %job.tier,
        "job_received"
    );

    let (error, overlimit) = match sender::send(sender, &job).await {
        Verdict::Delivered => {
            info!(binding = %binding.name, job_id = job.id, "job_delivered");
            return Outcome::Delivered;
        }
        Verdict::Failed { error, overlimit } => (error, overlimit),
    };

    job.error = error;
    job.overlimit = overlimit;

    match retry::route(job.tier, overlimit, job.error.as_ref()) {
        Ok(route) => republish(channel, binding, &mut job, route).await,
        Err(reason) => {
            warn!(
                binding = %binding.name,
                job_id = job.id,
                tier = %job.tier,
                overlimit,
                error_code = job.error.as_ref().map(|e| e.code),
                reason = %reason,
                "job_abandoned"
            );
            Outcome::Abandoned(reason)
        }
    }
}

async fn republish<C>(channel: &C, binding: &Binding, job: &mut Job, route: Route) -> Outcome
where
    C: JobChannel + ?Sized,
{
    let (target, outcome): (Option<&QueueDescriptor>, Outcome) = match route {
        Route::Delayed(tier) => (binding.delayed(tier), Outcome::Retried(tier)),
        Route::Failure => (Some(binding.failure()), Outcome::Failed),
    };

    let Some(target) = target else {
        error!(binding = %binding.name, job_id = job.id, route = ?route, "job_target_missing");
        return Outcome::PublishFailed;
    };

    if let Outcome::Retried(tier) = outcome {
        job.tier = tier;
    }

    let body = match job.to_vec() {
        Ok(body) => body,
        Err(source) => {
            let e = DeliveryError::Serialize { job_id: job.id, source };
            error!(binding = %binding.name, error = %e, "job_encode_failed");
            return Outcome::PublishFailed;
        }
    };

    if let Err(e) = channel.publish(&target.exchange, &target.routing_key, &body).await {
        warn!(
            binding = %binding.name,
            job_id = job.id,
            queue = %target.queue,
            error = %e,
            "job_republish_failed"
        );
        return Outcome::PublishFailed;
    }

    match outcome {
        Outcome::Retried(tier) => info!(
            binding = %binding.name,
            job_id = job.id,
            tier = %tier,
            overlimit = job.overlimit,
            queue = %target.queue,
            "job_retried"
        ),
        _ => info!(
            binding = %binding.name,
            job_id = job.id,
            error_code = job.error.as_ref().map(|e| e.code),
            error_message = job.error.as_ref().map(|e| e.message.as_str()),
            queue = %target.queue,
            "job_failed"
        ),
    }

    outcome
}

/// Health view of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub binding: String,
    pub endpoint: String,
    pub workers: usize,
    pub prefetch: u16,
    pub stats: StatsSnapshot,
}

/// Workers for one binding.
#[derive(Clone)]
pub struct WorkerPool {
    binding: Arc<Binding>,
    connection: ConnectionHandle,
    sender: Arc<dyn Sender>,
    prefetch: u16,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    pub fn new(
        binding: Binding,
        connection: ConnectionHandle,
        sender: Arc<dyn Sender>,
        prefetch: u16,
    ) -> Self {
        Self {
            binding: Arc::new(binding),
            connection,
            sender,
            prefetch,
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Spawn one task per configured handler.
    pub fn spawn(&self, tasks: &mut JoinSet<Result<(), ConfigurationError>>) {
        for worker_id in 0..self.binding.handlers {
            let pool = self.clone();
            tasks.spawn(async move {
                let result = pool.run_worker(worker_id).await;
                if let Err(ref e) = result {
                    error!(binding = %pool.binding.name, worker_id, error = %e, "worker_terminated");
                }
                result
            });
        }

        info!(
            binding = %self.binding.name,
            workers = self.binding.handlers,
            prefetch = self.prefetch,
            "worker_pool_spawned"
        );
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            binding: self.binding.name.clone(),
            endpoint: self.connection.endpoint().to_string(),
            workers: self.binding.handlers,
            prefetch: self.prefetch,
            stats: self.stats.snapshot(),
        }
    }

    async fn open_channel(&self, connection: &Connection) -> Result<Channel, ConfigurationError> {
        let endpoint = self.connection.endpoint().to_string();
        let channel = connection
            .create_channel()
            .await
            .map_err(|source| ConfigurationError::Channel {
                endpoint: endpoint.clone(),
                step: "open",
                source,
            })?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|source| ConfigurationError::Channel {
                endpoint,
                step: "qos",
                source,
            })?;

        Ok(channel)
    }

    async fn run_worker(&self, worker_id: usize) -> Result<(), ConfigurationError> {
        let mut handle = self.connection.clone();
        let queue = &self.binding.primary.queue;
        let consumer_tag = format!("{}-{}", self.binding.name, worker_id);

        loop {
            let connection = handle.current();
            let channel = self.open_channel(&connection).await?;

            let mut consumer = channel
                .basic_consume(
                    queue,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|source| ConfigurationError::Channel {
                    endpoint: handle.endpoint().to_string(),
                    step: "consume",
                    source,
                })?;

            info!(binding = %self.binding.name, queue = %queue, worker_id, "rabbitmq_consumer_started");

            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        handle_delivery(
                            &channel,
                            &self.binding,
                            self.sender.as_ref(),
                            &self.stats,
                            delivery.delivery_tag,
                            &delivery.data,
                        )
                        .await;
                    }
                    Err(e) => {
                        error!(binding = %self.binding.name, worker_id, error = %e, "rabbitmq_delivery_error");
                        break;
                    }
                }
            }

            warn!(binding = %self.binding.name, worker_id, "rabbitmq_consumer_closed");

            let connected = connection.status().connected();
            if after_stream_end(&channel, &mut handle, &connection, connected).await == Resume::Stopped {
                info!(binding = %self.binding.name, worker_id, "worker_stopped");
                return Ok(());
            }
        }
    }
}

/// How a worker continues once its consumer stream has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    /// Connection is still up; consume again on a fresh channel
    Reopen,
    /// The supervisor published a new connection
    Replaced,
    /// The supervisor is gone
    Stopped,
}

async fn after_stream_end<T, C>(
    channel: &C,
    handle: &mut ConnectionHandle<T>,
    stale: &Arc<T>,
    connected: bool,
) -> Resume
where
    C: JobChannel + ?Sized,
{
    if connected {
        if let Err(e) = channel.close().await {
            warn!(endpoint = %handle.endpoint(), error = %e, "rabbitmq_channel_close_error");
        }
        return Resume::Reopen;
    }

    handle.report_lost(stale);
    match handle.replacement(stale).await {
        Some(_) => Resume::Replaced,
        None => Resume::Stopped,
    }
}
