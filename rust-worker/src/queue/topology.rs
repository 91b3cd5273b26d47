//! Queue topology for one logical binding.
//!
//! A binding expands into nine exchange/queue pairs:
//!
//! ```text
//! {exchange}                      primary, consumed by the worker pool
//! {exchange}.dlx.second ... .day  seven delayed tiers, TTL then dead-letter to primary
//! {exchange}.fail                 terminal failure queue for operators
//! ```
//!
//! Names and arguments are computed by [`Binding::build`] without touching the
//! broker; [`declare`] then issues the declarations through a
//! [`TopologyChannel`]. Any declaration failure is a [`ConfigurationError`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel, ExchangeKind,
};
use serde::Deserialize;
use tracing::{debug, info};

use super::tier::{Tier, DELAYED_TIERS};
use crate::config::BindingSpec;
use crate::error::ConfigurationError;

const FAIL_SUFFIX: &str = "fail";

/// Exchange type as written in the consumer config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    #[default]
    Fanout,
    Topic,
}

impl ExchangeType {
    pub fn kind(self) -> ExchangeKind {
        match self {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Topic => ExchangeKind::Topic,
        }
    }
}

/// One exchange/queue pair and the arguments its queue is declared with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub exchange: String,
    pub queue: String,
    pub kind: ExchangeType,
    pub routing_key: String,
    /// Message TTL; set on delayed tiers only
    pub ttl: Option<Duration>,
    /// Where expired messages go; the primary exchange for delayed tiers
    pub dead_letter_exchange: Option<String>,
}

impl QueueDescriptor {
    /// `x-` arguments for the queue declaration.
    pub fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from("x-message-ttl"),
                AMQPValue::LongLongInt(ttl.as_millis() as i64),
            );
        }
        if let Some(dlx) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from(dlx.as_str())),
            );
        }
        args
    }
}

/// A binding with its full derived topology.
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    /// Number of workers draining the primary queue
    pub handlers: usize,
    pub primary: QueueDescriptor,
    delayed: BTreeMap<Tier, QueueDescriptor>,
    failure: QueueDescriptor,
}

impl Binding {
    /// Derive every queue of the binding from its configuration.
    pub fn build(spec: &BindingSpec) -> Self {
        let primary = QueueDescriptor {
            exchange: spec.exchange.clone(),
            queue: spec.queue.clone(),
            kind: spec.kind,
            routing_key: spec.routing_key.clone(),
            ttl: None,
            dead_letter_exchange: None,
        };

        let delayed = DELAYED_TIERS
            .iter()
            .filter_map(|&tier| {
                let suffix = tier.suffix()?;
                Some((
                    tier,
                    QueueDescriptor {
                        exchange: format!("{}.{}", primary.exchange, suffix),
                        queue: format!("{}.{}", primary.queue, suffix),
                        ttl: tier.delay(),
                        dead_letter_exchange: Some(primary.exchange.clone()),
                        ..primary.clone()
                    },
                ))
            })
            .collect();

        let failure = QueueDescriptor {
            exchange: format!("{}.{}", primary.exchange, FAIL_SUFFIX),
            queue: format!("{}.{}", primary.queue, FAIL_SUFFIX),
            ..primary.clone()
        };

        Self {
            name: spec.name.clone(),
            handlers: spec.handlers,
            primary,
            delayed,
            failure,
        }
    }

    /// Delayed queue for a tier. `Tier::None` has none.
    pub fn delayed(&self, tier: Tier) -> Option<&QueueDescriptor> {
        self.delayed.get(&tier)
    }

    pub fn failure(&self) -> &QueueDescriptor {
        &self.failure
    }

    /// Primary, delayed and failure queues in declaration order.
    pub fn queues(&self) -> impl Iterator<Item = &QueueDescriptor> {
        std::iter::once(&self.primary)
            .chain(self.delayed.values())
            .chain(std::iter::once(&self.failure))
    }

    /// Check that every delayed tier is present.
    pub fn verify(&self) -> Result<(), ConfigurationError> {
        match DELAYED_TIERS.iter().find(|tier| !self.delayed.contains_key(tier)) {
            Some(&tier) => Err(ConfigurationError::MissingTier {
                binding: self.name.clone(),
                tier,
            }),
            None => Ok(()),
        }
    }
}

/// Broker operations needed to declare a topology.
#[async_trait]
pub trait TopologyChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), lapin::Error>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), lapin::Error>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), lapin::Error>;
}

#[async_trait]
impl TopologyChannel for Channel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), lapin::Error> {
        self.exchange_declare(name, kind, options, FieldTable::default())
            .await
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), lapin::Error> {
        self.queue_declare(name, options, arguments).await.map(|_| ())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), lapin::Error> {
        self.queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
    }
}

/// Declare every exchange and queue of a binding and bind them.
///
/// Stops at the first failed declaration.
pub async fn declare<C>(channel: &C, binding: &Binding) -> Result<(), ConfigurationError>
where
    C: TopologyChannel + ?Sized,
{
    binding.verify()?;

    for descriptor in binding.queues() {
        declare_one(channel, descriptor).await?;
    }

    info!(
        binding = %binding.name,
        exchange = %binding.primary.exchange,
        queue = %binding.primary.queue,
        queue_count = binding.queues().count(),
        "rabbitmq_topology_declared"
    );

    Ok(())
}

async fn declare_one<C>(channel: &C, descriptor: &QueueDescriptor) -> Result<(), ConfigurationError>
where
    C: TopologyChannel + ?Sized,
{
    channel
        .declare_exchange(
            &descriptor.exchange,
            descriptor.kind.kind(),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
        )
        .await
        .map_err(|source| ConfigurationError::Declare {
            object: "exchange",
            name: descriptor.exchange.clone(),
            source,
        })?;

    channel
        .declare_queue(
            &descriptor.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            descriptor.arguments(),
        )
        .await
        .map_err(|source| ConfigurationError::Declare {
            object: "queue",
            name: descriptor.queue.clone(),
            source,
        })?;

    channel
        .bind_queue(&descriptor.queue, &descriptor.exchange, &descriptor.routing_key)
        .await
        .map_err(|source| ConfigurationError::Declare {
            object: "binding",
            name: format!("{} -> {}", descriptor.exchange, descriptor.queue),
            source,
        })?;

    debug!(
        exchange = %descriptor.exchange,
        queue = %descriptor.queue,
        routing_key = %descriptor.routing_key,
        ttl_ms = ?descriptor.ttl.map(|ttl| ttl.as_millis()),
        "rabbitmq_queue_declared"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Declared {
        Exchange {
            name: String,
            durable: bool,
            auto_delete: bool,
            internal: bool,
            passive: bool,
        },
        Queue {
            name: String,
            durable: bool,
            exclusive: bool,
            auto_delete: bool,
            passive: bool,
            arguments: FieldTable,
        },
        Bind {
            queue: String,
            exchange: String,
            routing_key: String,
        },
    }

    /// Records declarations; optionally fails the n-th one (1-based).
    #[derive(Default)]
    struct RecordingTopology {
        declared: Mutex<Vec<Declared>>,
        fail_at: Option<usize>,
    }

    impl RecordingTopology {
        fn failing_at(n: usize) -> Self {
            Self {
                fail_at: Some(n),
                ..Default::default()
            }
        }

        fn record(&self, declared: Declared) -> Result<(), lapin::Error> {
            let mut log = self.declared.lock().unwrap();
            log.push(declared);
            if self.fail_at == Some(log.len()) {
                return Err(lapin::Error::ChannelsLimitReached);
            }
            Ok(())
        }

        fn declared(&self) -> Vec<Declared> {
            self.declared.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TopologyChannel for RecordingTopology {
        async fn declare_exchange(
            &self,
            name: &str,
            _kind: ExchangeKind,
            options: ExchangeDeclareOptions,
        ) -> Result<(), lapin::Error> {
            self.record(Declared::Exchange {
                name: name.to_string(),
                durable: options.durable,
                auto_delete: options.auto_delete,
                internal: options.internal,
                passive: options.passive,
            })
        }

        async fn declare_queue(
            &self,
            name: &str,
            options: QueueDeclareOptions,
            arguments: FieldTable,
        ) -> Result<(), lapin::Error> {
            self.record(Declared::Queue {
                name: name.to_string(),
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                passive: options.passive,
                arguments,
            })
        }

        async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), lapin::Error> {
            self.record(Declared::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            })
        }
    }

    fn spec(exchange: &str, queue: &str) -> BindingSpec {
        BindingSpec {
            name: exchange.to_string(),
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            kind: ExchangeType::Direct,
            routing_key: "outbound".to_string(),
            handlers: 2,
        }
    }

    #[test]
    fn test_build_yields_nine_queues() {
        let binding = Binding::build(&spec("mail", "mail.q"));
        let names: Vec<(&str, &str)> = binding
            .queues()
            .map(|d| (d.exchange.as_str(), d.queue.as_str()))
            .collect();

        assert_eq!(
            names,
            vec![
                ("mail", "mail.q"),
                ("mail.dlx.second", "mail.q.dlx.second"),
                ("mail.dlx.minute", "mail.q.dlx.minute"),
                ("mail.dlx.ten.minutes", "mail.q.dlx.ten.minutes"),
                ("mail.dlx.thirty.minutes", "mail.q.dlx.thirty.minutes"),
                ("mail.dlx.hour", "mail.q.dlx.hour"),
                ("mail.dlx.six.hours", "mail.q.dlx.six.hours"),
                ("mail.dlx.day", "mail.q.dlx.day"),
                ("mail.fail", "mail.q.fail"),
            ]
        );
        assert!(binding.verify().is_ok());
    }

    #[test]
    fn test_delayed_queues_dead_letter_to_primary() {
        let binding = Binding::build(&spec("mail", "mail"));

        for tier in DELAYED_TIERS {
            let delayed = binding.delayed(tier).unwrap();
            assert_eq!(delayed.dead_letter_exchange.as_deref(), Some("mail"));
            assert_eq!(delayed.ttl, tier.delay());
            assert_eq!(delayed.kind, ExchangeType::Direct);
            assert_eq!(delayed.routing_key, "outbound");
        }
        assert!(binding.delayed(Tier::None).is_none());
    }

    #[test]
    fn test_queue_arguments() {
        let binding = Binding::build(&spec("mail", "mail"));
        let args = binding.delayed(Tier::TenMinutes).unwrap().arguments();

        assert_eq!(
            args.inner().get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(600_000))
        );
        assert_eq!(
            args.inner().get(&ShortString::from("x-dead-letter-exchange")),
            Some(&AMQPValue::LongString(LongString::from("mail")))
        );
    }

    #[test]
    fn test_primary_and_failure_have_no_arguments() {
        let binding = Binding::build(&spec("mail", "mail"));

        assert!(binding.primary.arguments().inner().is_empty());
        assert!(binding.failure().arguments().inner().is_empty());
        assert_eq!(binding.failure().exchange, "mail.fail");
    }

    #[test]
    fn test_verify_reports_missing_tier() {
        let mut binding = Binding::build(&spec("mail", "mail"));
        binding.delayed.remove(&Tier::Hour);

        match binding.verify() {
            Err(ConfigurationError::MissingTier { binding, tier }) => {
                assert_eq!(binding, "mail");
                assert_eq!(tier, Tier::Hour);
            }
            other => panic!("expected MissingTier, got {other:?}"),
        }
    }

    #[test]
    fn test_exchange_type_kind() {
        assert_eq!(ExchangeType::default(), ExchangeType::Fanout);
        assert!(matches!(ExchangeType::Topic.kind(), ExchangeKind::Topic));
    }

    #[tokio::test]
    async fn test_declare_issues_durable_triples_in_order() {
        let binding = Binding::build(&spec("mail", "mail.q"));
        let channel = RecordingTopology::default();

        declare(&channel, &binding).await.unwrap();

        let declared = channel.declared();
        assert_eq!(declared.len(), 27);

        for (triple, descriptor) in declared.chunks(3).zip(binding.queues()) {
            assert_eq!(
                triple[0],
                Declared::Exchange {
                    name: descriptor.exchange.clone(),
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    passive: false,
                }
            );
            assert_eq!(
                triple[1],
                Declared::Queue {
                    name: descriptor.queue.clone(),
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    passive: false,
                    arguments: descriptor.arguments(),
                }
            );
            assert_eq!(
                triple[2],
                Declared::Bind {
                    queue: descriptor.queue.clone(),
                    exchange: descriptor.exchange.clone(),
                    routing_key: "outbound".to_string(),
                }
            );
        }
    }

    #[tokio::test]
    async fn test_declare_failure_is_fatal_and_stops() {
        let binding = Binding::build(&spec("mail", "mail.q"));
        let channel = RecordingTopology::failing_at(5);

        match declare(&channel, &binding).await {
            Err(ConfigurationError::Declare { object, name, .. }) => {
                assert_eq!(object, "queue");
                assert_eq!(name, "mail.q.dlx.second");
            }
            other => panic!("expected Declare, got {other:?}"),
        }
        assert_eq!(channel.declared().len(), 5, "nothing declared after the failure");
    }

    #[tokio::test]
    async fn test_declare_rejects_incomplete_binding() {
        let mut binding = Binding::build(&spec("mail", "mail"));
        binding.delayed.remove(&Tier::Day);
        let channel = RecordingTopology::default();

        assert!(matches!(
            declare(&channel, &binding).await,
            Err(ConfigurationError::MissingTier { tier: Tier::Day, .. })
        ));
        assert!(channel.declared().is_empty());
    }
}
