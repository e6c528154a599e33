//! Message bus seam: an at-least-once task queue plus fan-out topics.
//!
//! `AmqpBus` is the RabbitMQ transport used by the daemons. `MemoryBus`
//! keeps everything in process and honours delivery delays on the tokio
//! clock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
  BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
  ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_retry::Retry;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::retry_strategy;

/// Settles a received message.
#[async_trait]
pub trait Acknowledge: Send {
  /// Removes the message from the queue for good.
  async fn ack(self: Box<Self>) -> Result<()>;

  /// Makes the message available for redelivery.
  async fn reject(self: Box<Self>) -> Result<()>;
}

pub struct Envelope {
  pub body: Vec<u8>,
  receipt: Box<dyn Acknowledge>,
}

impl Envelope {
  pub fn new(body: Vec<u8>, receipt: Box<dyn Acknowledge>) -> Self {
    Self { body, receipt }
  }

  pub async fn ack(self) -> Result<()> {
    self.receipt.ack().await
  }

  pub async fn reject(self) -> Result<()> {
    self.receipt.reject().await
  }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
  /// Enqueues `body`; it becomes eligible for delivery once `delay` has
  /// elapsed.
  async fn send(&self, queue: &str, body: &[u8], delay: Duration) -> Result<()>;

  /// Long-polls `queue` for up to `wait`.
  async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Envelope>>;

  /// Fans `body` out to every queue subscribed to `topic`.
  async fn publish(&self, topic: &str, body: &[u8]) -> Result<()>;

  async fn subscribe(&self, topic: &str, queue: &str) -> Result<()>;
}

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel> {
  let conn = Retry::spawn(retry_strategy(), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub async fn publish_message(
  channel: &Channel,
  exchange: &str,
  routing_key: &str,
  payload: &[u8],
  properties: BasicProperties,
) -> Result<()> {
  Retry::spawn(retry_strategy(), || {
    let properties = properties.clone();
    async move {
      channel
        .basic_publish(exchange, routing_key, BasicPublishOptions::default(), payload, properties)
        .await
    }
  })
    .await?;
  Ok(())
}

fn message_properties() -> BasicProperties {
  BasicProperties::default()
    .with_content_type(ShortString::from("application/json"))
    .with_delivery_mode(2)
}

/// RabbitMQ transport. Delayed sends go through a `<queue>.delay` queue whose
/// messages dead-letter back into `<queue>` when their per-message TTL runs
/// out. Topics are fanout exchanges.
pub struct AmqpBus {
  channel: Channel,
  consumers: Mutex<HashMap<String, Consumer>>,
  declared: Mutex<HashSet<String>>,
}

impl AmqpBus {
  pub async fn connect(rabbitmq_url: &str) -> Result<Self> {
    let channel = create_rabbit_channel(rabbitmq_url).await?;
    // one unacked message per consumer so that work spreads across instances
    channel.basic_qos(1, BasicQosOptions::default()).await?;
    Ok(Self {
      channel,
      consumers: Mutex::new(HashMap::new()),
      declared: Mutex::new(HashSet::new()),
    })
  }

  async fn declare_queue(&self, queue: &str, arguments: FieldTable) -> Result<()> {
    let mut declared = self.declared.lock().await;
    if declared.contains(queue) {
      return Ok(());
    }
    self
      .channel
      .queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() }, arguments)
      .await?;
    debug!("Declared queue {}", queue);
    declared.insert(queue.to_string());
    Ok(())
  }

  async fn declare_delay_queue(&self, queue: &str) -> Result<String> {
    let delay_queue = format!("{}.delay", queue);
    let mut arguments = FieldTable::default();
    arguments.insert(
      ShortString::from("x-dead-letter-exchange"),
      AMQPValue::LongString(LongString::from("")),
    );
    arguments.insert(
      ShortString::from("x-dead-letter-routing-key"),
      AMQPValue::LongString(LongString::from(queue)),
    );
    self.declare_queue(&delay_queue, arguments).await?;
    Ok(delay_queue)
  }

  async fn declare_topic(&self, topic: &str) -> Result<()> {
    let key = format!("exchange:{}", topic);
    let mut declared = self.declared.lock().await;
    if declared.contains(&key) {
      return Ok(());
    }
    self
      .channel
      .exchange_declare(
        topic,
        ExchangeKind::Fanout,
        ExchangeDeclareOptions { durable: true, ..Default::default() },
        FieldTable::default(),
      )
      .await?;
    declared.insert(key);
    Ok(())
  }
}

struct AmqpReceipt {
  acker: Acker,
}

#[async_trait]
impl Acknowledge for AmqpReceipt {
  async fn ack(self: Box<Self>) -> Result<()> {
    self.acker.ack(BasicAckOptions::default()).await?;
    Ok(())
  }

  async fn reject(self: Box<Self>) -> Result<()> {
    self
      .acker
      .nack(BasicNackOptions { requeue: true, ..Default::default() })
      .await?;
    Ok(())
  }
}

#[async_trait]
impl MessageBus for AmqpBus {
  async fn send(&self, queue: &str, body: &[u8], delay: Duration) -> Result<()> {
    self.declare_queue(queue, FieldTable::default()).await?;
    if delay.is_zero() {
      return publish_message(&self.channel, "", queue, body, message_properties()).await;
    }
    let delay_queue = self.declare_delay_queue(queue).await?;
    let properties = message_properties().with_expiration(ShortString::from(delay.as_millis().to_string()));
    debug!("Sending to {} with {}ms delay", queue, delay.as_millis());
    publish_message(&self.channel, "", &delay_queue, body, properties).await
  }

  async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Envelope>> {
    self.declare_queue(queue, FieldTable::default()).await?;
    let mut consumers = self.consumers.lock().await;
    if !consumers.contains_key(queue) {
      let tag = format!("{}-{}", queue, Uuid::new_v4().simple());
      let consumer = self
        .channel
        .basic_consume(queue, &tag, BasicConsumeOptions::default(), FieldTable::default())
        .await?;
      consumers.insert(queue.to_string(), consumer);
    }
    let Some(consumer) = consumers.get_mut(queue) else {
      bail!("no consumer registered for {}", queue);
    };

    let next = tokio::time::timeout(wait, consumer.next()).await;
    match next {
      Err(_) => Ok(None),
      Ok(None) => {
        consumers.remove(queue);
        bail!("consumer for {} was closed", queue)
      }
      Ok(Some(Err(e))) => Err(e.into()),
      Ok(Some(Ok(delivery))) => Ok(Some(Envelope::new(
        delivery.data,
        Box::new(AmqpReceipt { acker: delivery.acker }),
      ))),
    }
  }

  async fn publish(&self, topic: &str, body: &[u8]) -> Result<()> {
    self.declare_topic(topic).await?;
    publish_message(&self.channel, topic, "", body, message_properties()).await
  }

  async fn subscribe(&self, topic: &str, queue: &str) -> Result<()> {
    self.declare_topic(topic).await?;
    self.declare_queue(queue, FieldTable::default()).await?;
    self
      .channel
      .queue_bind(queue, topic, "", QueueBindOptions::default(), FieldTable::default())
      .await?;
    info!("Subscribed queue {} to topic {}", queue, topic);
    Ok(())
  }
}

struct Pending {
  visible_at: Instant,
  body: Vec<u8>,
}

#[derive(Default)]
struct Queues {
  queues: HashMap<String, VecDeque<Pending>>,
  topics: HashMap<String, Vec<String>>,
}

impl Queues {
  fn push(&mut self, queue: &str, body: Vec<u8>, visible_at: Instant) {
    self
      .queues
      .entry(queue.to_string())
      .or_default()
      .push_back(Pending { visible_at, body });
  }

  fn pop_visible(&mut self, queue: &str, now: Instant) -> Option<Vec<u8>> {
    let pending = self.queues.get_mut(queue)?;
    let index = pending.iter().position(|p| p.visible_at <= now)?;
    pending.remove(index).map(|p| p.body)
  }
}

/// In-process bus. Received messages are removed immediately; rejecting one
/// puts it back at the tail of its queue.
#[derive(Clone, Default)]
pub struct MemoryBus {
  inner: Arc<Mutex<Queues>>,
}

impl MemoryBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Messages currently in `queue`, visible or not, with the time left until
  /// each becomes visible.
  pub async fn pending(&self, queue: &str) -> Vec<(Duration, Vec<u8>)> {
    let inner = self.inner.lock().await;
    let now = Instant::now();
    inner
      .queues
      .get(queue)
      .map(|q| {
        q.iter()
          .map(|p| (p.visible_at.saturating_duration_since(now), p.body.clone()))
          .collect()
      })
      .unwrap_or_default()
  }
}

struct MemoryReceipt {
  inner: Arc<Mutex<Queues>>,
  queue: String,
  body: Vec<u8>,
}

#[async_trait]
impl Acknowledge for MemoryReceipt {
  async fn ack(self: Box<Self>) -> Result<()> {
    Ok(())
  }

  async fn reject(self: Box<Self>) -> Result<()> {
    let mut inner = self.inner.lock().await;
    inner.push(&self.queue, self.body, Instant::now());
    Ok(())
  }
}

#[async_trait]
impl MessageBus for MemoryBus {
  async fn send(&self, queue: &str, body: &[u8], delay: Duration) -> Result<()> {
    let mut inner = self.inner.lock().await;
    inner.push(queue, body.to_vec(), Instant::now() + delay);
    Ok(())
  }

  async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Envelope>> {
    let deadline = Instant::now() + wait;
    loop {
      {
        let mut inner = self.inner.lock().await;
        if let Some(body) = inner.pop_visible(queue, Instant::now()) {
          let receipt = MemoryReceipt {
            inner: self.inner.clone(),
            queue: queue.to_string(),
            body: body.clone(),
          };
          return Ok(Some(Envelope::new(body, Box::new(receipt))));
        }
      }
      let now = Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      tokio::time::sleep((deadline - now).min(Duration::from_millis(50))).await;
    }
  }

  async fn publish(&self, topic: &str, body: &[u8]) -> Result<()> {
    let mut inner = self.inner.lock().await;
    let subscribers = inner.topics.get(topic).cloned().unwrap_or_default();
    let now = Instant::now();
    for queue in subscribers {
      inner.push(&queue, body.to_vec(), now);
    }
    Ok(())
  }

  async fn subscribe(&self, topic: &str, queue: &str) -> Result<()> {
    let mut inner = self.inner.lock().await;
    let subscribers = inner.topics.entry(topic.to_string()).or_default();
    if !subscribers.iter().any(|q| q == queue) {
      subscribers.push(queue.to_string());
    }
    Ok(())
  }
}
