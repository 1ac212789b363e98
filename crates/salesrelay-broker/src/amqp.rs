//! AMQP (RabbitMQ) broker channel built on lapin.
//!
//! Both sides declare the same topology: a durable work queue whose rejected
//! messages are routed through the default exchange to a durable dead-letter
//! queue. Heartbeats are negotiated through the connection URI so a silently
//! dead peer closes the connection instead of hanging it.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;

use salesrelay_core::config::BrokerConfig;
use salesrelay_core::error::{RelayError, Result};
use salesrelay_core::traits::{BrokerTransport, DeliveryAcker, DeliverySource};
use salesrelay_core::types::{BrokerMessage, Delivery};

/// AMQP `delivery_mode` for persistent messages.
const PERSISTENT: u8 = 2;

/// Connection and topology parameters.
#[derive(Debug, Clone)]
pub struct AmqpSettings {
    pub uri: String,
    pub queue: String,
    pub dead_letter_queue: String,
    pub heartbeat_secs: u16,
    pub operation_timeout: Duration,
}

impl AmqpSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            uri: config.uri.clone(),
            queue: config.queue.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
            heartbeat_secs: config.heartbeat_secs,
            operation_timeout: config.operation_timeout(),
        }
    }

    /// The configured URI with the heartbeat interval applied, unless the
    /// URI already sets one.
    pub fn connection_uri(&self) -> String {
        if self.uri.contains("heartbeat=") {
            return self.uri.clone();
        }
        let sep = if self.uri.contains('?') { '&' } else { '?' };
        format!("{}{sep}heartbeat={}", self.uri, self.heartbeat_secs)
    }

    /// URI safe to log (credentials masked).
    pub fn redacted_uri(&self) -> String {
        match (self.uri.find("://"), self.uri.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                format!("{}://***@{}", &self.uri[..scheme_end], &self.uri[at + 1..])
            }
            _ => self.uri.clone(),
        }
    }
}

fn lost(context: &str, e: impl std::fmt::Display) -> RelayError {
    RelayError::BrokerConnectionLost(format!("{context}: {e}"))
}

/// Connect, open a channel and declare the queue topology.
async fn open_channel(settings: &AmqpSettings) -> Result<(Connection, Channel)> {
    let uri = settings.connection_uri();
    let connection = tokio::time::timeout(
        settings.operation_timeout,
        Connection::connect(&uri, ConnectionProperties::default()),
    )
    .await
    .map_err(|_| lost("connect", "timed out"))?
    .map_err(|e| lost("connect", e))?;

    let channel = connection
        .create_channel()
        .await
        .map_err(|e| lost("create channel", e))?;

    declare_topology(&channel, settings).await?;
    Ok((connection, channel))
}

async fn declare_topology(channel: &Channel, settings: &AmqpSettings) -> Result<()> {
    let durable = || QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    };

    channel
        .queue_declare(&settings.dead_letter_queue, durable(), FieldTable::default())
        .await
        .map_err(|e| lost("declare dead-letter queue", e))?;

    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from("")),
    );
    args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(LongString::from(settings.dead_letter_queue.as_str())),
    );
    channel
        .queue_declare(&settings.queue, durable(), args)
        .await
        .map_err(|e| lost("declare queue", e))?;
    Ok(())
}

/// Close a connection that is being replaced or abandoned, waiting at most
/// `limit`. Returns true if the close completed cleanly.
async fn close_within<F>(side: &str, limit: Duration, close: F) -> bool
where
    F: Future<Output = lapin::Result<()>>,
{
    match tokio::time::timeout(limit, close).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!("🐇 {side} connection was already closing: {e}");
            false
        }
        Err(_) => {
            tracing::warn!("⚠️ {side} connection close timed out after {limit:?}");
            false
        }
    }
}

struct PublisherSession {
    connection: Connection,
    channel: Channel,
}

impl PublisherSession {
    fn is_alive(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// Producer side: confirm-mode channel, reopened on demand.
pub struct AmqpTransport {
    settings: AmqpSettings,
    session: Mutex<Option<PublisherSession>>,
}

impl AmqpTransport {
    pub fn new(settings: AmqpSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
        }
    }

    async fn discard(&self, session: Option<PublisherSession>) {
        if let Some(session) = session {
            close_within(
                "publisher",
                self.settings.operation_timeout,
                session.connection.close(200, "publisher reconnecting"),
            )
            .await;
        }
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(&self) -> Result<()> {
        let (connection, channel) = open_channel(&self.settings).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| lost("enable publisher confirms", e))?;

        tracing::info!(
            "🐇 Publisher connected to {} (queue '{}')",
            self.settings.redacted_uri(),
            self.settings.queue
        );
        let previous = self.session.lock().await.replace(PublisherSession {
            connection,
            channel,
        });
        self.discard(previous).await;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(PublisherSession::is_alive)
    }

    async fn publish(&self, message: &BrokerMessage) -> Result<()> {
        let mut guard = self.session.lock().await;
        let channel = match guard.as_ref() {
            Some(session) if session.is_alive() => session.channel.clone(),
            _ => {
                self.discard(guard.take()).await;
                return Err(RelayError::BrokerConnectionLost(
                    "no open publisher channel".into(),
                ));
            }
        };

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_message_id(ShortString::from(message.message_id.as_str()))
            .with_kind(ShortString::from(message.kind.as_str()))
            .with_timestamp(message.created_at.timestamp().max(0) as u64);
        if message.durable {
            properties = properties.with_delivery_mode(PERSISTENT);
        }

        let pending = channel
            .basic_publish(
                "",
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &message.payload,
                properties,
            )
            .await;

        let pending = match pending {
            Ok(pending) => pending,
            // Channel/connection refused the frame: nothing left the process.
            Err(e @ (lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_))) => {
                self.discard(guard.take()).await;
                return Err(lost("publish", e));
            }
            Err(e) => {
                self.discard(guard.take()).await;
                return Err(RelayError::DeliveryUnconfirmed(format!("publish: {e}")));
            }
        };

        match pending.await {
            Ok(Confirmation::Ack(None)) => Ok(()),
            Ok(Confirmation::Ack(Some(_))) => Err(RelayError::DeliveryRejected(format!(
                "message {} returned as unroutable (routing key '{}')",
                message.message_id, message.routing_key
            ))),
            Ok(Confirmation::Nack(_)) => Err(RelayError::DeliveryRejected(format!(
                "broker nacked message {}",
                message.message_id
            ))),
            Ok(Confirmation::NotRequested) => Err(RelayError::DeliveryUnconfirmed(
                "channel is not in confirm mode".into(),
            )),
            Err(e) => {
                self.discard(guard.take()).await;
                Err(RelayError::DeliveryUnconfirmed(format!(
                    "confirm for {} lost: {e}",
                    message.message_id
                )))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(session) = self.session.lock().await.take() {
            session
                .connection
                .close(200, "publisher shutdown")
                .await
                .map_err(|e| lost("close", e))?;
            tracing::info!("🐇 Publisher connection closed");
        }
        Ok(())
    }
}

struct ConsumerSession {
    connection: Connection,
    consumer: lapin::Consumer,
}

/// Consumer side: QoS-limited subscription to the work queue.
pub struct AmqpDeliverySource {
    settings: AmqpSettings,
    consumer_tag: String,
    session: Mutex<Option<ConsumerSession>>,
}

impl AmqpDeliverySource {
    pub fn new(settings: AmqpSettings, consumer_tag: &str) -> Self {
        Self {
            settings,
            consumer_tag: consumer_tag.to_string(),
            session: Mutex::new(None),
        }
    }

    async fn discard(&self, session: Option<ConsumerSession>) {
        if let Some(session) = session {
            close_within(
                "consumer",
                self.settings.operation_timeout,
                session.connection.close(200, "consumer resubscribing"),
            )
            .await;
        }
    }
}

#[async_trait]
impl DeliverySource for AmqpDeliverySource {
    async fn subscribe(&self, prefetch: u16) -> Result<()> {
        let (connection, channel) = open_channel(&self.settings).await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| lost("basic.qos", e))?;
        let consumer = channel
            .basic_consume(
                &self.settings.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| lost("basic.consume", e))?;

        tracing::info!(
            "🐇 Consumer '{}' subscribed to '{}' (prefetch {prefetch})",
            self.consumer_tag,
            self.settings.queue
        );
        let previous = self.session.lock().await.replace(ConsumerSession {
            connection,
            consumer,
        });
        self.discard(previous).await;
        Ok(())
    }

    async fn next(&self) -> Result<Option<Delivery>> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(RelayError::BrokerConnectionLost("not subscribed".into()));
        };
        match session.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(into_delivery(delivery))),
            Some(Err(e)) => {
                self.discard(guard.take()).await;
                Err(lost("consume", e))
            }
            None => {
                self.discard(guard.take()).await;
                Ok(None)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(session) = self.session.lock().await.take() {
            session
                .connection
                .close(200, "consumer shutdown")
                .await
                .map_err(|e| lost("close", e))?;
            tracing::info!("🐇 Consumer connection closed");
        }
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    let delivery_count = delivery.properties.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == "x-delivery-count")
            .and_then(|(_, value)| header_u32(value))
    });
    let lapin::message::Delivery {
        data,
        acker,
        redelivered,
        ..
    } = delivery;

    Delivery::new(data, Box::new(AmqpAcker(acker)))
        .with_message_id(message_id)
        .with_redelivered(redelivered)
        .with_delivery_count(delivery_count)
}

fn header_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        _ => None,
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| lost("basic.ack", e))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| lost("basic.nack", e))
    }
}
