//! RabbitMQ adapter built on lapin.
//!
//! Owns the broker connection and two channels. The consume channel runs with
//! a prefetch of one, so the worker never has more than one unacknowledged
//! delivery in flight. Approvals go out on a separate channel with publisher
//! confirms enabled; a channel-level error raised by a publish closes only
//! that channel and leaves consumption running.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use secrecy::ExposeSecret;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{ApprovalPublisher, Delivery, DeliveryHandle, DeliverySource};
use crate::config::BrokerSettings;
use crate::error::{BrokerError, PublishError};
use crate::pipeline::types::{ApprovalNotification, Envelope, MessageProperties};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Header quorum queues use to count prior delivery attempts.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Lifecycle of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, target),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Closing)
                | (Closing, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        write!(f, "{s}")
    }
}

/// Channels opened on one connection.
struct Channels {
    consume: Channel,
    publish: Channel,
}

/// RabbitMQ session: one connection, a consume channel and a publish channel.
pub struct RabbitMqAdapter {
    settings: BrokerSettings,
    state: ConnectionState,
    connection: Option<Connection>,
    channels: Option<Channels>,
}

impl RabbitMqAdapter {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            state: ConnectionState::Disconnected,
            connection: None,
            channels: None,
        }
    }

    /// Connected according to both our lifecycle and the underlying socket.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
            && self
                .connection
                .as_ref()
                .is_some_and(|c| c.status().connected())
    }

    fn transition(&mut self, target: ConnectionState) {
        if !self.state.can_transition_to(target) {
            warn!(from = %self.state, to = %target, "Unexpected broker state transition");
        }
        debug!(from = %self.state, to = %target, "Broker state transition");
        self.state = target;
    }

    /// Open the connection and channel.
    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.transition(ConnectionState::Connecting);

        match self.open().await {
            Ok((connection, channels)) => {
                self.connection = Some(connection);
                self.channels = Some(channels);
                self.transition(ConnectionState::Connected);
                info!(
                    host = %self.settings.host,
                    port = self.settings.port,
                    vhost = %self.settings.vhost,
                    "Successfully connected to RabbitMQ"
                );
                Ok(())
            }
            Err(e) => {
                self.transition(ConnectionState::Disconnected);
                error!(error = %e, "Failed to connect to RabbitMQ");
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<(Connection, Channels), BrokerError> {
        let connect_err = |reason: String| BrokerError::Connect {
            host: self.settings.host.clone(),
            port: self.settings.port,
            reason,
        };

        let connection =
            Connection::connect_uri(amqp_uri(&self.settings), ConnectionProperties::default())
                .await
                .map_err(|e| connect_err(e.to_string()))?;

        let consume = connection
            .create_channel()
            .await
            .map_err(|e| connect_err(format!("failed to open consume channel: {e}")))?;

        let publish = connection
            .create_channel()
            .await
            .map_err(|e| connect_err(format!("failed to open publish channel: {e}")))?;

        publish
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| connect_err(format!("failed to enable publisher confirms: {e}")))?;

        Ok((connection, Channels { consume, publish }))
    }

    fn channels(&self) -> Result<&Channels, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.channels.as_ref().ok_or(BrokerError::NotConnected)
    }

    /// Declare `queue` as durable and start consuming from it.
    pub async fn consume(&self, queue: &str) -> Result<AmqpDeliverySource, BrokerError> {
        let channel = &self.channels()?.consume;
        let consume_err = |e: lapin::Error| BrokerError::Consume {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(consume_err)?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(consume_err)?;

        let consumer_tag = format!("card-request-worker-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(consume_err)?;

        info!(queue, consumer_tag = %consumer_tag, "Starting to consume messages from queue");

        Ok(AmqpDeliverySource {
            consumer,
            channel: channel.clone(),
            consumer_tag,
            queue: queue.to_string(),
            cancelled: false,
        })
    }

    /// Publisher for approval notifications on the configured exchange,
    /// bound to the publish channel.
    pub fn approval_publisher(&self) -> Result<AmqpApprovalPublisher, BrokerError> {
        Ok(AmqpApprovalPublisher {
            channel: self.channels()?.publish.clone(),
            exchange: self.settings.exchange.clone(),
            routing_key: self.settings.approval_routing_key.clone(),
        })
    }

    /// Close channel and connection. Never fails; errors are logged.
    pub async fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.transition(ConnectionState::Closing);

        if let Some(Channels { consume, publish }) = self.channels.take() {
            for (name, channel) in [("consume", consume), ("publish", publish)] {
                if !channel.status().connected() {
                    continue;
                }
                if let Err(e) = channel.close(REPLY_SUCCESS, "worker shutting down").await {
                    warn!(channel = name, error = %e, "Error closing RabbitMQ channel");
                }
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close(REPLY_SUCCESS, "worker shutting down").await {
                error!(error = %e, "Error during RabbitMQ disconnection");
            }
        }

        self.transition(ConnectionState::Disconnected);
        info!("Disconnected from RabbitMQ");
    }
}

fn amqp_uri(settings: &BrokerSettings) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: settings.username.clone(),
                password: settings.password.expose_secret().to_string(),
            },
            host: settings.host.clone(),
            port: settings.port,
        },
        vhost: settings.vhost.clone(),
        ..Default::default()
    }
}

// ── Consuming ───────────────────────────────────────────────────────

/// Deliveries from one lapin consumer.
pub struct AmqpDeliverySource {
    consumer: Consumer,
    channel: Channel,
    consumer_tag: String,
    queue: String,
    cancelled: bool,
}

#[async_trait]
impl DeliverySource for AmqpDeliverySource {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(into_delivery)
                .map_err(|e| BrokerError::Delivery(e.to_string())),
        )
    }

    async fn close(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;

        match self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            Ok(()) => debug!(queue = %self.queue, "Consumer cancelled"),
            Err(e) => warn!(queue = %self.queue, error = %e, "Failed to cancel consumer"),
        }
    }
}

fn into_delivery(delivery: AmqpDelivery) -> Delivery {
    let props = &delivery.properties;
    let properties = MessageProperties {
        delivery_tag: delivery.delivery_tag,
        message_id: props.message_id().as_ref().map(|s| s.as_str().to_owned()),
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_owned()),
        correlation_id: props
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_owned()),
        redelivered: delivery.redelivered,
        delivery_count: props.headers().as_ref().and_then(delivery_count),
    };

    let handle = AmqpDeliveryHandle {
        acker: delivery.acker,
        delivery_tag: delivery.delivery_tag,
    };

    Delivery {
        envelope: Envelope::new(delivery.data, properties),
        handle: Box::new(handle),
    }
}

fn delivery_count(headers: &FieldTable) -> Option<u32> {
    let (_, value) = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)?;

    match value {
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        _ => None,
    }
}

struct AmqpDeliveryHandle {
    acker: Acker,
    delivery_tag: u64,
}

impl AmqpDeliveryHandle {
    fn ack_err(&self, e: lapin::Error) -> BrokerError {
        BrokerError::Ack {
            delivery_tag: self.delivery_tag,
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl DeliveryHandle for AmqpDeliveryHandle {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| self.ack_err(e))
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| self.ack_err(e))
    }
}

// ── Publishing ──────────────────────────────────────────────────────

/// Publishes approval notifications and waits for the broker's confirm.
#[derive(Clone)]
pub struct AmqpApprovalPublisher {
    channel: Channel,
    exchange: String,
    routing_key: String,
}

impl AmqpApprovalPublisher {
    fn send_err(&self, e: lapin::Error) -> PublishError {
        PublishError::Send {
            exchange: self.exchange.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl ApprovalPublisher for AmqpApprovalPublisher {
    async fn publish(&self, notification: &ApprovalNotification) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(notification)?;

        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| self.send_err(e))?;

        match confirm.await.map_err(|e| self.send_err(e))? {
            Confirmation::Nack(_) => Err(PublishError::Nacked {
                exchange: self.exchange.clone(),
            }),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn settings() -> BrokerSettings {
        BrokerSettings {
            host: "rabbit.internal".into(),
            port: 5673,
            username: "worker".into(),
            password: SecretString::from("p@ss/word".to_string()),
            vhost: "/cards".into(),
            exchange: "cards".into(),
            approval_routing_key: "card.approved".into(),
        }
    }

    #[test]
    fn uri_carries_credentials_and_vhost_unencoded() {
        let uri = amqp_uri(&settings());

        assert_eq!(uri.authority.host, "rabbit.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "worker");
        assert_eq!(uri.authority.userinfo.password, "p@ss/word");
        assert_eq!(uri.vhost, "/cards");
    }

    #[test]
    fn connection_lifecycle_transitions() {
        use ConnectionState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Disconnected));

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Closing.can_transition_to(Connected));
    }

    #[test]
    fn new_adapter_is_disconnected() {
        let adapter = RabbitMqAdapter::new(settings());
        assert_eq!(adapter.state, ConnectionState::Disconnected);
        assert!(!adapter.is_connected());
    }

    #[test]
    fn publisher_requires_connection() {
        let adapter = RabbitMqAdapter::new(settings());
        assert!(matches!(
            adapter.approval_publisher(),
            Err(BrokerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn consume_requires_connection() {
        let adapter = RabbitMqAdapter::new(settings());
        assert!(matches!(
            adapter.consume("card_application_requests").await,
            Err(BrokerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_noop() {
        let mut adapter = RabbitMqAdapter::new(settings());
        adapter.disconnect().await;
        adapter.disconnect().await;
        assert_eq!(adapter.state, ConnectionState::Disconnected);
    }

    #[test]
    fn reads_delivery_count_header() {
        let mut headers = FieldTable::default();
        headers.insert("x-delivery-count".into(), AMQPValue::LongLongInt(3));
        assert_eq!(delivery_count(&headers), Some(3));

        let mut headers = FieldTable::default();
        headers.insert("x-delivery-count".into(), AMQPValue::LongInt(-1));
        assert_eq!(delivery_count(&headers), None);

        let mut headers = FieldTable::default();
        headers.insert("x-other".into(), AMQPValue::LongUInt(9));
        assert_eq!(delivery_count(&headers), None);
    }
}
