use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde_json::json;

use crate::broker::policy::topic_delivery_policy;
use crate::broker::{
    queue_name_from_url, Arn, ArnError, BrokerError, BrokerGateway, QueueAttributes,
    ReceiveRequest, ReceivedMessage, QUEUE_PROTOCOL,
};
use crate::config::AppConfig;
use crate::envelope::{DecodeError, Envelope, EnvelopeKind};
use crate::logging::{LogLevel, Logger};

/// Upper bound the broker accepts for a single receive.
const HANDSHAKE_RECEIVE_BATCH: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionSettings {
    pub topic_name: String,
    pub queue_names: Vec<String>,
    pub delay_seconds: u32,
    pub retention_seconds: u32,
    pub receive_wait_seconds: u32,
}

impl From<&AppConfig> for ProvisionSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            topic_name: config.topology.topic_name.clone(),
            queue_names: vec![config.topology.queue_name.clone()],
            delay_seconds: config.topology.delay_seconds,
            retention_seconds: config.topology.retention_seconds,
            receive_wait_seconds: config.topology.receive_wait_seconds,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedQueue {
    pub name: String,
    pub url: String,
    pub arn: String,
    /// `None` when an existing confirmed subscription was reused.
    pub subscription_arn: Option<String>,
    pub created: bool,
}

/// Resources the publisher and consumer run against, resolved once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub topic_arn: String,
    pub queues: Vec<ProvisionedQueue>,
}

impl Topology {
    pub fn queue(&self, name: &str) -> Option<&ProvisionedQueue> {
        self.queues.iter().find(|queue| queue.name == name)
    }
}

#[derive(Debug)]
pub enum HandshakeError {
    NoConfirmation,
    UnexpectedMessages { count: usize },
    NotAConfirmation { kind: String },
    MissingToken,
    Receive(BrokerError),
    Rejected(BrokerError),
    Undecodable(DecodeError),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConfirmation => write!(f, "no subscription confirmation arrived"),
            Self::UnexpectedMessages { count } => write!(
                f,
                "expected exactly one confirmation message, received {count}"
            ),
            Self::NotAConfirmation { kind } => write!(
                f,
                "expected a SubscriptionConfirmation message, received '{kind}'"
            ),
            Self::MissingToken => write!(f, "confirmation message carries no token"),
            Self::Receive(source) => write!(f, "failed to receive confirmation: {source}"),
            Self::Rejected(source) => write!(f, "broker rejected confirmation token: {source}"),
            Self::Undecodable(source) => write!(f, "confirmation message undecodable: {source}"),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Receive(source) | Self::Rejected(source) => Some(source),
            Self::Undecodable(source) => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum ProvisionError {
    CallerAccount { source: BrokerError },
    ListTopics { source: BrokerError },
    CreateTopic { name: String, source: BrokerError },
    InvalidArn { arn: String, source: ArnError },
    ListSubscriptions { topic_arn: String, source: BrokerError },
    ListQueues { prefix: String, source: BrokerError },
    Unsubscribe { subscription_arn: String, source: BrokerError },
    CreateQueue { name: String, source: BrokerError },
    GetQueueUrl { name: String, source: BrokerError },
    Subscribe { queue_name: String, source: BrokerError },
    Handshake { queue_name: String, source: HandshakeError },
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallerAccount { source } => {
                write!(f, "failed to resolve caller account: {source}")
            }
            Self::ListTopics { source } => write!(f, "failed to list topics: {source}"),
            Self::CreateTopic { name, source } => {
                write!(f, "failed to create topic '{name}': {source}")
            }
            Self::InvalidArn { arn, source } => write!(f, "invalid ARN '{arn}': {source}"),
            Self::ListSubscriptions { topic_arn, source } => write!(
                f,
                "failed to list subscriptions of topic '{topic_arn}': {source}"
            ),
            Self::ListQueues { prefix, source } => {
                write!(f, "failed to list queues with prefix '{prefix}': {source}")
            }
            Self::Unsubscribe {
                subscription_arn,
                source,
            } => write!(
                f,
                "failed to remove stale subscription '{subscription_arn}': {source}"
            ),
            Self::CreateQueue { name, source } => {
                write!(f, "failed to create queue '{name}': {source}")
            }
            Self::GetQueueUrl { name, source } => {
                write!(f, "failed to resolve URL of queue '{name}': {source}")
            }
            Self::Subscribe { queue_name, source } => write!(
                f,
                "failed to subscribe queue '{queue_name}' to topic: {source}"
            ),
            Self::Handshake { queue_name, source } => write!(
                f,
                "subscription handshake for queue '{queue_name}' failed: {source}"
            ),
        }
    }
}

impl std::error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CallerAccount { source }
            | Self::ListTopics { source }
            | Self::CreateTopic { source, .. }
            | Self::ListSubscriptions { source, .. }
            | Self::ListQueues { source, .. }
            | Self::Unsubscribe { source, .. }
            | Self::CreateQueue { source, .. }
            | Self::GetQueueUrl { source, .. }
            | Self::Subscribe { source, .. } => Some(source),
            Self::InvalidArn { source, .. } => Some(source),
            Self::Handshake { source, .. } => Some(source),
        }
    }
}

/// Brings the topic, its queues and their subscriptions to the desired state.
///
/// Every step is find-or-create, so running it against an already provisioned
/// broker issues no create, subscribe or unsubscribe calls.
pub struct TopologyProvisioner {
    gateway: Arc<dyn BrokerGateway>,
    settings: ProvisionSettings,
    logger: Arc<Logger>,
}

impl TopologyProvisioner {
    pub fn new(gateway: Arc<dyn BrokerGateway>, settings: ProvisionSettings, logger: Arc<Logger>) -> Self {
        Self {
            gateway,
            settings,
            logger,
        }
    }

    pub fn provision(&self) -> Result<Topology, ProvisionError> {
        let account_id = self
            .gateway
            .caller_account()
            .map_err(|source| ProvisionError::CallerAccount { source })?;
        self.logger.log(
            LogLevel::Debug,
            Some("topology::provision"),
            "Resolved caller account",
            Some(json!({ "account_id": account_id })),
        );

        let topic_arn = self.ensure_topic(&self.settings.topic_name)?;
        let queues = self.ensure_subscribed_queues(&topic_arn, &account_id, &self.settings.queue_names)?;

        self.logger.log(
            LogLevel::Info,
            Some("topology::provision"),
            "Topology provisioned",
            Some(json!({
                "topic_arn": topic_arn,
                "queues": queues.iter().map(|queue| json!({
                    "name": queue.name,
                    "url": queue.url,
                    "created": queue.created
                })).collect::<Vec<_>>()
            })),
        );

        Ok(Topology { topic_arn, queues })
    }

    pub fn ensure_topic(&self, name: &str) -> Result<String, ProvisionError> {
        let topics = self
            .gateway
            .list_topics()
            .map_err(|source| ProvisionError::ListTopics { source })?;

        for topic_arn in topics {
            let arn = Arn::parse(&topic_arn).map_err(|source| ProvisionError::InvalidArn {
                arn: topic_arn.clone(),
                source,
            })?;
            if arn.resource_name() == name {
                self.logger.log(
                    LogLevel::Debug,
                    Some("topology::topic"),
                    "Reusing existing topic",
                    Some(json!({ "name": name, "topic_arn": topic_arn })),
                );
                return Ok(topic_arn);
            }
        }

        let topic_arn = self
            .gateway
            .create_topic(name)
            .map_err(|source| ProvisionError::CreateTopic {
                name: name.to_owned(),
                source,
            })?;
        self.logger.log(
            LogLevel::Info,
            Some("topology::topic"),
            "Created topic",
            Some(json!({ "name": name, "topic_arn": topic_arn })),
        );
        Ok(topic_arn)
    }

    pub fn ensure_subscribed_queues(
        &self,
        topic_arn: &str,
        account_id: &str,
        names: &[String],
    ) -> Result<Vec<ProvisionedQueue>, ProvisionError> {
        let satisfied = self.reconcile_subscriptions(topic_arn)?;

        names
            .iter()
            .map(|name| self.ensure_queue(topic_arn, account_id, name, satisfied.contains(name)))
            .collect()
    }

    pub fn ensure_subscribed_queue(
        &self,
        topic_arn: &str,
        account_id: &str,
        name: &str,
    ) -> Result<ProvisionedQueue, ProvisionError> {
        let satisfied = self.reconcile_subscriptions(topic_arn)?;
        self.ensure_queue(topic_arn, account_id, name, satisfied.contains(name))
    }

    /// Removes subscriptions whose queue is gone and returns the queue names
    /// that already hold a confirmed subscription.
    fn reconcile_subscriptions(&self, topic_arn: &str) -> Result<BTreeSet<String>, ProvisionError> {
        let subscriptions = self
            .gateway
            .list_subscriptions_by_topic(topic_arn)
            .map_err(|source| ProvisionError::ListSubscriptions {
                topic_arn: topic_arn.to_owned(),
                source,
            })?;

        let mut satisfied = BTreeSet::new();
        for subscription in subscriptions
            .iter()
            .filter(|subscription| subscription.protocol == QUEUE_PROTOCOL)
        {
            let endpoint = Arn::parse(&subscription.endpoint).map_err(|source| ProvisionError::InvalidArn {
                arn: subscription.endpoint.clone(),
                source,
            })?;
            let queue_name = endpoint.resource_name().to_owned();

            if !self.queue_exists(&queue_name)? {
                if subscription.is_pending_confirmation() {
                    // Pending subscriptions carry no ARN yet, so there is nothing to remove.
                    continue;
                }
                self.logger.log(
                    LogLevel::Warn,
                    Some("topology::reconcile"),
                    "Removing stale subscription",
                    Some(json!({
                        "subscription_arn": subscription.subscription_arn,
                        "queue_name": queue_name
                    })),
                );
                self.gateway
                    .unsubscribe(&subscription.subscription_arn)
                    .map_err(|source| ProvisionError::Unsubscribe {
                        subscription_arn: subscription.subscription_arn.clone(),
                        source,
                    })?;
                continue;
            }

            if subscription.is_pending_confirmation() {
                self.logger.log(
                    LogLevel::Info,
                    Some("topology::reconcile"),
                    "Subscription still pending confirmation; will resubscribe",
                    Some(json!({ "queue_name": queue_name })),
                );
                continue;
            }

            satisfied.insert(queue_name);
        }

        Ok(satisfied)
    }

    fn queue_exists(&self, name: &str) -> Result<bool, ProvisionError> {
        let urls = self
            .gateway
            .list_queues(name)
            .map_err(|source| ProvisionError::ListQueues {
                prefix: name.to_owned(),
                source,
            })?;
        Ok(urls.iter().any(|url| queue_name_from_url(url) == name))
    }

    fn ensure_queue(
        &self,
        topic_arn: &str,
        account_id: &str,
        name: &str,
        already_subscribed: bool,
    ) -> Result<ProvisionedQueue, ProvisionError> {
        let topic = Arn::parse(topic_arn).map_err(|source| ProvisionError::InvalidArn {
            arn: topic_arn.to_owned(),
            source,
        })?;
        let mut queue_arn = topic.sibling("sqs", name);
        queue_arn.account_id = account_id.to_owned();
        let queue_arn = queue_arn.to_string();

        if already_subscribed {
            let url = self
                .gateway
                .get_queue_url(name)
                .map_err(|source| ProvisionError::GetQueueUrl {
                    name: name.to_owned(),
                    source,
                })?;
            self.logger.log(
                LogLevel::Debug,
                Some("topology::queue"),
                "Queue already subscribed",
                Some(json!({ "name": name, "url": url })),
            );
            return Ok(ProvisionedQueue {
                name: name.to_owned(),
                url,
                arn: queue_arn,
                subscription_arn: None,
                created: false,
            });
        }

        let attributes = QueueAttributes {
            delay_seconds: self.settings.delay_seconds,
            retention_seconds: self.settings.retention_seconds,
            receive_wait_seconds: self.settings.receive_wait_seconds,
            policy: topic_delivery_policy(&queue_arn, topic_arn),
        };
        let url = self
            .gateway
            .create_queue(name, &attributes)
            .map_err(|source| ProvisionError::CreateQueue {
                name: name.to_owned(),
                source,
            })?;
        self.logger.log(
            LogLevel::Info,
            Some("topology::queue"),
            "Queue ready",
            Some(json!({ "name": name, "url": url, "attributes": attributes.to_attribute_map() })),
        );

        let reply = self
            .gateway
            .subscribe(topic_arn, QUEUE_PROTOCOL, &queue_arn)
            .map_err(|source| ProvisionError::Subscribe {
                queue_name: name.to_owned(),
                source,
            })?;
        self.logger.log(
            LogLevel::Debug,
            Some("topology::subscribe"),
            "Subscribe call returned",
            Some(json!({ "queue_name": name, "reply": reply })),
        );

        let subscription_arn = self
            .confirm_handshake(topic_arn, &url)
            .map_err(|source| ProvisionError::Handshake {
                queue_name: name.to_owned(),
                source,
            })?;

        Ok(ProvisionedQueue {
            name: name.to_owned(),
            url,
            arn: queue_arn,
            subscription_arn: Some(subscription_arn),
            created: true,
        })
    }

    /// Confirms the pending subscription from the single message waiting on the queue.
    ///
    /// Whatever was received is deleted, whether or not the handshake succeeds,
    /// so a stale confirmation never resurfaces next to a fresh one.
    fn confirm_handshake(&self, topic_arn: &str, queue_url: &str) -> Result<String, HandshakeError> {
        let request =
            ReceiveRequest::new(HANDSHAKE_RECEIVE_BATCH).with_wait_seconds(self.settings.receive_wait_seconds);
        let messages = self
            .gateway
            .receive(queue_url, &request)
            .map_err(HandshakeError::Receive)?;

        let confirmed = self.confirm_received(topic_arn, &messages);
        for message in &messages {
            if let Err(error) = self.gateway.delete_message(queue_url, &message.receipt_handle) {
                self.logger.log(
                    LogLevel::Warn,
                    Some("topology::handshake"),
                    "Failed to delete handshake message",
                    Some(json!({
                        "queue_url": queue_url,
                        "message_id": message.message_id,
                        "error": error.to_string()
                    })),
                );
            }
        }
        let subscription_arn = confirmed?;

        self.logger.log(
            LogLevel::Info,
            Some("topology::handshake"),
            "Subscription confirmed",
            Some(json!({ "subscription_arn": subscription_arn })),
        );
        Ok(subscription_arn)
    }

    fn confirm_received(&self, topic_arn: &str, messages: &[ReceivedMessage]) -> Result<String, HandshakeError> {
        let message = match messages {
            [] => return Err(HandshakeError::NoConfirmation),
            [message] => message,
            _ => {
                return Err(HandshakeError::UnexpectedMessages {
                    count: messages.len(),
                })
            }
        };

        let envelope = Envelope::decode(&message.body).map_err(HandshakeError::Undecodable)?;
        if envelope.kind() != EnvelopeKind::SubscriptionConfirmation {
            return Err(HandshakeError::NotAConfirmation {
                kind: envelope.message_type,
            });
        }
        let token = envelope.token.ok_or(HandshakeError::MissingToken)?;

        self.gateway
            .confirm_subscription(topic_arn, &token)
            .map_err(HandshakeError::Rejected)
    }
}
