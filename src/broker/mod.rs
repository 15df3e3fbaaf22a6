pub mod arn;
pub mod memory;
pub mod policy;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::BrokerConfig;
use crate::logging::{LogLevel, Logger};

pub use arn::{Arn, ArnError};
pub use memory::InMemoryBroker;

/// Subscription protocol delivering topic messages into a queue.
pub const QUEUE_PROTOCOL: &str = "sqs";
/// Subscription ARN reported while the handshake has not completed.
pub const PENDING_CONFIRMATION: &str = "PendingConfirmation";
pub const STRING_DATA_TYPE: &str = "String";
pub const ALL_ATTRIBUTES: &str = "All";

pub type MessageAttributes = BTreeMap<String, MessageAttribute>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageAttribute {
    #[serde(rename = "Type")]
    pub data_type: String,
    #[serde(rename = "Value")]
    pub value: String,
}

impl MessageAttribute {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: STRING_DATA_TYPE.to_owned(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueAttributes {
    pub delay_seconds: u32,
    pub retention_seconds: u32,
    pub receive_wait_seconds: u32,
    pub policy: String,
}

impl QueueAttributes {
    /// Attribute map in the broker's native naming.
    pub fn to_attribute_map(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("DelaySeconds", self.delay_seconds.to_string()),
            ("MessageRetentionPeriod", self.retention_seconds.to_string()),
            (
                "ReceiveMessageWaitTimeSeconds",
                self.receive_wait_seconds.to_string(),
            ),
            ("Policy", self.policy.clone()),
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub subscription_arn: String,
    pub topic_arn: String,
    pub protocol: String,
    pub endpoint: String,
}

impl SubscriptionRecord {
    pub fn is_pending_confirmation(&self) -> bool {
        self.subscription_arn == PENDING_CONFIRMATION
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub max_messages: u32,
    /// `None` falls back to the queue's configured long-poll wait.
    pub wait_seconds: Option<u32>,
    pub attribute_names: Vec<String>,
}

impl ReceiveRequest {
    pub fn new(max_messages: u32) -> Self {
        Self {
            max_messages,
            wait_seconds: None,
            attribute_names: vec![ALL_ATTRIBUTES.to_owned()],
        }
    }

    pub fn with_wait_seconds(mut self, wait_seconds: u32) -> Self {
        self.wait_seconds = Some(wait_seconds);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BrokerOperation {
    CallerAccount,
    ListTopics,
    CreateTopic,
    ListQueues,
    GetQueueUrl,
    CreateQueue,
    Subscribe,
    Unsubscribe,
    ListSubscriptions,
    ConfirmSubscription,
    Publish,
    Receive,
    DeleteMessage,
}

impl BrokerOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CallerAccount => "caller_account",
            Self::ListTopics => "list_topics",
            Self::CreateTopic => "create_topic",
            Self::ListQueues => "list_queues",
            Self::GetQueueUrl => "get_queue_url",
            Self::CreateQueue => "create_queue",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::ListSubscriptions => "list_subscriptions_by_topic",
            Self::ConfirmSubscription => "confirm_subscription",
            Self::Publish => "publish",
            Self::Receive => "receive",
            Self::DeleteMessage => "delete_message",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerBackend {
    Memory,
}

impl BrokerBackend {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    UnsupportedBackend { backend: String },
    NotFound { resource: &'static str, name: String },
    QueueAlreadyExists { name: String },
    InvalidParameter { message: String },
    InvalidToken { topic_arn: String },
    Injected { operation: BrokerOperation },
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedBackend { backend } => write!(
                f,
                "unsupported broker.backend '{backend}'; currently only 'memory' is supported"
            ),
            Self::NotFound { resource, name } => write!(f, "{resource} '{name}' does not exist"),
            Self::QueueAlreadyExists { name } => write!(
                f,
                "queue '{name}' already exists with different attributes"
            ),
            Self::InvalidParameter { message } => write!(f, "invalid parameter: {message}"),
            Self::InvalidToken { topic_arn } => {
                write!(f, "confirmation token rejected for topic '{topic_arn}'")
            }
            Self::Injected { operation } => {
                write!(f, "injected failure for broker call '{}'", operation.as_str())
            }
        }
    }
}

impl std::error::Error for BrokerError {}

/// Capability surface of the hosted topic/queue service.
///
/// Implementations are shared between the provisioning thread, the consumer
/// ticker and the publisher, hence `Send + Sync`.
pub trait BrokerGateway: Send + Sync {
    /// Account owning the resources this gateway acts on.
    fn caller_account(&self) -> Result<String, BrokerError>;

    fn list_topics(&self) -> Result<Vec<String>, BrokerError>;
    fn create_topic(&self, name: &str) -> Result<String, BrokerError>;

    fn list_queues(&self, name_prefix: &str) -> Result<Vec<String>, BrokerError>;
    fn get_queue_url(&self, name: &str) -> Result<String, BrokerError>;
    fn create_queue(&self, name: &str, attributes: &QueueAttributes) -> Result<String, BrokerError>;

    fn subscribe(&self, topic_arn: &str, protocol: &str, endpoint: &str) -> Result<String, BrokerError>;
    fn unsubscribe(&self, subscription_arn: &str) -> Result<(), BrokerError>;
    fn list_subscriptions_by_topic(&self, topic_arn: &str) -> Result<Vec<SubscriptionRecord>, BrokerError>;
    fn confirm_subscription(&self, topic_arn: &str, token: &str) -> Result<String, BrokerError>;

    fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        attributes: &MessageAttributes,
    ) -> Result<String, BrokerError>;
    fn receive(&self, queue_url: &str, request: &ReceiveRequest) -> Result<Vec<ReceivedMessage>, BrokerError>;
    fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), BrokerError>;
}

pub fn connect(config: &BrokerConfig, logger: &Logger) -> Result<Arc<dyn BrokerGateway>, BrokerError> {
    let Some(backend) = BrokerBackend::parse(&config.backend) else {
        return Err(BrokerError::UnsupportedBackend {
            backend: config.backend.clone(),
        });
    };

    logger.log(
        LogLevel::Info,
        Some("broker::connect"),
        "Connecting broker gateway",
        Some(json!({
            "backend": backend.as_str(),
            "region": config.region,
            "account_id": config.account_id
        })),
    );

    match backend {
        BrokerBackend::Memory => Ok(Arc::new(InMemoryBroker::new(
            config.region.clone(),
            config.account_id.clone(),
        ))),
    }
}

/// Queue name carried by the last path segment of a queue URL.
pub fn queue_name_from_url(queue_url: &str) -> &str {
    queue_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(queue_url)
}

#[cfg(test)]
mod tests {
    use crate::config::BrokerConfig;
    use crate::logging::test_support::capturing_logger;

    use super::{connect, queue_name_from_url, BrokerError, SubscriptionRecord, PENDING_CONFIRMATION};

    #[test]
    fn queue_name_is_last_url_segment() {
        assert_eq!(
            queue_name_from_url("https://sqs.ap-southeast-1.amazonaws.com/123456789012/job-intake"),
            "job-intake"
        );
        assert_eq!(queue_name_from_url("https://host/acct/job-intake/"), "job-intake");
        assert_eq!(queue_name_from_url("job-intake"), "job-intake");
    }

    #[test]
    fn pending_subscription_is_detected_by_placeholder_arn() {
        let record = SubscriptionRecord {
            subscription_arn: PENDING_CONFIRMATION.to_owned(),
            topic_arn: "arn:aws:sns:ap-southeast-1:123456789012:job-events".to_owned(),
            protocol: "sqs".to_owned(),
            endpoint: "arn:aws:sqs:ap-southeast-1:123456789012:job-intake".to_owned(),
        };
        assert!(record.is_pending_confirmation());
    }

    #[test]
    fn connect_rejects_unknown_backend() {
        let (logger, _sink) = capturing_logger();
        let result = connect(
            &BrokerConfig {
                backend: "carrier-pigeon".to_owned(),
                region: "ap-southeast-1".to_owned(),
                account_id: "123456789012".to_owned(),
            },
            &logger,
        );

        assert!(matches!(
            result,
            Err(BrokerError::UnsupportedBackend { backend }) if backend == "carrier-pigeon"
        ));
    }
}
