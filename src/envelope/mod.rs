use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::MessageAttributes;
use crate::jobs::Job;

pub const NOTIFICATION_TYPE: &str = "Notification";
pub const SUBSCRIPTION_CONFIRMATION_TYPE: &str = "SubscriptionConfirmation";
/// Notification payload announcing a job start; the job travels in the attributes.
pub const START_JOB_MESSAGE: &str = "start";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeKind {
    Notification,
    SubscriptionConfirmation,
    Other,
}

/// JSON wrapper the topic puts around every message it delivers to a queue.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "Type")]
    pub message_type: String,
    #[serde(rename = "MessageID", alias = "MessageId")]
    pub message_id: String,
    #[serde(rename = "TopicArn")]
    pub topic_arn: String,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(
        rename = "UnsubscribeURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub unsubscribe_url: Option<String>,
    #[serde(
        rename = "MessageAttributes",
        default,
        skip_serializing_if = "MessageAttributes::is_empty"
    )]
    pub message_attributes: MessageAttributes,
    #[serde(rename = "Token", default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(
        rename = "SubscribeURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub subscribe_url: Option<String>,
}

/// What the consumer should do with a decoded envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundMessage {
    StartJob(Job),
    Unrecognized { message_type: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    MalformedJson { reason: String },
    MissingAttribute { name: &'static str },
    UnexpectedAttributeType { name: &'static str, data_type: String },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedJson { reason } => write!(f, "envelope is not valid JSON: {reason}"),
            Self::MissingAttribute { name } => {
                write!(f, "message attribute '{name}' is missing")
            }
            Self::UnexpectedAttributeType { name, data_type } => write!(
                f,
                "message attribute '{name}' has type '{data_type}', expected 'String'"
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Envelope {
    pub fn notification(
        message_id: impl Into<String>,
        topic_arn: impl Into<String>,
        message: impl Into<String>,
        message_attributes: MessageAttributes,
        unsubscribe_url: impl Into<String>,
    ) -> Self {
        Self {
            message_type: NOTIFICATION_TYPE.to_owned(),
            message_id: message_id.into(),
            topic_arn: topic_arn.into(),
            message: message.into(),
            timestamp: Utc::now(),
            unsubscribe_url: Some(unsubscribe_url.into()),
            message_attributes,
            token: None,
            subscribe_url: None,
        }
    }

    pub fn subscription_confirmation(
        message_id: impl Into<String>,
        topic_arn: impl Into<String>,
        token: impl Into<String>,
        subscribe_url: impl Into<String>,
    ) -> Self {
        let topic_arn = topic_arn.into();
        Self {
            message_type: SUBSCRIPTION_CONFIRMATION_TYPE.to_owned(),
            message_id: message_id.into(),
            message: format!(
                "You have chosen to subscribe to the topic {topic_arn}. To confirm the subscription, echo the token back."
            ),
            topic_arn,
            timestamp: Utc::now(),
            unsubscribe_url: None,
            message_attributes: MessageAttributes::new(),
            token: Some(token.into()),
            subscribe_url: Some(subscribe_url.into()),
        }
    }

    pub fn decode(body: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(body).map_err(|source| DecodeError::MalformedJson {
            reason: source.to_string(),
        })
    }

    pub fn encode(&self) -> String {
        // Plain string/map fields only, so serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self.message_type.as_str() {
            NOTIFICATION_TYPE => EnvelopeKind::Notification,
            SUBSCRIPTION_CONFIRMATION_TYPE => EnvelopeKind::SubscriptionConfirmation,
            _ => EnvelopeKind::Other,
        }
    }

    pub fn route(&self) -> Result<InboundMessage, DecodeError> {
        if self.kind() == EnvelopeKind::Notification && self.message == START_JOB_MESSAGE {
            return Job::from_attributes(&self.message_attributes).map(InboundMessage::StartJob);
        }

        Ok(InboundMessage::Unrecognized {
            message_type: self.message_type.clone(),
            message: self.message.clone(),
        })
    }
}
