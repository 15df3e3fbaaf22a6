use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::broker::{BrokerError, BrokerGateway, MessageAttributes};
use crate::envelope::START_JOB_MESSAGE;
use crate::jobs::Job;
use crate::logging::{LogLevel, Logger};
use crate::topology::Topology;

pub const DEMO_ENGINE_ID: &str = "default";
pub const DEMO_PROJECT_ID: &str = "default";

/// Anything that can be published to the job topic.
pub trait OutboundMessage {
    fn body(&self) -> &str;
    fn attributes(&self) -> MessageAttributes;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartJobMessage {
    pub job: Job,
}

impl StartJobMessage {
    pub fn new(job: Job) -> Self {
        Self { job }
    }
}

impl OutboundMessage for StartJobMessage {
    fn body(&self) -> &str {
        START_JOB_MESSAGE
    }

    fn attributes(&self) -> MessageAttributes {
        self.job.to_attributes()
    }
}

pub struct Publisher {
    gateway: Arc<dyn BrokerGateway>,
    topic_arn: String,
    logger: Arc<Logger>,
}

impl Publisher {
    pub fn new(gateway: Arc<dyn BrokerGateway>, topology: &Topology, logger: Arc<Logger>) -> Self {
        Self {
            gateway,
            topic_arn: topology.topic_arn.clone(),
            logger,
        }
    }

    /// Returns the broker-assigned message id.
    pub fn publish(&self, message: &dyn OutboundMessage) -> Result<String, BrokerError> {
        let attributes = message.attributes();
        let message_id = self
            .gateway
            .publish(&self.topic_arn, message.body(), &attributes)?;

        self.logger.log(
            LogLevel::Info,
            Some("publisher::publish"),
            "Message published",
            Some(json!({
                "topic_arn": self.topic_arn,
                "message_id": message_id,
                "message": message.body(),
                "attributes": attributes
                    .iter()
                    .map(|(name, attribute)| (name.clone(), attribute.value.clone()))
                    .collect::<BTreeMap<_, _>>()
            })),
        );
        Ok(message_id)
    }

    /// Publishes a start message for a generated job in the default engine and project.
    pub fn publish_demo_job(&self, sequence: u64) -> Result<Job, BrokerError> {
        let job = demo_job(sequence, Utc::now().timestamp());
        self.publish(&StartJobMessage::new(job.clone()))?;
        Ok(job)
    }
}

fn demo_job(sequence: u64, unix_ts: i64) -> Job {
    Job::new(
        format!("demo-job-{sequence}-{unix_ts}"),
        DEMO_ENGINE_ID,
        DEMO_PROJECT_ID,
    )
}
