use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::broker::{MessageAttribute, MessageAttributes, STRING_DATA_TYPE};
use crate::envelope::DecodeError;
use crate::logging::{LogLevel, Logger};

pub const JOB_ID_ATTRIBUTE: &str = "jobID";
pub const ENGINE_ID_ATTRIBUTE: &str = "engineID";
pub const PROJECT_ID_ATTRIBUTE: &str = "projectID";

/// Unit of work announced by a `start` message.
///
/// Opaque to the dispatcher; only the [`JobHandler`] interprets the fields.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    #[serde(rename = "jobID")]
    pub job_id: String,
    #[serde(rename = "engineID")]
    pub engine_id: String,
    #[serde(rename = "projectID")]
    pub project_id: String,
}

impl Job {
    pub fn new(
        job_id: impl Into<String>,
        engine_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            engine_id: engine_id.into(),
            project_id: project_id.into(),
        }
    }

    pub fn from_attributes(attributes: &MessageAttributes) -> Result<Self, DecodeError> {
        Ok(Self {
            job_id: required_string(attributes, JOB_ID_ATTRIBUTE)?,
            engine_id: required_string(attributes, ENGINE_ID_ATTRIBUTE)?,
            project_id: required_string(attributes, PROJECT_ID_ATTRIBUTE)?,
        })
    }

    pub fn to_attributes(&self) -> MessageAttributes {
        MessageAttributes::from([
            (
                JOB_ID_ATTRIBUTE.to_owned(),
                MessageAttribute::string(&self.job_id),
            ),
            (
                ENGINE_ID_ATTRIBUTE.to_owned(),
                MessageAttribute::string(&self.engine_id),
            ),
            (
                PROJECT_ID_ATTRIBUTE.to_owned(),
                MessageAttribute::string(&self.project_id),
            ),
        ])
    }
}

fn required_string(attributes: &MessageAttributes, name: &'static str) -> Result<String, DecodeError> {
    let attribute = attributes
        .get(name)
        .ok_or(DecodeError::MissingAttribute { name })?;

    if attribute.data_type != STRING_DATA_TYPE {
        return Err(DecodeError::UnexpectedAttributeType {
            name,
            data_type: attribute.data_type.clone(),
        });
    }

    Ok(attribute.value.clone())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    Rejected { job_id: String, reason: String },
    Failed { job_id: String, message: String },
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { job_id, reason } => write!(f, "job '{job_id}' rejected: {reason}"),
            Self::Failed { job_id, message } => write!(f, "job '{job_id}' failed: {message}"),
        }
    }
}

impl std::error::Error for JobError {}

/// Processing logic executed by pool workers.
///
/// Failures stay local to the worker: they are logged and never retried.
pub trait JobHandler: Send + Sync {
    fn process(&self, job: &Job) -> Result<(), JobError>;
}

/// Stand-in for the transcription engine; holds the worker for a fixed time.
pub struct TranscriptionHandler {
    processing_time: Duration,
    logger: Arc<Logger>,
}

impl TranscriptionHandler {
    pub fn new(processing_time: Duration, logger: Arc<Logger>) -> Self {
        Self {
            processing_time,
            logger,
        }
    }
}

impl JobHandler for TranscriptionHandler {
    fn process(&self, job: &Job) -> Result<(), JobError> {
        if job.job_id.trim().is_empty() {
            return Err(JobError::Rejected {
                job_id: job.job_id.clone(),
                reason: "empty job id".to_owned(),
            });
        }

        self.logger.log(
            LogLevel::Info,
            Some("jobs::transcription"),
            "Running transcription work",
            Some(json!({
                "job": job,
                "processing_ms": self.processing_time.as_millis() as u64
            })),
        );
        thread::sleep(self.processing_time);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::broker::{MessageAttribute, MessageAttributes};
    use crate::envelope::DecodeError;
    use crate::logging::test_support::capturing_logger;

    use super::{Job, JobError, JobHandler, TranscriptionHandler, JOB_ID_ATTRIBUTE};

    #[test]
    fn attributes_carry_all_three_job_fields() {
        let job = Job::new("j1", "e1", "p1");
        let attributes = job.to_attributes();

        assert_eq!(attributes.len(), 3);
        assert_eq!(attributes["jobID"], MessageAttribute::string("j1"));
        assert_eq!(Job::from_attributes(&attributes), Ok(job));
    }

    #[test]
    fn missing_attribute_is_reported_by_name() {
        let mut attributes = Job::new("j1", "e1", "p1").to_attributes();
        attributes.remove("projectID");

        assert_eq!(
            Job::from_attributes(&attributes),
            Err(DecodeError::MissingAttribute { name: "projectID" })
        );
    }

    #[test]
    fn non_string_attribute_is_rejected() {
        let mut attributes = MessageAttributes::new();
        attributes.insert(
            JOB_ID_ATTRIBUTE.to_owned(),
            MessageAttribute {
                data_type: "Number".to_owned(),
                value: "7".to_owned(),
            },
        );

        assert_eq!(
            Job::from_attributes(&attributes),
            Err(DecodeError::UnexpectedAttributeType {
                name: "jobID",
                data_type: "Number".to_owned(),
            })
        );
    }

    #[test]
    fn job_serializes_with_wire_field_names() {
        let value = serde_json::to_value(Job::new("j1", "e1", "p1")).expect("job should serialize");
        assert_eq!(
            value,
            serde_json::json!({"jobID": "j1", "engineID": "e1", "projectID": "p1"})
        );
    }

    #[test]
    fn transcription_handler_rejects_blank_job_ids() {
        let (logger, sink) = capturing_logger();
        let handler = TranscriptionHandler::new(Duration::ZERO, logger);

        assert!(handler.process(&Job::new("j1", "e1", "p1")).is_ok());
        assert!(sink.contains("Running transcription work"));
        assert!(matches!(
            handler.process(&Job::new(" ", "e1", "p1")),
            Err(JobError::Rejected { .. })
        ));
    }
}
