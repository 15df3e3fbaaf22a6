use std::fmt;

const ARN_PREFIX: &str = "arn";

/// `arn:<partition>:<service>:<region>:<account>:<resource>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arn {
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account_id: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArnError {
    MissingPrefix { arn: String },
    NotEnoughSections { arn: String },
    EmptyResource { arn: String },
}

impl fmt::Display for ArnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPrefix { arn } => write!(f, "'{arn}' does not start with 'arn:'"),
            Self::NotEnoughSections { arn } => {
                write!(f, "'{arn}' must have six ':'-separated sections")
            }
            Self::EmptyResource { arn } => write!(f, "'{arn}' has an empty resource section"),
        }
    }
}

impl std::error::Error for ArnError {}

impl Arn {
    pub fn new(
        service: impl Into<String>,
        region: impl Into<String>,
        account_id: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            partition: "aws".to_owned(),
            service: service.into(),
            region: region.into(),
            account_id: account_id.into(),
            resource: resource.into(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ArnError> {
        let sections: Vec<&str> = raw.splitn(6, ':').collect();
        if sections.first() != Some(&ARN_PREFIX) {
            return Err(ArnError::MissingPrefix {
                arn: raw.to_owned(),
            });
        }
        if sections.len() != 6 {
            return Err(ArnError::NotEnoughSections {
                arn: raw.to_owned(),
            });
        }
        if sections[5].is_empty() {
            return Err(ArnError::EmptyResource {
                arn: raw.to_owned(),
            });
        }

        Ok(Self {
            partition: sections[1].to_owned(),
            service: sections[2].to_owned(),
            region: sections[3].to_owned(),
            account_id: sections[4].to_owned(),
            resource: sections[5].to_owned(),
        })
    }

    /// Trailing segment of the resource after the last `:` or `/`.
    ///
    /// Topics and queues are matched on this alone, since the region and
    /// account segments are not known up front.
    pub fn resource_name(&self) -> &str {
        self.resource
            .rsplit(|c: char| c == ':' || c == '/')
            .next()
            .unwrap_or(&self.resource)
    }

    /// Sibling ARN in the same partition, region and account.
    pub fn sibling(&self, service: &str, resource: &str) -> Self {
        Self {
            partition: self.partition.clone(),
            service: service.to_owned(),
            region: self.region.clone(),
            account_id: self.account_id.clone(),
            resource: resource.to_owned(),
        }
    }
}

impl fmt::Display for Arn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{ARN_PREFIX}:{}:{}:{}:{}:{}",
            self.partition, self.service, self.region, self.account_id, self.resource
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Arn, ArnError};

    #[test]
    fn parses_topic_arn_sections() {
        let arn = Arn::parse("arn:aws:sns:ap-southeast-1:123456789012:job-events")
            .expect("topic arn should parse");

        assert_eq!(arn.service, "sns");
        assert_eq!(arn.region, "ap-southeast-1");
        assert_eq!(arn.account_id, "123456789012");
        assert_eq!(arn.resource_name(), "job-events");
        assert_eq!(arn.to_string(), "arn:aws:sns:ap-southeast-1:123456789012:job-events");
    }

    #[test]
    fn resource_name_takes_last_segment() {
        let subscription =
            Arn::parse("arn:aws:sns:eu-west-1:1:job-events:6f1d").expect("should parse");
        assert_eq!(subscription.resource, "job-events:6f1d");
        assert_eq!(subscription.resource_name(), "6f1d");

        let role = Arn::parse("arn:aws:iam::1:role/service/worker").expect("should parse");
        assert_eq!(role.resource_name(), "worker");
    }

    #[test]
    fn rejects_malformed_arns() {
        assert!(matches!(
            Arn::parse("https://sqs.local/1/jobs"),
            Err(ArnError::MissingPrefix { .. })
        ));
        assert!(matches!(
            Arn::parse("arn:aws:sqs:eu-west-1"),
            Err(ArnError::NotEnoughSections { .. })
        ));
        assert!(matches!(
            Arn::parse("arn:aws:sqs:eu-west-1:1:"),
            Err(ArnError::EmptyResource { .. })
        ));
    }

    #[test]
    fn sibling_keeps_region_and_account() {
        let topic = Arn::parse("arn:aws:sns:eu-west-1:42:job-events").expect("should parse");
        assert_eq!(
            topic.sibling("sqs", "job-intake").to_string(),
            "arn:aws:sqs:eu-west-1:42:job-intake"
        );
    }
}
