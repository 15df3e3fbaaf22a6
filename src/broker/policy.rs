use serde_json::{json, Value};

pub const POLICY_VERSION: &str = "2012-10-17";
const SEND_MESSAGE_ACTION: &str = "SQS:SendMessage";

/// Access policy letting `topic_arn` deliver into the queue at `queue_arn`.
pub fn topic_delivery_policy(queue_arn: &str, topic_arn: &str) -> String {
    json!({
        "Version": POLICY_VERSION,
        "Statement": [
            {
                "Sid": "TopicSendMessage",
                "Effect": "Allow",
                "Principal": "*",
                "Action": SEND_MESSAGE_ACTION,
                "Resource": queue_arn,
                "Condition": {
                    "ArnEquals": {
                        "aws:SourceArn": topic_arn
                    }
                }
            }
        ]
    })
    .to_string()
}

/// Whether an `Allow` statement grants send permission conditioned on `topic_arn`.
pub fn grants_topic_send(policy: &str, topic_arn: &str) -> bool {
    let Ok(document) = serde_json::from_str::<Value>(policy) else {
        return false;
    };

    let statements = match document.get("Statement") {
        Some(Value::Array(statements)) => statements.clone(),
        Some(statement @ Value::Object(_)) => vec![statement.clone()],
        _ => return false,
    };

    statements.iter().any(|statement| {
        let allows = statement.get("Effect").and_then(Value::as_str) == Some("Allow");
        let sends = statement
            .get("Action")
            .and_then(Value::as_str)
            .is_some_and(|action| action.eq_ignore_ascii_case(SEND_MESSAGE_ACTION));
        let from_topic = statement
            .pointer("/Condition/ArnEquals/aws:SourceArn")
            .and_then(Value::as_str)
            == Some(topic_arn);
        allows && sends && from_topic
    })
}
