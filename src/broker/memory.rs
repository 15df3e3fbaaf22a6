use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::envelope::Envelope;

use super::arn::Arn;
use super::policy::grants_topic_send;
use super::{
    queue_name_from_url, BrokerError, BrokerGateway, BrokerOperation, MessageAttributes,
    QueueAttributes, ReceiveRequest, ReceivedMessage, SubscriptionRecord, ALL_ATTRIBUTES,
    PENDING_CONFIRMATION, QUEUE_PROTOCOL,
};

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_RECEIVE_BATCH: u32 = 10;
const LONG_POLL_STEP: Duration = Duration::from_millis(25);
const MAX_QUEUE_NAME_LEN: usize = 80;
const PENDING_SUBSCRIPTION_REPLY: &str = "pending confirmation";

/// Process-local topic/queue service with SNS-to-SQS delivery semantics.
///
/// Subscriptions start pending and receive a confirmation envelope; only
/// confirmed subscriptions whose queue policy admits the topic get
/// notifications. Received messages stay invisible until deleted or until the
/// visibility timeout lapses.
pub struct InMemoryBroker {
    region: String,
    account_id: String,
    visibility_timeout: Duration,
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    topics: BTreeMap<String, TopicState>,
    queues: BTreeMap<String, QueueState>,
    pending_tokens: HashMap<String, PendingToken>,
    injected_failures: Vec<BrokerOperation>,
    calls: BTreeMap<BrokerOperation, usize>,
}

struct TopicState {
    subscriptions: Vec<SubscriptionState>,
}

struct SubscriptionState {
    arn: String,
    protocol: String,
    endpoint: String,
    confirmed: bool,
}

struct PendingToken {
    topic_arn: String,
    subscription_arn: String,
}

struct QueueState {
    url: String,
    arn: String,
    attributes: QueueAttributes,
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlightMessage>,
}

#[derive(Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    sent_at_ms: i64,
    visible_at: Instant,
    receive_count: u32,
}

struct InFlightMessage {
    message: StoredMessage,
    invisible_until: Instant,
}

impl QueueState {
    fn enqueue(&mut self, message_id: String, body: String) {
        let delay = Duration::from_secs(u64::from(self.attributes.delay_seconds));
        self.enqueue_after(message_id, body, delay);
    }

    fn enqueue_after(&mut self, message_id: String, body: String, delay: Duration) {
        self.ready.push_back(StoredMessage {
            message_id,
            body,
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
            visible_at: Instant::now() + delay,
            receive_count: 0,
        });
    }

    fn restore_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.invisible_until <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(in_flight) = self.in_flight.remove(&receipt) {
                self.ready.push_back(in_flight.message);
            }
        }
    }

    fn take_visible(&mut self, max: usize, now: Instant, visibility_timeout: Duration) -> Vec<(String, StoredMessage)> {
        let mut taken = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.ready.len());

        while let Some(mut message) = self.ready.pop_front() {
            if taken.len() < max && message.visible_at <= now {
                message.receive_count += 1;
                let receipt_handle = Uuid::new_v4().to_string();
                self.in_flight.insert(
                    receipt_handle.clone(),
                    InFlightMessage {
                        message: message.clone(),
                        invisible_until: now + visibility_timeout,
                    },
                );
                taken.push((receipt_handle, message));
            } else {
                remaining.push_back(message);
            }
        }

        self.ready = remaining;
        taken
    }
}

impl InMemoryBroker {
    pub fn new(region: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account_id: account_id.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            state: Mutex::new(BrokerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test thread panicked mid-call; the maps stay usable.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(&self, operation: BrokerOperation) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_insert(0) += 1;

        if let Some(position) = state
            .injected_failures
            .iter()
            .position(|failing| *failing == operation)
        {
            state.injected_failures.remove(position);
            return Err(BrokerError::Injected { operation });
        }

        Ok(state)
    }

    fn topic_arn(&self, name: &str) -> String {
        Arn::new("sns", &self.region, &self.account_id, name).to_string()
    }

    fn queue_arn(&self, name: &str) -> String {
        Arn::new("sqs", &self.region, &self.account_id, name).to_string()
    }

    fn queue_url(&self, name: &str) -> String {
        format!(
            "https://sqs.{}.amazonaws.com/{}/{}",
            self.region, self.account_id, name
        )
    }

    fn sns_endpoint(&self) -> String {
        format!("https://sns.{}.amazonaws.com/", self.region)
    }

    fn deliver_confirmation(&self, state: &mut BrokerState, topic_arn: &str, subscription_arn: &str, endpoint: &str) {
        let token = Uuid::new_v4().simple().to_string();
        state.pending_tokens.insert(
            token.clone(),
            PendingToken {
                topic_arn: topic_arn.to_owned(),
                subscription_arn: subscription_arn.to_owned(),
            },
        );

        let Some(queue) = state
            .queues
            .values_mut()
            .find(|queue| queue.arn == endpoint)
        else {
            return;
        };
        if !grants_topic_send(&queue.attributes.policy, topic_arn) {
            return;
        }

        let message_id = Uuid::new_v4().to_string();
        let subscribe_url = format!(
            "{}?Action=ConfirmSubscription&TopicArn={topic_arn}&Token={token}",
            self.sns_endpoint()
        );
        let body = Envelope::subscription_confirmation(message_id.clone(), topic_arn, token, subscribe_url)
            .encode();
        queue.enqueue(message_id, body);
    }
}

#[cfg(test)]
impl InMemoryBroker {
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Number of calls made so far to `operation`, failed ones included.
    pub fn call_count(&self, operation: BrokerOperation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Makes the next call to `operation` fail with [`BrokerError::Injected`].
    pub fn fail_next(&self, operation: BrokerOperation) {
        self.lock().injected_failures.push(operation);
    }

    /// Removes a queue and everything in it; subscriptions pointing at it are left dangling.
    pub fn delete_queue(&self, queue_url: &str) -> Result<(), BrokerError> {
        let name = queue_name_from_url(queue_url).to_owned();
        self.lock()
            .queues
            .remove(&name)
            .map(|_| ())
            .ok_or(BrokerError::NotFound {
                resource: "queue",
                name,
            })
    }

    /// Messages not currently held by a receiver, delayed ones included.
    pub fn visible_message_count(&self, queue_name: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .queues
            .get(queue_name)
            .map(|queue| {
                let lapsed = queue
                    .in_flight
                    .values()
                    .filter(|in_flight| in_flight.invisible_until <= now)
                    .count();
                queue.ready.len() + lapsed
            })
            .unwrap_or(0)
    }

    /// Drops a raw body into a queue, bypassing topic delivery and the queue delay.
    pub fn inject_raw_message(&self, queue_name: &str, body: &str) -> Result<String, BrokerError> {
        let mut state = self.lock();
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::NotFound {
                resource: "queue",
                name: queue_name.to_owned(),
            })?;
        let message_id = Uuid::new_v4().to_string();
        queue.enqueue_after(message_id.clone(), body.to_owned(), Duration::ZERO);
        Ok(message_id)
    }
}

fn validate_queue_name(name: &str) -> Result<(), BrokerError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidParameter {
            message: format!("queue name '{name}' must be 1-{MAX_QUEUE_NAME_LEN} characters of [A-Za-z0-9_-]"),
        })
    }
}

impl BrokerGateway for InMemoryBroker {
    fn caller_account(&self) -> Result<String, BrokerError> {
        drop(self.begin(BrokerOperation::CallerAccount)?);
        Ok(self.account_id.clone())
    }

    fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let state = self.begin(BrokerOperation::ListTopics)?;
        Ok(state.topics.keys().cloned().collect())
    }

    fn create_topic(&self, name: &str) -> Result<String, BrokerError> {
        let mut state = self.begin(BrokerOperation::CreateTopic)?;
        if name.is_empty() {
            return Err(BrokerError::InvalidParameter {
                message: "topic name must not be empty".to_owned(),
            });
        }

        let arn = self.topic_arn(name);
        state.topics.entry(arn.clone()).or_insert_with(|| TopicState {
            subscriptions: Vec::new(),
        });
        Ok(arn)
    }

    fn list_queues(&self, name_prefix: &str) -> Result<Vec<String>, BrokerError> {
        let state = self.begin(BrokerOperation::ListQueues)?;
        Ok(state
            .queues
            .iter()
            .filter(|(name, _)| name.starts_with(name_prefix))
            .map(|(_, queue)| queue.url.clone())
            .collect())
    }

    fn get_queue_url(&self, name: &str) -> Result<String, BrokerError> {
        let state = self.begin(BrokerOperation::GetQueueUrl)?;
        state
            .queues
            .get(name)
            .map(|queue| queue.url.clone())
            .ok_or_else(|| BrokerError::NotFound {
                resource: "queue",
                name: name.to_owned(),
            })
    }

    fn create_queue(&self, name: &str, attributes: &QueueAttributes) -> Result<String, BrokerError> {
        let mut state = self.begin(BrokerOperation::CreateQueue)?;
        validate_queue_name(name)?;

        if let Some(existing) = state.queues.get(name) {
            if existing.attributes == *attributes {
                return Ok(existing.url.clone());
            }
            return Err(BrokerError::QueueAlreadyExists {
                name: name.to_owned(),
            });
        }

        let url = self.queue_url(name);
        state.queues.insert(
            name.to_owned(),
            QueueState {
                url: url.clone(),
                arn: self.queue_arn(name),
                attributes: attributes.clone(),
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
            },
        );
        Ok(url)
    }

    fn subscribe(&self, topic_arn: &str, protocol: &str, endpoint: &str) -> Result<String, BrokerError> {
        let mut state = self.begin(BrokerOperation::Subscribe)?;
        let topic = state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| BrokerError::NotFound {
                resource: "topic",
                name: topic_arn.to_owned(),
            })?;

        let existing = topic
            .subscriptions
            .iter()
            .find(|sub| sub.protocol == protocol && sub.endpoint == endpoint)
            .map(|sub| (sub.arn.clone(), sub.confirmed));

        let subscription_arn = match existing {
            Some((arn, true)) => return Ok(arn),
            Some((arn, false)) => arn,
            None => {
                let arn = format!("{topic_arn}:{}", Uuid::new_v4());
                topic.subscriptions.push(SubscriptionState {
                    arn: arn.clone(),
                    protocol: protocol.to_owned(),
                    endpoint: endpoint.to_owned(),
                    confirmed: false,
                });
                arn
            }
        };

        if protocol == QUEUE_PROTOCOL {
            self.deliver_confirmation(&mut state, topic_arn, &subscription_arn, endpoint);
        }
        Ok(PENDING_SUBSCRIPTION_REPLY.to_owned())
    }

    fn unsubscribe(&self, subscription_arn: &str) -> Result<(), BrokerError> {
        let mut state = self.begin(BrokerOperation::Unsubscribe)?;
        for topic in state.topics.values_mut() {
            let before = topic.subscriptions.len();
            topic
                .subscriptions
                .retain(|sub| !(sub.confirmed && sub.arn == subscription_arn));
            if topic.subscriptions.len() != before {
                return Ok(());
            }
        }

        Err(BrokerError::NotFound {
            resource: "subscription",
            name: subscription_arn.to_owned(),
        })
    }

    fn list_subscriptions_by_topic(&self, topic_arn: &str) -> Result<Vec<SubscriptionRecord>, BrokerError> {
        let state = self.begin(BrokerOperation::ListSubscriptions)?;
        let topic = state
            .topics
            .get(topic_arn)
            .ok_or_else(|| BrokerError::NotFound {
                resource: "topic",
                name: topic_arn.to_owned(),
            })?;

        Ok(topic
            .subscriptions
            .iter()
            .map(|sub| SubscriptionRecord {
                subscription_arn: if sub.confirmed {
                    sub.arn.clone()
                } else {
                    PENDING_CONFIRMATION.to_owned()
                },
                topic_arn: topic_arn.to_owned(),
                protocol: sub.protocol.clone(),
                endpoint: sub.endpoint.clone(),
            })
            .collect())
    }

    fn confirm_subscription(&self, topic_arn: &str, token: &str) -> Result<String, BrokerError> {
        let mut state = self.begin(BrokerOperation::ConfirmSubscription)?;
        let rejected = || BrokerError::InvalidToken {
            topic_arn: topic_arn.to_owned(),
        };

        match state.pending_tokens.get(token) {
            Some(pending) if pending.topic_arn == topic_arn => {}
            _ => return Err(rejected()),
        }
        let pending = state.pending_tokens.remove(token).ok_or_else(rejected)?;

        let subscription = state
            .topics
            .get_mut(topic_arn)
            .and_then(|topic| {
                topic
                    .subscriptions
                    .iter_mut()
                    .find(|sub| sub.arn == pending.subscription_arn)
            })
            .ok_or_else(rejected)?;
        subscription.confirmed = true;
        Ok(pending.subscription_arn)
    }

    fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        attributes: &MessageAttributes,
    ) -> Result<String, BrokerError> {
        let mut state = self.begin(BrokerOperation::Publish)?;
        let endpoints: Vec<(String, String)> = state
            .topics
            .get(topic_arn)
            .ok_or_else(|| BrokerError::NotFound {
                resource: "topic",
                name: topic_arn.to_owned(),
            })?
            .subscriptions
            .iter()
            .filter(|sub| sub.confirmed && sub.protocol == QUEUE_PROTOCOL)
            .map(|sub| (sub.arn.clone(), sub.endpoint.clone()))
            .collect();

        let message_id = Uuid::new_v4().to_string();
        for (subscription_arn, endpoint) in endpoints {
            let Some(queue) = state
                .queues
                .values_mut()
                .find(|queue| queue.arn == endpoint)
            else {
                continue;
            };
            if !grants_topic_send(&queue.attributes.policy, topic_arn) {
                continue;
            }

            let unsubscribe_url = format!(
                "{}?Action=Unsubscribe&SubscriptionArn={subscription_arn}",
                self.sns_endpoint()
            );
            let body = Envelope::notification(
                message_id.clone(),
                topic_arn,
                message,
                attributes.clone(),
                unsubscribe_url,
            )
            .encode();
            queue.enqueue(Uuid::new_v4().to_string(), body);
        }

        Ok(message_id)
    }

    fn receive(&self, queue_url: &str, request: &ReceiveRequest) -> Result<Vec<ReceivedMessage>, BrokerError> {
        if !(1..=MAX_RECEIVE_BATCH).contains(&request.max_messages) {
            return Err(BrokerError::InvalidParameter {
                message: format!(
                    "max_messages must be between 1 and {MAX_RECEIVE_BATCH}, got {}",
                    request.max_messages
                ),
            });
        }

        let name = queue_name_from_url(queue_url).to_owned();
        let mut deadline: Option<Instant> = None;

        loop {
            {
                let mut state = if deadline.is_none() {
                    self.begin(BrokerOperation::Receive)?
                } else {
                    self.lock()
                };
                let queue = state
                    .queues
                    .get_mut(&name)
                    .ok_or_else(|| BrokerError::NotFound {
                        resource: "queue",
                        name: name.clone(),
                    })?;

                let now = Instant::now();
                let deadline = *deadline.get_or_insert_with(|| {
                    let wait = request
                        .wait_seconds
                        .unwrap_or(queue.attributes.receive_wait_seconds);
                    now + Duration::from_secs(u64::from(wait))
                });

                queue.restore_expired(now);
                let taken = queue.take_visible(
                    request.max_messages as usize,
                    now,
                    self.visibility_timeout,
                );

                if !taken.is_empty() || now >= deadline {
                    let wants_all = request
                        .attribute_names
                        .iter()
                        .any(|name| name == ALL_ATTRIBUTES);
                    return Ok(taken
                        .into_iter()
                        .map(|(receipt_handle, message)| {
                            let mut attributes = BTreeMap::new();
                            let system_attributes = [
                                ("SentTimestamp", message.sent_at_ms.to_string()),
                                (
                                    "ApproximateReceiveCount",
                                    message.receive_count.to_string(),
                                ),
                            ];
                            for (key, value) in system_attributes {
                                if wants_all
                                    || request.attribute_names.iter().any(|name| name == key)
                                {
                                    attributes.insert(key.to_owned(), value);
                                }
                            }
                            ReceivedMessage {
                                message_id: message.message_id,
                                receipt_handle,
                                body: message.body,
                                attributes,
                            }
                        })
                        .collect());
                }
            }

            thread::sleep(LONG_POLL_STEP);
        }
    }

    fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), BrokerError> {
        let mut state = self.begin(BrokerOperation::DeleteMessage)?;
        let name = queue_name_from_url(queue_url);
        let queue = state
            .queues
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound {
                resource: "queue",
                name: name.to_owned(),
            })?;

        queue
            .in_flight
            .remove(receipt_handle)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound {
                resource: "receipt handle",
                name: receipt_handle.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::broker::policy::topic_delivery_policy;
    use crate::broker::{
        BrokerError, BrokerGateway, BrokerOperation, MessageAttributes, QueueAttributes,
        ReceiveRequest, QUEUE_PROTOCOL,
    };
    use crate::envelope::{Envelope, EnvelopeKind};
    use crate::jobs::Job;

    use super::InMemoryBroker;

    const REGION: &str = "ap-southeast-1";
    const ACCOUNT: &str = "123456789012";

    fn attributes_for(queue_arn: &str, topic_arn: &str) -> QueueAttributes {
        QueueAttributes {
            delay_seconds: 0,
            retention_seconds: 86_400,
            receive_wait_seconds: 0,
            policy: topic_delivery_policy(queue_arn, topic_arn),
        }
    }

    /// Topic plus a confirmed queue subscription; returns (topic arn, queue url).
    fn wired_broker(broker: &InMemoryBroker) -> (String, String) {
        let topic_arn = broker.create_topic("job-events").expect("topic");
        let queue_arn = format!("arn:aws:sqs:{REGION}:{ACCOUNT}:job-intake");
        let queue_url = broker
            .create_queue("job-intake", &attributes_for(&queue_arn, &topic_arn))
            .expect("queue");
        broker
            .subscribe(&topic_arn, QUEUE_PROTOCOL, &queue_arn)
            .expect("subscribe");

        let confirmation = broker
            .receive(&queue_url, &ReceiveRequest::new(10))
            .expect("receive confirmation");
        assert_eq!(confirmation.len(), 1);
        let envelope = Envelope::decode(&confirmation[0].body).expect("confirmation envelope");
        let token = envelope.token.expect("token");
        broker
            .confirm_subscription(&topic_arn, &token)
            .expect("confirm");
        broker
            .delete_message(&queue_url, &confirmation[0].receipt_handle)
            .expect("delete confirmation");

        (topic_arn, queue_url)
    }

    #[test]
    fn subscribe_starts_pending_and_sends_confirmation() {
        let broker = InMemoryBroker::new(REGION, ACCOUNT);
        let topic_arn = broker.create_topic("job-events").expect("topic");
        let queue_arn = format!("arn:aws:sqs:{REGION}:{ACCOUNT}:job-intake");
        let queue_url = broker
            .create_queue("job-intake", &attributes_for(&queue_arn, &topic_arn))
            .expect("queue");

        let reply = broker
            .subscribe(&topic_arn, QUEUE_PROTOCOL, &queue_arn)
            .expect("subscribe");
        assert_eq!(reply, "pending confirmation");

        let listed = broker
            .list_subscriptions_by_topic(&topic_arn)
            .expect("list subscriptions");
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_pending_confirmation());

        let received = broker
            .receive(&queue_url, &ReceiveRequest::new(10))
            .expect("receive");
        let envelope = Envelope::decode(&received[0].body).expect("decode");
        assert_eq!(envelope.kind(), EnvelopeKind::SubscriptionConfirmation);
        assert!(matches!(
            broker.confirm_subscription(&topic_arn, "forged"),
            Err(BrokerError::InvalidToken { .. })
        ));
    }

    #[test]
    fn publish_reaches_only_confirmed_subscriptions() {
        let broker = InMemoryBroker::new(REGION, ACCOUNT);
        let topic_arn = broker.create_topic("job-events").expect("topic");
        let queue_arn = format!("arn:aws:sqs:{REGION}:{ACCOUNT}:job-intake");
        broker
            .create_queue("job-intake", &attributes_for(&queue_arn, &topic_arn))
            .expect("queue");
        broker
            .subscribe(&topic_arn, QUEUE_PROTOCOL, &queue_arn)
            .expect("subscribe");
        broker
            .publish(&topic_arn, "start", &MessageAttributes::new())
            .expect("publish");

        // Only the confirmation is waiting; the pending subscription got nothing.
        assert_eq!(broker.visible_message_count("job-intake"), 1);
    }

    #[test]
    fn published_job_arrives_as_notification_envelope() {
        let broker = InMemoryBroker::new(REGION, ACCOUNT);
        let (topic_arn, queue_url) = wired_broker(&broker);
        let job = Job::new("j1", "e1", "p1");

        broker
            .publish(&topic_arn, "start", &job.to_attributes())
            .expect("publish");
        let received = broker
            .receive(&queue_url, &ReceiveRequest::new(10))
            .expect("receive");

        assert_eq!(received.len(), 1);
        assert!(received[0].attributes.contains_key("SentTimestamp"));
        let envelope = Envelope::decode(&received[0].body).expect("decode");
        assert_eq!(envelope.kind(), EnvelopeKind::Notification);
        assert_eq!(envelope.topic_arn, topic_arn);
        assert_eq!(Job::from_attributes(&envelope.message_attributes), Ok(job));
    }

    #[test]
    fn policy_without_topic_grant_blocks_delivery() {
        let broker = InMemoryBroker::new(REGION, ACCOUNT);
        let topic_arn = broker.create_topic("job-events").expect("topic");
        let queue_arn = format!("arn:aws:sqs:{REGION}:{ACCOUNT}:job-intake");
        broker
            .create_queue(
                "job-intake",
                &attributes_for(&queue_arn, "arn:aws:sns:ap-southeast-1:1:elsewhere"),
            )
            .expect("queue");
        broker
            .subscribe(&topic_arn, QUEUE_PROTOCOL, &queue_arn)
            .expect("subscribe");

        assert_eq!(broker.visible_message_count("job-intake"), 0);
    }

    #[test]
    fn undeleted_messages_reappear_after_visibility_timeout() {
        let broker = InMemoryBroker::new(REGION, ACCOUNT).with_visibility_timeout(Duration::ZERO);
        let (topic_arn, queue_url) = wired_broker(&broker);
        broker
            .publish(&topic_arn, "start", &MessageAttributes::new())
            .expect("publish");

        let first = broker
            .receive(&queue_url, &ReceiveRequest::new(1))
            .expect("first receive");
        let second = broker
            .receive(&queue_url, &ReceiveRequest::new(1))
            .expect("second receive");

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].message_id, second[0].message_id);
        assert_eq!(second[0].attributes["ApproximateReceiveCount"], "2");
        assert!(matches!(
            broker.delete_message(&queue_url, &first[0].receipt_handle),
            Err(BrokerError::NotFound { .. })
        ));
        broker
            .delete_message(&queue_url, &second[0].receipt_handle)
            .expect("fresh receipt deletes");
    }

    #[test]
    fn create_queue_is_idempotent_only_for_equal_attributes() {
        let broker = InMemoryBroker::new(REGION, ACCOUNT);
        let topic_arn = broker.create_topic("job-events").expect("topic");
        let queue_arn = format!("arn:aws:sqs:{REGION}:{ACCOUNT}:job-intake");
        let attributes = attributes_for(&queue_arn, &topic_arn);

        let first = broker.create_queue("job-intake", &attributes).expect("create");
        let again = broker.create_queue("job-intake", &attributes).expect("re-create");
        assert_eq!(first, again);

        let changed = QueueAttributes {
            delay_seconds: 60,
            ..attributes
        };
        assert!(matches!(
            broker.create_queue("job-intake", &changed),
            Err(BrokerError::QueueAlreadyExists { .. })
        ));
        assert!(matches!(
            broker.create_queue("bad name!", &changed),
            Err(BrokerError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn injected_failure_hits_exactly_one_call() {
        let broker = InMemoryBroker::new(REGION, ACCOUNT);
        broker.fail_next(BrokerOperation::ListTopics);

        assert!(matches!(
            broker.list_topics(),
            Err(BrokerError::Injected {
                operation: BrokerOperation::ListTopics
            })
        ));
        assert!(broker.list_topics().is_ok());
        assert_eq!(broker.call_count(BrokerOperation::ListTopics), 2);
    }

    #[test]
    fn receive_rejects_oversized_batches() {
        let broker = InMemoryBroker::new(REGION, ACCOUNT);
        let (_, queue_url) = wired_broker(&broker);

        assert!(matches!(
            broker.receive(&queue_url, &ReceiveRequest::new(11)),
            Err(BrokerError::InvalidParameter { .. })
        ));
    }
}
