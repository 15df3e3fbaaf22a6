use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use serde_json::json;

use crate::broker::{BrokerError, BrokerGateway, BrokerOperation, ReceiveRequest, ReceivedMessage};
use crate::envelope::{Envelope, InboundMessage};
use crate::logging::{LogLevel, Logger};
use crate::pool::DispatcherHandle;

/// Broker call that failed while consuming; logged and retried on the next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub operation: BrokerOperation,
    pub source: BrokerError,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker call '{}' failed: {}", self.operation.as_str(), self.source)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug)]
pub enum ConsumerError {
    AlreadyRunning,
    Spawn { source: io::Error },
    JoinFailed,
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "consumer loop is already running"),
            Self::Spawn { source } => write!(f, "failed to spawn consumer thread: {source}"),
            Self::JoinFailed => write!(f, "consumer thread join failed"),
        }
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source } => Some(source),
            _ => None,
        }
    }
}

/// What a single poll did with the messages it received.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub received: usize,
    /// Jobs accepted by a worker.
    pub dispatched: usize,
    pub deleted: usize,
    /// Undecodable or unrecognized messages, deleted without processing.
    pub dropped: usize,
    /// Jobs the pool refused; left in the queue to reappear after the visibility timeout.
    pub retained: usize,
    /// Messages not looked at because the loop was stopping; redelivered after the visibility timeout.
    pub skipped: usize,
    pub transport_errors: usize,
}

pub struct QueueConsumer {
    gateway: Arc<dyn BrokerGateway>,
    dispatcher: DispatcherHandle,
    queue_url: String,
    max_jobs_per_request: u32,
    logger: Arc<Logger>,
}

impl QueueConsumer {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        dispatcher: DispatcherHandle,
        queue_url: impl Into<String>,
        max_jobs_per_request: u32,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            gateway,
            dispatcher,
            queue_url: queue_url.into(),
            max_jobs_per_request,
            logger,
        }
    }

    /// Receives one batch and routes every message in broker order.
    pub fn tick(&self) -> TickReport {
        self.tick_until_stopped(&AtomicBool::new(false))
    }

    /// Like [`tick`](Self::tick), but hands nothing more to the pool once `stopping` is set.
    fn tick_until_stopped(&self, stopping: &AtomicBool) -> TickReport {
        let mut report = TickReport::default();
        let request = ReceiveRequest::new(self.max_jobs_per_request);

        let messages = match self.gateway.receive(&self.queue_url, &request) {
            Ok(messages) => messages,
            Err(source) => {
                self.report_transport_error(
                    TransportError {
                        operation: BrokerOperation::Receive,
                        source,
                    },
                    &mut report,
                );
                return report;
            }
        };

        report.received = messages.len();
        for (position, message) in messages.into_iter().enumerate() {
            if stopping.load(Ordering::SeqCst) {
                report.skipped = report.received - position;
                self.logger.log(
                    LogLevel::Info,
                    Some("consumer::tick"),
                    "Stopping mid-batch; remaining messages stay in queue",
                    Some(json!({ "skipped": report.skipped })),
                );
                break;
            }
            self.handle_message(message, &mut report);
        }

        if report.received > 0 {
            self.logger.log(
                LogLevel::Debug,
                Some("consumer::tick"),
                "Poll finished",
                Some(json!({
                    "received": report.received,
                    "dispatched": report.dispatched,
                    "deleted": report.deleted,
                    "dropped": report.dropped,
                    "retained": report.retained,
                    "skipped": report.skipped,
                    "transport_errors": report.transport_errors
                })),
            );
        }
        report
    }

    fn handle_message(&self, message: ReceivedMessage, report: &mut TickReport) {
        let routed = Envelope::decode(&message.body).and_then(|envelope| envelope.route());
        if self.logger.enabled(LogLevel::Trace) {
            self.logger.log(
                LogLevel::Trace,
                Some("consumer::route"),
                "Message received",
                Some(json!({
                    "message_id": message.message_id,
                    "attributes": message.attributes,
                    "decoded": routed.is_ok()
                })),
            );
        }

        match routed {
            Ok(InboundMessage::StartJob(job)) => {
                let job_id = job.job_id.clone();
                match self.dispatcher.submit(job) {
                    Ok(worker_id) => {
                        report.dispatched += 1;
                        self.logger.log(
                            LogLevel::Debug,
                            Some("consumer::dispatch"),
                            "Job handed to worker",
                            Some(json!({ "job_id": job_id, "worker_id": worker_id })),
                        );
                        self.delete(&message, report);
                    }
                    Err(error) => {
                        report.retained += 1;
                        self.logger.log(
                            LogLevel::Warn,
                            Some("consumer::dispatch"),
                            "Job not accepted; leaving message in queue",
                            Some(json!({
                                "job_id": job_id,
                                "message_id": message.message_id,
                                "error": error.to_string()
                            })),
                        );
                    }
                }
            }
            Ok(InboundMessage::Unrecognized {
                message_type,
                message: payload,
            }) => {
                report.dropped += 1;
                self.logger.log(
                    LogLevel::Warn,
                    Some("consumer::route"),
                    "Dropping unrecognized message",
                    Some(json!({
                        "message_id": message.message_id,
                        "type": message_type,
                        "message": payload
                    })),
                );
                self.delete(&message, report);
            }
            Err(error) => {
                report.dropped += 1;
                self.logger.log(
                    LogLevel::Error,
                    Some("consumer::decode"),
                    "Dropping undecodable message",
                    Some(json!({
                        "message_id": message.message_id,
                        "error": error.to_string()
                    })),
                );
                self.delete(&message, report);
            }
        }
    }

    fn delete(&self, message: &ReceivedMessage, report: &mut TickReport) {
        match self
            .gateway
            .delete_message(&self.queue_url, &message.receipt_handle)
        {
            Ok(()) => report.deleted += 1,
            Err(source) => self.report_transport_error(
                TransportError {
                    operation: BrokerOperation::DeleteMessage,
                    source,
                },
                report,
            ),
        }
    }

    fn report_transport_error(&self, error: TransportError, report: &mut TickReport) {
        report.transport_errors += 1;
        self.logger.log(
            LogLevel::Error,
            Some("consumer::transport"),
            "Broker call failed",
            Some(json!({
                "queue_url": self.queue_url,
                "operation": error.operation.as_str(),
                "error": error.to_string()
            })),
        );
    }
}

/// Runs [`QueueConsumer::tick`] on its own thread every `poll_interval`.
pub struct ConsumerLoop {
    consumer: Arc<QueueConsumer>,
    poll_interval: Duration,
    stop_signal: Option<Sender<()>>,
    stopping: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    logger: Arc<Logger>,
}

impl ConsumerLoop {
    pub fn new(consumer: Arc<QueueConsumer>, poll_interval: Duration, logger: Arc<Logger>) -> Self {
        Self {
            consumer,
            poll_interval,
            stop_signal: None,
            stopping: Arc::new(AtomicBool::new(false)),
            worker: None,
            logger,
        }
    }

    pub fn start(&mut self) -> Result<(), ConsumerError> {
        if self.worker.is_some() {
            return Err(ConsumerError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let stopping = Arc::new(AtomicBool::new(false));
        let consumer = Arc::clone(&self.consumer);
        let poll_interval = self.poll_interval;
        let worker_stopping = Arc::clone(&stopping);

        let worker = thread::Builder::new()
            .name("jobrelay-consumer".to_owned())
            .spawn(move || {
                let ticker = tick(poll_interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            consumer.tick_until_stopped(&worker_stopping);
                        },
                    }
                }
            })
            .map_err(|source| ConsumerError::Spawn { source })?;

        self.logger.log(
            LogLevel::Info,
            Some("consumer::start"),
            "Consumer loop started",
            Some(json!({
                "queue_url": self.consumer.queue_url,
                "poll_interval_ms": self.poll_interval.as_millis() as u64,
                "max_jobs_per_request": self.consumer.max_jobs_per_request
            })),
        );

        self.stop_signal = Some(stop_tx);
        self.stopping = stopping;
        self.worker = Some(worker);
        Ok(())
    }

    /// Stops the ticker and joins it.
    ///
    /// A poll in progress finishes the submit it is blocked on, if any, and
    /// leaves the rest of its batch undeleted in the queue.
    pub fn stop(&mut self) -> Result<(), ConsumerError> {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(stop) = self.stop_signal.take() {
            let _ = stop.try_send(());
        }

        if let Some(handle) = self.worker.take() {
            handle.join().map_err(|_| ConsumerError::JoinFailed)?;
            self.logger.info(Some("consumer::stop"), "Consumer loop stopped");
        }

        Ok(())
    }
}

impl Drop for ConsumerLoop {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crossbeam_channel::{unbounded, Sender};

    use crate::broker::{BrokerGateway, BrokerOperation, InMemoryBroker, MessageAttributes};
    use crate::config::test_support::sample_app_config;
    use crate::envelope::Envelope;
    use crate::jobs::{Job, JobError, JobHandler};
    use crate::logging::test_support::{capturing_logger, MemorySink};
    use crate::logging::Logger;
    use crate::pool::WorkDispatcher;
    use crate::publisher::{Publisher, StartJobMessage};
    use crate::topology::{ProvisionSettings, Topology, TopologyProvisioner};

    use super::{ConsumerError, ConsumerLoop, QueueConsumer, TickReport};

    struct ForwardingHandler {
        seen: Sender<Job>,
    }

    impl JobHandler for ForwardingHandler {
        fn process(&self, job: &Job) -> Result<(), JobError> {
            let _ = self.seen.send(job.clone());
            Ok(())
        }
    }

    struct SlowHandler {
        started: Sender<Job>,
        work: Duration,
    }

    impl JobHandler for SlowHandler {
        fn process(&self, job: &Job) -> Result<(), JobError> {
            let _ = self.started.send(job.clone());
            thread::sleep(self.work);
            Ok(())
        }
    }

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        topology: Topology,
        logger: Arc<Logger>,
        sink: Arc<MemorySink>,
    }

    impl Fixture {
        fn new() -> Self {
            let (logger, sink) = capturing_logger();
            let broker = Arc::new(InMemoryBroker::new("ap-southeast-1", "123456789012"));
            let gateway: Arc<dyn BrokerGateway> = broker.clone();
            let topology = TopologyProvisioner::new(
                gateway,
                ProvisionSettings::from(&sample_app_config()),
                Arc::clone(&logger),
            )
            .provision()
            .expect("topology should provision");

            Self {
                broker,
                topology,
                logger,
                sink,
            }
        }

        fn queue_url(&self) -> String {
            self.topology.queues[0].url.clone()
        }

        fn consumer(&self, dispatcher: &WorkDispatcher) -> QueueConsumer {
            let gateway: Arc<dyn BrokerGateway> = self.broker.clone();
            QueueConsumer::new(
                gateway,
                dispatcher.handle(),
                self.queue_url(),
                10,
                Arc::clone(&self.logger),
            )
        }

        fn publish_job(&self, job: &Job) {
            self.broker
                .publish(&self.topology.topic_arn, "start", &job.to_attributes())
                .expect("publish should succeed");
        }

        fn deletes(&self) -> usize {
            self.broker.call_count(BrokerOperation::DeleteMessage)
        }
    }

    fn forwarding_pool(logger: &Arc<Logger>) -> (WorkDispatcher, crossbeam_channel::Receiver<Job>) {
        let (seen_tx, seen_rx) = unbounded();
        let dispatcher = WorkDispatcher::spawn(
            2,
            Arc::new(ForwardingHandler { seen: seen_tx }),
            Arc::clone(logger),
        )
        .expect("pool should start");
        (dispatcher, seen_rx)
    }

    #[test]
    fn accepted_job_is_deleted_after_handoff() {
        let fixture = Fixture::new();
        let (mut dispatcher, seen) = forwarding_pool(&fixture.logger);
        let consumer = fixture.consumer(&dispatcher);
        let deletes_before = fixture.deletes();

        fixture.publish_job(&Job::new("j1", "e1", "p1"));
        let report = consumer.tick();

        assert_eq!(
            report,
            TickReport {
                received: 1,
                dispatched: 1,
                deleted: 1,
                ..TickReport::default()
            }
        );
        assert_eq!(fixture.deletes() - deletes_before, 1);
        assert_eq!(
            seen.recv_timeout(Duration::from_secs(2)).expect("job should run"),
            Job::new("j1", "e1", "p1")
        );
        dispatcher.shutdown().expect("shutdown should join");
    }

    #[test]
    fn refused_job_stays_in_queue() {
        let fixture = Fixture::new();
        let (mut dispatcher, _seen) = forwarding_pool(&fixture.logger);
        let consumer = fixture.consumer(&dispatcher);
        dispatcher.shutdown().expect("shutdown should join");
        let deletes_before = fixture.deletes();

        fixture.publish_job(&Job::new("j1", "e1", "p1"));
        let report = consumer.tick();

        assert_eq!(report.dispatched, 0);
        assert_eq!(report.retained, 1);
        assert_eq!(fixture.deletes(), deletes_before);
        assert!(fixture.sink.contains("leaving message in queue"));
    }

    #[test]
    fn undecodable_messages_are_dropped_and_polling_continues() {
        let fixture = Fixture::new();
        let (mut dispatcher, seen) = forwarding_pool(&fixture.logger);
        let consumer = fixture.consumer(&dispatcher);

        let mut missing_engine = Job::new("j0", "e0", "p0").to_attributes();
        missing_engine.remove("engineID");
        fixture.broker
            .publish(&fixture.topology.topic_arn, "start", &missing_engine)
            .expect("publish");
        fixture.broker
            .inject_raw_message("job-intake", "{\"Type\": \"Notification\"")
            .expect("inject");
        fixture.publish_job(&Job::new("j1", "e1", "p1"));

        let report = consumer.tick();
        assert_eq!(report.received, 3);
        assert_eq!(report.dropped, 2);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.deleted, 3);
        assert!(fixture.sink.contains("Dropping undecodable message"));
        assert!(fixture.sink.contains("engineID"));

        let next = consumer.tick();
        assert_eq!(next, TickReport::default());
        assert_eq!(
            seen.recv_timeout(Duration::from_secs(2)).expect("valid job should run").job_id,
            "j1"
        );
        dispatcher.shutdown().expect("shutdown should join");
    }

    #[test]
    fn unrecognized_payload_is_deleted() {
        let fixture = Fixture::new();
        let (mut dispatcher, _seen) = forwarding_pool(&fixture.logger);
        let consumer = fixture.consumer(&dispatcher);

        fixture.broker
            .publish(&fixture.topology.topic_arn, "stop", &MessageAttributes::new())
            .expect("publish");
        let confirmation = Envelope::subscription_confirmation(
            "m-1",
            fixture.topology.topic_arn.as_str(),
            "token",
            "https://sns.local/confirm",
        );
        fixture.broker
            .inject_raw_message("job-intake", &confirmation.encode())
            .expect("inject");

        let report = consumer.tick();
        assert_eq!(report.dropped, 2);
        assert_eq!(report.deleted, 2);
        assert_eq!(fixture.broker.visible_message_count("job-intake"), 0);
        dispatcher.shutdown().expect("shutdown should join");
    }

    #[test]
    fn transport_failures_are_reported_and_survived() {
        let fixture = Fixture::new();
        let (mut dispatcher, _seen) = forwarding_pool(&fixture.logger);
        let consumer = fixture.consumer(&dispatcher);
        fixture.publish_job(&Job::new("j1", "e1", "p1"));

        fixture.broker.fail_next(BrokerOperation::Receive);
        let failed = consumer.tick();
        assert_eq!(failed.transport_errors, 1);
        assert_eq!(failed.received, 0);
        assert!(fixture.sink.contains("\"operation\":\"receive\""));

        fixture.broker.fail_next(BrokerOperation::DeleteMessage);
        let undeleted = consumer.tick();
        assert_eq!(undeleted.dispatched, 1);
        assert_eq!(undeleted.deleted, 0);
        assert_eq!(undeleted.transport_errors, 1);
        dispatcher.shutdown().expect("shutdown should join");
    }

    #[test]
    fn consumer_loop_rejects_double_start() {
        let fixture = Fixture::new();
        let (mut dispatcher, _seen) = forwarding_pool(&fixture.logger);
        let consumer = Arc::new(fixture.consumer(&dispatcher));
        let mut consumer_loop =
            ConsumerLoop::new(consumer, Duration::from_millis(20), Arc::clone(&fixture.logger));

        consumer_loop.start().expect("first start");
        assert!(matches!(
            consumer_loop.start(),
            Err(ConsumerError::AlreadyRunning)
        ));
        consumer_loop.stop().expect("stop should join");
        consumer_loop.stop().expect("second stop is a no-op");
        dispatcher.shutdown().expect("shutdown should join");
    }

    #[test]
    fn published_job_is_consumed_processed_and_deleted_once() {
        let fixture = Fixture::new();
        let (mut dispatcher, seen) = forwarding_pool(&fixture.logger);
        let consumer = Arc::new(fixture.consumer(&dispatcher));
        let mut consumer_loop =
            ConsumerLoop::new(consumer, Duration::from_millis(20), Arc::clone(&fixture.logger));
        let deletes_before = fixture.deletes();

        let gateway: Arc<dyn BrokerGateway> = fixture.broker.clone();
        let publisher = Publisher::new(gateway, &fixture.topology, Arc::clone(&fixture.logger));
        publisher
            .publish(&StartJobMessage::new(Job::new("j1", "e1", "p1")))
            .expect("publish should succeed");

        consumer_loop.start().expect("consumer should start");
        let processed = seen
            .recv_timeout(Duration::from_secs(2))
            .expect("job should be processed");
        consumer_loop.stop().expect("consumer should stop");
        dispatcher.shutdown().expect("shutdown should join");

        assert_eq!(processed, Job::new("j1", "e1", "p1"));
        assert!(seen.try_recv().is_err());
        assert_eq!(fixture.deletes() - deletes_before, 1);
        assert_eq!(fixture.broker.visible_message_count("job-intake"), 0);
    }

    #[test]
    fn stop_leaves_unsubmitted_part_of_batch_in_queue() {
        let fixture = Fixture::new();
        let (started_tx, started) = unbounded();
        let mut dispatcher = WorkDispatcher::spawn(
            1,
            Arc::new(SlowHandler {
                started: started_tx,
                work: Duration::from_millis(300),
            }),
            Arc::clone(&fixture.logger),
        )
        .expect("pool should start");
        let consumer = Arc::new(fixture.consumer(&dispatcher));
        let mut consumer_loop =
            ConsumerLoop::new(consumer, Duration::from_millis(10), Arc::clone(&fixture.logger));
        let deletes_before = fixture.deletes();

        for index in 0..6 {
            fixture.publish_job(&Job::new(format!("j{index}"), "e1", "p1"));
        }
        consumer_loop.start().expect("consumer should start");
        started
            .recv_timeout(Duration::from_secs(2))
            .expect("first job should start");

        let stop_started = Instant::now();
        consumer_loop.stop().expect("consumer should stop");
        let stop_took = stop_started.elapsed();
        dispatcher.shutdown().expect("shutdown should join");

        let processed = 1 + started.try_iter().count();
        assert!(stop_took < Duration::from_millis(1_000), "stop took {stop_took:?}");
        assert!(processed <= 2, "{processed} jobs were handed to the worker");
        assert_eq!(fixture.deletes() - deletes_before, processed);
        assert!(fixture.sink.contains("Stopping mid-batch"));
    }
}
