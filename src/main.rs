mod broker;
mod config;
mod consumer;
mod envelope;
mod jobs;
mod logging;
mod pool;
mod publisher;
mod shutdown;
mod topology;
mod utils;

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use broker::BrokerError;
use config::AppConfig;
use consumer::{ConsumerLoop, QueueConsumer};
use jobs::TranscriptionHandler;
use logging::{LogLevel, Logger, LoggerConfig};
use pool::WorkDispatcher;
use publisher::Publisher;
use serde_json::json;
use shutdown::ShutdownHooks;
use topology::{ProvisionSettings, TopologyProvisioner};
use utils::startup_banner::{describe_roles, print_startup_banner};
use utils::timing::measure_execution;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() {
    print_startup_banner();

    let app_config = load_config_or_exit();
    let logger_config = LoggerConfig::try_from(&app_config.logging).unwrap_or_else(|error| {
        eprintln!("{error}");
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(logger_config));
    logger.log(
        LogLevel::Info,
        Some("main::config"),
        &format!(
            "{} v{} starting",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "roles": describe_roles(&app_config.role),
            "backend": app_config.broker.backend,
            "topic": app_config.topology.topic_name,
            "queue": app_config.topology.queue_name
        })),
    );

    let gateway = broker::connect(&app_config.broker, &logger).unwrap_or_else(|error| {
        eprintln!("broker connection error: {error}");
        process::exit(2);
    });

    let provisioner = TopologyProvisioner::new(
        Arc::clone(&gateway),
        ProvisionSettings::from(&app_config),
        Arc::clone(&logger),
    );
    let topology = measure_execution(
        "topology.provision",
        Some("main::topology"),
        &logger,
        || provisioner.provision(),
    )
    .unwrap_or_else(|error| {
        eprintln!("topology provisioning error: {error}");
        process::exit(2);
    });
    let Some(queue) = topology.queue(&app_config.topology.queue_name).cloned() else {
        eprintln!(
            "topology provisioning error: queue '{}' missing from provisioned topology",
            app_config.topology.queue_name
        );
        process::exit(2);
    };

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let mut consumer_side = None;
    if app_config.role.consumer {
        let handler = Arc::new(TranscriptionHandler::new(
            Duration::from_millis(app_config.consumer.job_processing_ms),
            Arc::clone(&logger),
        ));
        let dispatcher = WorkDispatcher::spawn(
            app_config.consumer.worker_count,
            handler,
            Arc::clone(&logger),
        )
        .unwrap_or_else(|error| {
            eprintln!("worker pool startup error: {error}");
            process::exit(2);
        });

        let consumer = Arc::new(QueueConsumer::new(
            Arc::clone(&gateway),
            dispatcher.handle(),
            queue.url.clone(),
            app_config.consumer.max_jobs_per_request,
            Arc::clone(&logger),
        ));
        let mut consumer_loop = ConsumerLoop::new(
            consumer,
            Duration::from_millis(app_config.consumer.poll_interval_ms),
            Arc::clone(&logger),
        );
        consumer_loop.start().unwrap_or_else(|error| {
            eprintln!("consumer startup error: {error}");
            process::exit(2);
        });
        consumer_side = Some((consumer_loop, dispatcher));
    }

    let publisher = app_config
        .role
        .publisher
        .then(|| Publisher::new(Arc::clone(&gateway), &topology, Arc::clone(&logger)));
    let demo_interval = Duration::from_millis(app_config.publisher.demo_interval_ms);
    let mut next_publish_at = Instant::now();
    let mut sequence: u64 = 0;

    while !shutdown_hooks.is_triggered() {
        if let Some(publisher) = &publisher {
            if Instant::now() >= next_publish_at {
                sequence += 1;
                if let Err(error) = publisher.publish_demo_job(sequence) {
                    logger.log(
                        LogLevel::Error,
                        Some("main::publisher"),
                        "Demo job publish failed",
                        Some(json!({ "sequence": sequence, "error": error.to_string() })),
                    );
                    // The provisioned topic is gone; nothing published from here on can arrive.
                    if matches!(error, BrokerError::NotFound { .. }) {
                        shutdown_hooks.trigger();
                    }
                }
                next_publish_at = Instant::now() + demo_interval;
            }
        }
        thread::sleep(SHUTDOWN_POLL_INTERVAL.min(demo_interval));
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    if let Some((mut consumer_loop, mut dispatcher)) = consumer_side {
        if let Err(error) = consumer_loop.stop() {
            logger.warn(Some("main::shutdown"), &format!("consumer stop error: {error}"));
        }
        if let Err(error) = dispatcher.shutdown() {
            logger.warn(Some("main::shutdown"), &format!("worker pool stop error: {error}"));
        }
    }
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Shutdown completed",
        Some(json!({ "published": sequence })),
    );
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}
