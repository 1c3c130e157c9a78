use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use courier_core::app::DeliveryOutcome;
use courier_core::app::builder::Courier;
use courier_core::app::consumer::EventHandler;
use courier_core::app::dead_letter::TopicActionHandler;
use courier_core::config::{self, CourierConfig};
use courier_core::domain::dead_letter::{HEADER_FIRST_DEATH_QUEUE, HEADER_FIRST_DEATH_REASON};
use courier_core::domain::{DeadLetterAction, Event, ProcessOutcome, RetryPolicy};
use courier_core::impls::{InMemoryBroker, InMemoryTaskStore, RecordingChannel};
use courier_core::observability::init_logging;
use courier_core::ports::{Delivery, FixedClock};
use courier_core::{CourierBuilder, EventMessage, MessageId};

/// Reliable event delivery: outbox, retries, dead letters and recovery.
#[derive(Parser, Debug)]
#[command(name = "courier", version, about, long_about = None)]
struct Cli {
    /// TOML config file. Missing files are skipped.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publish, consume with a failing consumer, retry until the budget runs out.
    Demo {
        /// Consumer failures before it starts succeeding.
        #[arg(long, default_value_t = u32::MAX)]
        failures: u32,
    },
    /// Seed stuck tasks and run one full recovery sweep.
    Recover,
    /// Feed a dead-lettered delivery through the handler chain.
    DeadLetter {
        /// Retry count recorded on the task before it is dead-lettered.
        #[arg(long, default_value_t = 11)]
        retry_count: u32,
    },
    /// Run scheduled recovery until ctrl-c.
    Run,
}

#[derive(Debug, Serialize, Deserialize)]
struct PartCreated {
    part_id: u64,
    name: String,
}

impl Event for PartCreated {
    const TOPIC: &'static str = "catalog.part.created";
}

struct FlakyPartHandler {
    remaining_failures: AtomicU32,
}

impl FlakyPartHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl EventHandler<PartCreated> for FlakyPartHandler {
    async fn handle(&self, event: PartCreated, message: &EventMessage) -> ProcessOutcome {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return ProcessOutcome::business_failure(format!("intentional failure (left={left})"));
        }
        info!(message_id = %message.id, part_id = event.part_id, name = %event.name, "part registered");
        ProcessOutcome::Ok
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config_from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => config::load_config().context("loading config")?,
    };
    init_logging(&config.logging);

    match cli.command.unwrap_or(Commands::Demo { failures: u32::MAX }) {
        Commands::Demo { failures } => demo(config, failures).await,
        Commands::Recover => recover(config).await,
        Commands::DeadLetter { retry_count } => dead_letter(config, retry_count).await,
        Commands::Run => run(config).await,
    }
}

async fn demo(mut config: CourierConfig, failures: u32) -> Result<()> {
    config.retry.policies = config.retry.policies.with_policy(
        PartCreated::TOPIC,
        RetryPolicy {
            max_attempts: 3,
            delays_ms: vec![100, 200, 400],
            ..RetryPolicy::default()
        },
    );
    let broker = InMemoryBroker::new();
    let courier = CourierBuilder::new(config)
        .broker(Arc::new(broker.clone()))
        .register::<PartCreated, _>(FlakyPartHandler::new(failures))?
        .expect_topics(&[PartCreated::TOPIC])
        .build()?;

    let event = EventMessage::from_event(&PartCreated {
        part_id: 42,
        name: "brake pad".to_string(),
    })?;
    courier.publisher.publish(&event).await?;
    println!("published: id={}", event.id);

    // The in-memory broker does not redeliver; each loop turn stands in for one delivery.
    let channel = RecordingChannel::new();
    let mut tag = 1;
    loop {
        let outcome = courier.dispatch(&Delivery::new(tag, event.clone()), &channel).await;
        println!("delivery #{tag}: {outcome:?}");
        if outcome != DeliveryOutcome::RetryScheduled {
            break;
        }
        tag += 1;
    }

    if let Some(stats) = courier.retry.get_retry_stats(&event.id).await {
        println!("retry stats: {}", serde_json::to_string_pretty(&stats)?);
    }
    println!("acks/nacks: {:?}", channel.acknowledgements().await);
    println!("broker sends: {}", broker.published().await.len());
    print_counts(&courier).await
}

async fn recover(config: CourierConfig) -> Result<()> {
    let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
    let broker = InMemoryBroker::new();
    let courier = CourierBuilder::new(config)
        .store(Arc::new(InMemoryTaskStore::new()))
        .broker(Arc::new(broker.clone()))
        .clock(clock.clone())
        .build()?;

    for n in 1..=5 {
        let event = EventMessage::new(
            MessageId::new(format!("seed-{n}")),
            PartCreated::TOPIC,
            json!({ "part_id": n, "name": "seeded" }),
        );
        courier.persistence.persist(&event).await?;
    }
    courier.persistence.mark_processing(&MessageId::new("seed-5")).await;
    broker.fail_for(MessageId::new("seed-2")).await;
    clock.advance(chrono::Duration::minutes(5));

    let before = courier.recovery.check_message_consistency().await;
    println!("before: {}", serde_json::to_string_pretty(&before)?);

    let recovered = courier.recovery.full_message_recovery().await;
    println!("recovered: {recovered}");

    let after = courier.recovery.check_message_consistency().await;
    println!("after: {}", serde_json::to_string_pretty(&after)?);
    Ok(())
}

async fn dead_letter(config: CourierConfig, retry_count: u32) -> Result<()> {
    let requeue = TopicActionHandler::new("requeue-parts", &[PartCreated::TOPIC], DeadLetterAction::Requeue)
        .with_priority(10);
    let courier = CourierBuilder::new(config)
        .dead_letter_handler(Arc::new(requeue))
        .build()?;

    let event = EventMessage::new(
        MessageId::new("dlq-1"),
        PartCreated::TOPIC,
        json!({ "part_id": 7, "name": "rotor" }),
    );
    courier.persistence.persist(&event).await?;
    courier.persistence.mark_failed(&event.id, "consumer rejected").await;
    courier
        .persistence
        .update_retry_info(&event.id, retry_count, "consumer rejected")
        .await;

    let delivery = Delivery::new(1, event.clone())
        .with_routing_key(courier.config.broker.routing_key.clone())
        .with_header(HEADER_FIRST_DEATH_QUEUE, "catalog.parts")
        .with_header(HEADER_FIRST_DEATH_REASON, "rejected");
    let channel = RecordingChannel::new();
    let resolution = courier.handle_dead_letter(&delivery, &channel).await;

    println!("resolution: {resolution:?}");
    println!("acks/nacks: {:?}", channel.acknowledgements().await);
    println!(
        "dead-letter stats: {}",
        serde_json::to_string_pretty(&courier.dead_letter.stats().await)?
    );
    if let Some(task) = courier.persistence.get_task_info(&event.id).await? {
        println!("task: state={} error={:?}", task.state, task.error_message);
    }
    Ok(())
}

async fn run(config: CourierConfig) -> Result<()> {
    let courier = CourierBuilder::new(config).build()?;
    let Some(recovery) = courier.spawn_recovery() else {
        println!("recovery disabled in config, nothing to run");
        return Ok(());
    };
    info!("running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    recovery.shutdown_and_join().await;
    Ok(())
}

async fn print_counts(courier: &Courier) -> Result<()> {
    let counts = courier.persistence.state_counts().await?;
    println!("task states: {}", serde_json::to_string(&counts)?);
    Ok(())
}
