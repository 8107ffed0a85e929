//! CLI for PopMQ
//!
//! Subcommands:
//! - `push`: run a push consumer that logs every delivered message
//! - `pull`: run a pull consumer that logs every pulled message
//!
//! Both run until Ctrl-C, then shut down gracefully.

use std::sync::Arc;

use clap::{Args, Parser};
use popmq::config::{Settings, load_config};
use popmq::utils::logging;
use popmq::{ConsumerStatus, ListenerContext, MqConsumer, MqMessage, PullConsumer, PushConsumer};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "popmq", about = "popmq consumer runtime")]
enum Command {
    /// Run a push consumer
    Push(Subscription),
    /// Run a pull consumer
    Pull(Subscription),
}

#[derive(Args)]
struct Subscription {
    /// Topic to subscribe to
    #[arg(long)]
    topic: String,
    /// Tag pattern to match
    #[arg(long, default_value = "*")]
    tag: String,
    /// Consumer group, overrides the configured one
    #[arg(long)]
    group: Option<String>,
    /// Comma separated `host:port[:weight]` list, overrides the configured one
    #[arg(long)]
    brokers: Option<String>,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&settings.log.level);

    let result = match cmd {
        Command::Push(sub) => run(ConsumerKind::Push, settings, sub).await,
        Command::Pull(sub) => run(ConsumerKind::Pull, settings, sub).await,
    };
    if let Err(e) = result {
        error!("Consumer failed: {:#}", e);
        std::process::exit(1);
    }
}

enum ConsumerKind {
    Push,
    Pull,
}

async fn run(kind: ConsumerKind, mut settings: Settings, sub: Subscription) -> anyhow::Result<()> {
    if let Some(group) = sub.group {
        settings.consumer.group_name = group;
    }
    if let Some(brokers) = sub.brokers {
        settings.consumer.broker_address = brokers;
    }

    let consumer: Box<dyn MqConsumer> = match kind {
        ConsumerKind::Push => Box::new(PushConsumer::new(settings.consumer)?),
        ConsumerKind::Pull => Box::new(PullConsumer::new(settings.consumer, settings.pull)?),
    };
    consumer.register_listener(Arc::new(log_message));

    consumer.start().await?;
    consumer.subscribe(&sub.topic, &sub.tag).await?;
    info!("Consuming {} [{}]. Press Ctrl-C to stop.", sub.topic, sub.tag);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    consumer.shutdown().await;
    Ok(())
}

fn log_message(message: &MqMessage, context: &ListenerContext) -> anyhow::Result<ConsumerStatus> {
    info!(
        "[{}] {} {:?}: {}",
        context.group_name,
        message.topic,
        message.tags,
        message.payload
    );
    Ok(ConsumerStatus::Success)
}
