use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use userstream::{
    checkpoint::{CheckpointStore, FileCheckpointStore},
    codec::get_codec,
    dead_letter::{DeadLetterSink, FileDeadLetter, KafkaDeadLetter},
    ingester::{kafka::KafkaConsumer, Ingester},
    producer::{
        publisher::{create_producer, KafkaPublisher},
        source::HttpSource,
        Producer,
    },
    settings::{millis, DeadLetterKind, Settings},
    sink::{clickhouse::ClickHouseSink, RecordSink},
};

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish upstream profiles to the topic for a fixed window
    Produce {
        /// length of the window, in seconds
        #[arg(short, long, default_value_t = 60)]
        duration: u64,
    },
    /// Consume the topic into ClickHouse until interrupted
    Consume,
    /// Create the database and table, then exit
    Bootstrap,
}

fn clickhouse_sink(settings: &Settings) -> ClickHouseSink {
    let ch = &settings.clickhouse;
    ClickHouseSink::new(
        &ch.url,
        &ch.database,
        &ch.table,
        millis(ch.write_timeout_ms),
    )
}

async fn produce(
    settings: Settings,
    duration: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let source = HttpSource::new(&settings.source.url, millis(settings.source.request_timeout_ms))
        .context("creating http client")?;
    let timeout = millis(settings.producer.publish_timeout_ms);
    let producer = create_producer(
        &settings.kafka.brokers,
        timeout,
        &settings.kafka.client_settings(),
    )
    .context("creating kafka producer")?;
    let producer = Producer::new(
        Arc::new(source),
        Arc::new(KafkaPublisher::new(producer, &settings.kafka.topic, timeout)),
        get_codec(&settings.producer.codec)?,
        settings.producer.publish_attempts,
        millis(settings.source.fetch_interval_ms),
    );
    tokio::select! {
        summary = producer.run(duration) => info!(?summary, "done"),
        _ = cancel.cancelled() => info!("producer interrupted"),
    }
    Ok(())
}

fn dead_letter_sink(settings: &Settings) -> anyhow::Result<Arc<dyn DeadLetterSink>> {
    let sink: Arc<dyn DeadLetterSink> = match settings.dead_letter.kind {
        DeadLetterKind::File => Arc::new(FileDeadLetter::new(&settings.dead_letter.path)),
        DeadLetterKind::Kafka => {
            let timeout = millis(settings.producer.publish_timeout_ms);
            let producer = create_producer(
                &settings.kafka.brokers,
                timeout,
                &settings.kafka.client_settings(),
            )
            .context("creating dead-letter producer")?;
            Arc::new(KafkaDeadLetter::new(
                producer,
                &settings.dead_letter_topic(),
                timeout,
            ))
        }
    };
    Ok(sink)
}

async fn consume(settings: Settings, cancel: CancellationToken) -> anyhow::Result<()> {
    let sink = Arc::new(clickhouse_sink(&settings));
    sink.ensure_schema().await.context("preparing table")?;

    let topic = &settings.kafka.topic;
    let checkpoints = Arc::new(
        FileCheckpointStore::open(&settings.consumer.checkpoint_path)
            .await
            .context("opening checkpoint store")?,
    );
    let consumer = KafkaConsumer::new(
        &settings.kafka.brokers,
        &settings.kafka.consumer_group,
        topic,
        &settings.kafka.client_settings(),
    )
    .context("creating kafka consumer")?;
    let partitions = consumer.assign(
        &checkpoints.load(topic).await?,
        millis(settings.consumer.metadata_timeout_ms),
    )?;
    let driver = consumer.drive(cancel.clone());

    let ingester = Arc::new(Ingester::new(
        topic,
        get_codec(&settings.consumer.codec)?,
        sink,
        checkpoints,
        dead_letter_sink(&settings)?,
        settings.consumer.retry.clone(),
    ));
    let res = ingester.run(partitions, cancel.clone()).await;
    cancel.cancel();
    match driver.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(e) => warn!(error = %e, "consumer driver task failed"),
    }
    let summaries = res?;
    for s in summaries {
        info!(
            partition = s.partition,
            written = s.written,
            dead_lettered = s.dead_lettered,
            skipped = s.skipped,
            gaps = s.gaps,
            checkpoint = ?s.checkpoint,
            "partition done"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::new(&args.config).context("cannot load config")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, finishing current messages");
            on_signal.cancel();
        }
    });

    match args.command {
        Command::Produce { duration } => {
            produce(settings, Duration::from_secs(duration), cancel).await
        }
        Command::Consume => consume(settings, cancel).await,
        Command::Bootstrap => {
            clickhouse_sink(&settings)
                .ensure_schema()
                .await
                .context("preparing table")?;
            info!("schema ready");
            Ok(())
        }
    }
}
