//! Time-boxed ingestion from the upstream API into the topic
//!
//! One iteration fetches a profile, gives it a fresh id, encodes it and
//! publishes it keyed by that id. Publish attempts for a record all carry the
//! same bytes, so a retry can at worst duplicate a message the sink will
//! collapse. Failures never stop the loop; the deadline always does.
pub mod publisher;
pub mod source;

use std::{sync::Arc, time::Duration};

use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::{codec::Codec, record::UserRecord};
use publisher::Publisher;
use source::{format_user, UserSource};

/// Counters of one bounded run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub fetched: u64,
    pub published: u64,
    pub fetch_failures: u64,
    /// Records given up on after every publish attempt failed.
    pub dropped: u64,
}

pub struct Producer {
    source: Arc<dyn UserSource>,
    publisher: Arc<dyn Publisher>,
    codec: Arc<dyn Codec + Send + Sync>,
    publish_attempts: usize,
    fetch_interval: Duration,
}

enum Outcome {
    Published,
    FetchFailed,
    Dropped,
}

impl Producer {
    pub fn new(
        source: Arc<dyn UserSource>,
        publisher: Arc<dyn Publisher>,
        codec: Arc<dyn Codec + Send + Sync>,
        publish_attempts: usize,
        fetch_interval: Duration,
    ) -> Self {
        Producer {
            source,
            publisher,
            codec,
            publish_attempts: publish_attempts.max(1),
            fetch_interval,
        }
    }

    /// Produces records until `duration` has elapsed, then returns even if a
    /// fetch or publish is still in flight.
    pub async fn run(&self, duration: Duration) -> RunSummary {
        let deadline = Instant::now() + duration;
        let mut summary = RunSummary::default();
        info!(?duration, codec = self.codec.get_name(), "producer started");
        while Instant::now() < deadline {
            let outcome = timeout_at(deadline, self.produce_one(&mut summary)).await;
            match outcome {
                Ok(Outcome::Published) => summary.published += 1,
                Ok(Outcome::FetchFailed) => summary.fetch_failures += 1,
                Ok(Outcome::Dropped) => summary.dropped += 1,
                Err(_) => {
                    debug!("deadline reached with work in flight");
                    break;
                }
            }
            if !self.fetch_interval.is_zero()
                && timeout_at(deadline, sleep(self.fetch_interval)).await.is_err()
            {
                break;
            }
        }
        info!(
            fetched = summary.fetched,
            published = summary.published,
            fetch_failures = summary.fetch_failures,
            dropped = summary.dropped,
            "producer finished"
        );
        summary
    }

    async fn produce_one(&self, summary: &mut RunSummary) -> Outcome {
        let profile = match self.source.fetch().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "fetch failed");
                return Outcome::FetchFailed;
            }
        };
        summary.fetched += 1;
        let record = match format_user(&profile, UserRecord::new_id()) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "skipping upstream profile");
                return Outcome::FetchFailed;
            }
        };
        let payload = match self.codec.encode(&record) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "encoding failed");
                return Outcome::Dropped;
            }
        };
        for attempt in 1..=self.publish_attempts {
            match self.publisher.publish(&record.id, &payload).await {
                Ok(()) => {
                    debug!(id = %record.id, attempt, "published");
                    return Outcome::Published;
                }
                Err(e) => {
                    warn!(id = %record.id, attempt, error = %e, "publish failed");
                }
            }
        }
        error!(id = %record.id, attempts = self.publish_attempts, "dropping record");
        Outcome::Dropped
    }
}
