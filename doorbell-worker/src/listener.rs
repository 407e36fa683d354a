use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time;

use doorbell_common::event::DoorbellEvent;
use doorbell_common::events::{Claim, EventSource};
use doorbell_common::retry::RetryPolicy;
use futures::FutureExt;
use health::HealthHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pipeline::Pipeline;

/// A listener polling the `EventSource` and spawning one task per claimed event.
pub struct DoorbellListener {
    /// An identifier for this worker. Recorded on the events we claim.
    name: String,
    /// The feed we consume doorbell events from.
    source: Arc<dyn EventSource>,
    /// What to run for each claimed event.
    pipeline: Arc<Pipeline>,
    /// The interval for polling the feed.
    poll_interval: time::Duration,
    /// The maximum number of events to fetch per poll.
    poll_batch_size: u32,
    /// Maximum number of events being processed at once.
    max_concurrent_events: usize,
    /// Backoff applied to the claim of an event whose processing failed.
    retry_policy: RetryPolicy,
    /// The liveness check handle, to call on a schedule to report healthy.
    liveness: HealthHandle,
}

impl DoorbellListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        source: Arc<dyn EventSource>,
        pipeline: Arc<Pipeline>,
        poll_interval: time::Duration,
        poll_batch_size: u32,
        max_concurrent_events: usize,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            source,
            pipeline,
            poll_interval,
            poll_batch_size,
            max_concurrent_events: max_concurrent_events.max(1),
            retry_policy,
            liveness,
        }
    }

    /// Consume events until `shutdown` is cancelled, then wait for in-flight events to finish.
    /// Failures are isolated per event: nothing that happens to one event stops the loop.
    pub async fn run(&self, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_events));
        let mut tasks = JoinSet::new();
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(worker = self.name.as_str(), "listening for doorbell events");

        'poll: loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            self.liveness.report_healthy();
            reap_finished(&mut tasks);
            metrics::gauge!("doorbell_worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_events as f64,
            );

            let events = match self.source.poll(self.poll_batch_size).await {
                Ok(events) => events,
                Err(error) => {
                    error!("error while polling doorbell events: {}", error);
                    continue;
                }
            };

            for event in events {
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break 'poll,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'poll,
                    },
                };

                if let Some(attempt) = self.claim(&event).await {
                    self.spawn_event_task(&mut tasks, permit, event, attempt);
                }
            }
        }

        info!(
            in_flight = tasks.len(),
            "shutting down, waiting for in-flight events"
        );
        while let Some(joined) = tasks.join_next().await {
            log_join_error(joined);
        }
    }

    /// Claim guard: skip events that are already claimed, otherwise claim before any work.
    async fn claim(&self, event: &DoorbellEvent) -> Option<i32> {
        if event.claim_state.is_claimed() {
            debug!(event_id = event.id.as_str(), "skipping already claimed event");
            metrics::counter!("doorbell_events_skipped").increment(1);
            return None;
        }

        match self.source.try_claim(&event.id, &self.name).await {
            Ok(Claim::Acquired { attempt }) => {
                metrics::counter!("doorbell_events_claimed").increment(1);
                Some(attempt)
            }
            Ok(Claim::AlreadyClaimed) => {
                debug!(event_id = event.id.as_str(), "event claimed by someone else");
                metrics::counter!("doorbell_events_skipped").increment(1);
                None
            }
            Err(error) => {
                error!(
                    event_id = event.id.as_str(),
                    "failed to claim event: {}", error
                );
                None
            }
        }
    }

    fn spawn_event_task(
        &self,
        tasks: &mut JoinSet<()>,
        permit: OwnedSemaphorePermit,
        event: DoorbellEvent,
        attempt: i32,
    ) {
        let source = self.source.clone();
        let pipeline = self.pipeline.clone();
        let retry_policy = self.retry_policy.clone();

        tasks.spawn(async move {
            process_claimed_event(source, pipeline, &retry_policy, event, attempt).await;
            drop(permit);
        });
    }
}

/// Run the pipeline for a claimed event, releasing the claim if the run fails or panics.
async fn process_claimed_event(
    source: Arc<dyn EventSource>,
    pipeline: Arc<Pipeline>,
    retry_policy: &RetryPolicy,
    event: DoorbellEvent,
    attempt: i32,
) {
    let now = tokio::time::Instant::now();

    let failure = match AssertUnwindSafe(pipeline.process(&event))
        .catch_unwind()
        .await
    {
        Ok(Ok(_)) => None,
        Ok(Err(error)) => Some(error.to_string()),
        Err(_) => Some("event processing panicked".to_owned()),
    };

    let elapsed = now.elapsed().as_secs_f64();
    metrics::histogram!("doorbell_event_processing_duration_seconds").record(elapsed);

    let Some(failure) = failure else {
        metrics::counter!("doorbell_events_completed").increment(1);
        return;
    };

    metrics::counter!("doorbell_events_failed").increment(1);
    let retry_after = retry_policy.retry_interval(u32::try_from(attempt).unwrap_or(0));
    error!(
        event_id = event.id.as_str(),
        attempt,
        "failed to process event, releasing claim for retry in {:?}: {}",
        retry_after,
        failure
    );

    if let Err(error) = source.release(&event.id, retry_after).await {
        // The stale claim sweeper will pick the event up.
        error!(
            event_id = event.id.as_str(),
            "failed to release claim: {}", error
        );
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        log_join_error(joined);
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(error) = joined {
        warn!("event task did not complete: {}", error);
    }
}
