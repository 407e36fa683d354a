use std::sync::Arc;

use chrono::Utc;
use doorbell_common::event::DoorbellEvent;
use doorbell_common::notification::{Notification, Notifier};
use doorbell_common::recognition::{RecognitionOracle, RecognitionOutcome};
use doorbell_common::results::{RecognitionResult, ResultSink};
use doorbell_common::visitors::VisitorStore;
use tracing::{info, warn};

use crate::authorization::authorize;
use crate::error::PipelineError;
use crate::image::{acquire_image, ImageFetcher};

/// The processing of one claimed doorbell event.
///
/// Stages run strictly in order: image, recognition, authorization, persistence, notification.
/// Only persistence can fail the run. Every other stage has a safe default that ends up in the
/// result (`"unknown"`, `"unclassified"`, not authorized) so that every event resolves.
pub struct Pipeline {
    oracle: Arc<dyn RecognitionOracle>,
    visitors: Arc<dyn VisitorStore>,
    results: Arc<dyn ResultSink>,
    notifier: Arc<dyn Notifier>,
    images: Arc<dyn ImageFetcher>,
    topic: String,
}

impl Pipeline {
    pub fn new(
        oracle: Arc<dyn RecognitionOracle>,
        visitors: Arc<dyn VisitorStore>,
        results: Arc<dyn ResultSink>,
        notifier: Arc<dyn Notifier>,
        images: Arc<dyn ImageFetcher>,
        topic: &str,
    ) -> Self {
        Self {
            oracle,
            visitors,
            results,
            notifier,
            images,
            topic: topic.to_owned(),
        }
    }

    /// Run all stages for `event`, returning the result that was stored.
    pub async fn process(&self, event: &DoorbellEvent) -> Result<RecognitionResult, PipelineError> {
        let outcome = match acquire_image(event, self.images.as_ref()).await {
            Some(image) => self.oracle.recognize(&image).await,
            None => {
                warn!(event_id = event.id.as_str(), "no usable image, skipping recognition");
                RecognitionOutcome::missing_image()
            }
        };

        let decision = authorize(&outcome, self.visitors.as_ref()).await;

        let result = RecognitionResult {
            device_id: event.device_id.clone(),
            timestamp: Utc::now(),
            original_timestamp: event.occurred_at,
            recognized: decision.recognized,
            name: decision.name,
            authorized: decision.authorized,
            image_reference: event
                .image
                .as_ref()
                .and_then(|image| image.url())
                .map(str::to_owned),
            message_type: event.message_type.clone(),
            message: diagnostic(&outcome),
            candidate_names: outcome.candidate_names,
        };

        self.results.put(&event.id, &result).await?;

        info!(
            event_id = event.id.as_str(),
            authorized = result.authorized,
            "stored recognition result for {}",
            result.name
        );

        self.notify(&event.id, &result).await;

        Ok(result)
    }

    /// Best-effort: failures are logged and counted, never propagated.
    async fn notify(&self, event_id: &str, result: &RecognitionResult) {
        let notification = Notification::for_result(&self.topic, event_id, result);

        match self.notifier.publish(&notification).await {
            Ok(()) => metrics::counter!("doorbell_notifications_sent").increment(1),
            Err(error) => {
                warn!(event_id, "failed to dispatch notification: {}", error);
                metrics::counter!("doorbell_notifications_failed").increment(1);
            }
        }
    }
}

/// The reason an outcome did not match, kept with the result for whoever inspects it later.
fn diagnostic(outcome: &RecognitionOutcome) -> Option<String> {
    if outcome.is_match() || outcome.message.trim().is_empty() {
        None
    } else {
        Some(outcome.message.clone())
    }
}
