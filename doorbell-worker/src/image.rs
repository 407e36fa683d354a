//! Normalize the image of an event into the base64 form the recognition service accepts.
use std::time;

use async_trait::async_trait;
use base64::Engine;
use doorbell_common::event::{DoorbellEvent, ImageRef};
use reqwest::header;
use tracing::warn;

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Download the image at `url` and return it base64 encoded, or `None` if it can't be had.
    async fn fetch(&self, url: &str) -> Option<String>;
}

/// Produce the image to recognize for `event`. Inline images pass through untouched; referenced
/// images are downloaded. Any failure yields `None`, which the pipeline treats as a non-match.
pub async fn acquire_image(event: &DoorbellEvent, fetcher: &dyn ImageFetcher) -> Option<String> {
    match &event.image {
        Some(ImageRef::Inline(data)) => Some(data.clone()),
        Some(ImageRef::Url(url)) => fetcher.fetch(url).await,
        None => None,
    }
}

#[derive(Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new(request_timeout: time::Duration, max_bytes: usize) -> reqwest::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("image/*"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Doorbell Worker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self { client, max_bytes })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, String> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| error.to_string())?;

        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(format!("image of {length} bytes exceeds limit"));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|error| error.to_string())? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(format!("image exceeds limit of {} bytes", self.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Err("empty image body".to_owned());
        }

        Ok(body)
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Option<String> {
        match self.download(url).await {
            Ok(bytes) => Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            Err(error) => {
                warn!(url, "failed to fetch doorbell image: {}", error);
                metrics::counter!("doorbell_image_fetch_failures").increment(1);
                None
            }
        }
    }
}
