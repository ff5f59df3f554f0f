//! Projection update notifications
//!
//! After a run publishes new data, downstream projection builders are told
//! where the new manifest is. Delivery is best effort: failures are logged
//! and never fail the run.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Header carrying the event subject on HTTP deliveries
pub const SUBJECT_HEADER: &str = "X-Event-Subject";

/// Where projections of a dataset live
pub fn projections_path(dataset_id: &str) -> String {
    format!("datasets/{}/projections/", dataset_id)
}

/// Event announcing a newly published version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionEvent {
    pub event: String,
    pub dataset_id: String,
    pub bucket: String,
    pub version_manifest_path: String,
    pub projections_path: String,
}

impl ProjectionEvent {
    pub fn projection_update(dataset_id: &str, bucket: &str, version_manifest_path: &str) -> Self {
        Self {
            event: "projection_update".to_string(),
            dataset_id: dataset_id.to_string(),
            bucket: bucket.to_string(),
            version_manifest_path: version_manifest_path.to_string(),
            projections_path: projections_path(dataset_id),
        }
    }

    pub fn subject(&self) -> String {
        format!("{}:{}", self.event, self.dataset_id)
    }
}

/// Errors that can occur when delivering a notification
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification endpoint unavailable")]
    Unavailable,

    #[error("Notification request timeout")]
    Timeout,

    #[error("Notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Notification rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Notification configuration error: {0}")]
    Config(String),
}

/// Delivers projection events
#[async_trait]
pub trait ProjectionNotifier: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn notify(&self, event: &ProjectionEvent) -> Result<(), NotifyError>;
}

/// Configuration for [`HttpNotifier`]
#[derive(Debug, Clone)]
pub struct HttpNotifierConfig {
    /// Endpoint receiving the JSON event via POST
    pub url: String,
    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Maximum delivery attempts
    pub max_retries: u32,
}

impl Default for HttpNotifierConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/events".to_string(),
            request_timeout_ms: 5000,
            max_retries: 3,
        }
    }
}

/// POSTs events as JSON, subject in [`SUBJECT_HEADER`]
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: Client,
    config: HttpNotifierConfig,
}

impl HttpNotifier {
    pub fn new(config: HttpNotifierConfig) -> Result<Self, NotifyError> {
        if config.url.is_empty() {
            return Err(NotifyError::Config("notification.url is empty".to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpNotifierConfig {
        &self.config
    }
}

#[async_trait]
impl ProjectionNotifier for HttpNotifier {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn notify(&self, event: &ProjectionEvent) -> Result<(), NotifyError> {
        let mut last_error = NotifyError::Unavailable;

        for attempt in 0..self.config.max_retries.max(1) {
            if attempt > 0 {
                // 100ms, 400ms, 900ms...
                let delay = Duration::from_millis(100 * (attempt as u64).pow(2));
                tokio::time::sleep(delay).await;
            }

            let sent = self
                .client
                .post(&self.config.url)
                .header(SUBJECT_HEADER, event.subject())
                .json(event)
                .send()
                .await;

            match sent {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) if response.status().is_server_error() => {
                    last_error = NotifyError::Rejected {
                        status: response.status().as_u16(),
                        message: response.text().await.unwrap_or_default(),
                    };
                }
                Ok(response) => {
                    let status = response.status();
                    let message = response.text().await.unwrap_or_default();
                    return Err(NotifyError::Rejected {
                        status: status.as_u16(),
                        message,
                    });
                }
                Err(e) => {
                    last_error = if e.is_timeout() {
                        NotifyError::Timeout
                    } else if e.is_connect() {
                        NotifyError::Unavailable
                    } else {
                        NotifyError::Request(e)
                    };
                }
            }
        }

        Err(last_error)
    }
}

/// Writes events to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl ProjectionNotifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, event: &ProjectionEvent) -> Result<(), NotifyError> {
        tracing::info!(
            subject = %event.subject(),
            dataset_id = %event.dataset_id,
            bucket = %event.bucket,
            version_manifest_path = %event.version_manifest_path,
            projections_path = %event.projections_path,
            "Projection update"
        );
        Ok(())
    }
}

/// Backend names accepted by [`create_notifier`]
pub const NOTIFY_BACKENDS: &[&str] = &["none", "log", "http"];

/// Build the configured notifier; `none` disables notifications
pub fn create_notifier(
    backend: &str,
    http: HttpNotifierConfig,
) -> Result<Option<Arc<dyn ProjectionNotifier>>, NotifyError> {
    match backend {
        "none" => Ok(None),
        "log" => Ok(Some(Arc::new(LogNotifier))),
        "http" => Ok(Some(Arc::new(HttpNotifier::new(http)?))),
        other => Err(NotifyError::Config(format!(
            "Unknown notification backend: {} (expected one of {})",
            other,
            NOTIFY_BACKENDS.join(", ")
        ))),
    }
}

/// Deliver `event` in the background; failures are logged and dropped
pub fn spawn_notification(
    notifier: Arc<dyn ProjectionNotifier>,
    event: ProjectionEvent,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match notifier.notify(&event).await {
            Ok(()) => tracing::info!(
                dataset_id = %event.dataset_id,
                backend = notifier.name(),
                "Published projection update notification"
            ),
            Err(e) => tracing::error!(
                dataset_id = %event.dataset_id,
                backend = notifier.name(),
                error = %e,
                "Failed to publish projection update notification"
            ),
        }
    })
}
