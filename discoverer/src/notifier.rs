use async_trait::async_trait;
use log::{debug, warn};
use tokio::time::sleep;

use kale_common::api::notify::{NotifyResponse, PlantedFarmersPayload};
use kale_common::config::{NOTIFY_BACKOFF_BASE, NOTIFY_BACKOFF_CAP, NOTIFY_MAX_ATTEMPTS};
use kale_common::error::backoff_delay;

use crate::DiscovererError;

// Seam between the planter and the executor so tests can capture the
// payload instead of standing up an HTTP server.
#[async_trait]
pub trait ExecutorNotifier: Send + Sync {
    async fn notify(&self, payload: &PlantedFarmersPayload) -> Result<NotifyResponse, DiscovererError>;
}

pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpNotifier {
    pub fn new(executor_url: &str, token: String) -> Result<Self, DiscovererError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| DiscovererError::Notify(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/backend/planted-farmers",
                executor_url.trim_end_matches('/')
            ),
            token,
        })
    }

    async fn post_once(
        &self,
        payload: &PlantedFarmersPayload,
    ) -> Result<NotifyResponse, NotifyAttemptError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await
            .map_err(|e| NotifyAttemptError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(NotifyAttemptError::Transient(format!("http status {status}")));
        }
        if !status.is_success() {
            // 4xx means the payload or the token is wrong; retrying the
            // same bytes cannot help
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyAttemptError::Permanent(format!("http status {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| NotifyAttemptError::Transient(format!("malformed response: {e}")))
    }
}

enum NotifyAttemptError {
    Transient(String),
    Permanent(String),
}

#[async_trait]
impl ExecutorNotifier for HttpNotifier {
    async fn notify(
        &self,
        payload: &PlantedFarmersPayload,
    ) -> Result<NotifyResponse, DiscovererError> {
        let mut last_error = String::new();

        for attempt in 0..NOTIFY_MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1, NOTIFY_BACKOFF_BASE, NOTIFY_BACKOFF_CAP);
                warn!(
                    "executor notification for block {} failed ({last_error}), retrying in {delay:?}",
                    payload.block_index
                );
                sleep(delay).await;
            }

            match self.post_once(payload).await {
                Ok(response) => {
                    debug!(
                        "executor scheduled {} farmers for block {}",
                        response.farmers_scheduled, payload.block_index
                    );
                    return Ok(response);
                }
                Err(NotifyAttemptError::Permanent(reason)) => {
                    return Err(DiscovererError::Notify(reason));
                }
                Err(NotifyAttemptError::Transient(reason)) => last_error = reason,
            }
        }

        Err(DiscovererError::Notify(format!(
            "gave up after {NOTIFY_MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }
}
