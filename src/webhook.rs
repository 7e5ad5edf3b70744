use crate::config::WebhookConfig;
use crate::queue::QueueItem;
use crate::statistics::{StatEvent, StatisticsCollector};
use reqwest::Client;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use url::Url;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: String,
    item: &'a QueueItem,
}

/// Fire-and-forget POST of every queued item to a downstream endpoint.
pub struct WebhookNotifier {
    client: Client,
    url: Url,
    token: Option<String>,
    stats: StatisticsCollector,
    in_flight: Mutex<JoinSet<()>>,
}

impl WebhookNotifier {
    /// `Ok(None)` when no URL is configured.
    pub fn from_config(
        config: &WebhookConfig,
        stats: StatisticsCollector,
    ) -> anyhow::Result<Option<Self>> {
        let Some(url) = config.url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Some(Self {
            client,
            url: Url::parse(url)?,
            token: config.token.clone().filter(|t| !t.is_empty()),
            stats,
            in_flight: Mutex::new(JoinSet::new()),
        }))
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Spawn the POST for `item` and return immediately.
    pub fn notify(&self, item: &QueueItem) {
        let payload = WebhookPayload {
            event: format!("triage.{}", item.action),
            item,
        };
        let mut request = self.client.post(self.url.clone()).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let stats = self.stats.clone();
        let email_id = item.email_id.clone();

        let mut tasks = self.tasks();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    log::debug!("Webhook delivered for {email_id}");
                    stats.record_event(StatEvent::WebhookSent);
                }
                Ok(response) => {
                    let message = format!("webhook for {email_id} returned {}", response.status());
                    log::warn!("{message}");
                    stats.record_event(StatEvent::WebhookFailed(message));
                }
                Err(e) => {
                    let message = format!("webhook for {email_id} failed: {e}");
                    log::warn!("{message}");
                    stats.record_event(StatEvent::WebhookFailed(message));
                }
            }
        });
    }

    pub fn in_flight(&self) -> usize {
        self.tasks().len()
    }

    /// Wait up to `grace` for outstanding notifications, then abort the
    /// rest. Returns how many were dropped.
    pub async fn drain(&self, grace: Duration) -> usize {
        let mut tasks = std::mem::take(&mut *self.tasks());
        if tasks.is_empty() {
            return 0;
        }
        log::info!("Waiting for {} webhook notification(s)", tasks.len());
        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if finished.is_ok() {
            return 0;
        }
        let dropped = tasks.len();
        tasks.abort_all();
        log::warn!("Dropped {dropped} webhook notification(s) still in flight at shutdown");
        dropped
    }
}
