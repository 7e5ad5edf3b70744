//! One poll of the inbox: list, classify, persist, queue, checkpoint.

use crate::checkpoint::CheckpointStore;
use crate::config::{Config, ConfigSource, RuleAction};
use crate::correlator::{find_suppressible, AlertCandidate};
use crate::dedup::{DedupStore, Outcome, NOT_WHITELISTED};
use crate::domain_utils::DomainUtils;
use crate::inbox::{Inbox, MessageMeta};
use crate::matcher::match_rule;
use crate::queue::{truncate_body, ActionQueue, QueueItem};
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::triage_log::{TriageLog, TriageLogEntry};
use crate::webhook::WebhookNotifier;
use crate::whitelist::is_whitelisted;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

const LOG_SUBJECT_CHARS: usize = 60;

pub fn open_queue(config: &Config, base_dir: &Path) -> Result<ActionQueue> {
    ActionQueue::open(
        crate::config::resolve_path(base_dir, &config.queue.dir),
        Duration::minutes(config.queue.stale_pending_minutes as i64),
        Duration::hours(config.queue.done_retention_hours as i64),
    )
}

pub fn open_triage_log(config: &Config, base_dir: &Path) -> TriageLog {
    TriageLog::new(
        crate::config::resolve_path(base_dir, &config.triage.log_file),
        config.triage.log_max_bytes,
    )
}

/// Everything a cycle mutates. Holding the lock is the re-entrancy guard.
struct CycleStores {
    config: ConfigSource,
    dedup: DedupStore,
    checkpoint: CheckpointStore,
    queue: ActionQueue,
    log: TriageLog,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub config_version: u64,
    pub fetched: usize,
    pub deduplicated: usize,
    pub not_whitelisted: usize,
    pub decided: usize,
    pub queued: usize,
    pub errors: usize,
    /// New messages left for a later cycle by `inbox.max_messages`.
    pub deferred: usize,
    pub suppressed: usize,
    pub checkpoint_advanced: bool,
}

impl CycleReport {
    /// Messages this cycle tried to triage, successfully or not.
    pub fn attempted(&self) -> usize {
        self.not_whitelisted + self.decided + self.errors
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle held the guard; this tick was dropped.
    Skipped,
    Failed(String),
    Completed(CycleReport),
}

enum Disposition {
    NotWhitelisted,
    Decided { queued: bool },
}

/// A message that could not be triaged, with its receive time when known.
struct MessageFailure {
    error: anyhow::Error,
    received_at: Option<DateTime<Utc>>,
}

pub struct TriageCycle {
    inbox: Arc<dyn Inbox>,
    stats: StatisticsCollector,
    webhook: Option<WebhookNotifier>,
    stores: Mutex<CycleStores>,
}

impl TriageCycle {
    /// Open the on-disk stores named by the current configuration. Store
    /// locations are fixed for the lifetime of the cycle.
    pub fn new(
        config: ConfigSource,
        inbox: Arc<dyn Inbox>,
        stats: StatisticsCollector,
        webhook: Option<WebhookNotifier>,
    ) -> Result<Self> {
        let snapshot = config.current();
        let current = snapshot.config.as_ref();
        let dedup = DedupStore::open(
            config.resolve(&current.triage.processed_file),
            Duration::hours(current.dedup.ttl_hours as i64),
            Duration::minutes(current.dedup.cleanup_interval_minutes as i64),
        )?;
        let checkpoint = CheckpointStore::open(config.resolve(&current.triage.checkpoint_file))?;
        let queue = open_queue(current, config.base_dir())?;
        let log = open_triage_log(current, config.base_dir());

        Ok(Self {
            inbox,
            stats,
            webhook,
            stores: Mutex::new(CycleStores {
                config,
                dedup,
                checkpoint,
                queue,
                log,
            }),
        })
    }

    pub fn stats(&self) -> &StatisticsCollector {
        &self.stats
    }

    pub fn webhook(&self) -> Option<&WebhookNotifier> {
        self.webhook.as_ref()
    }

    pub async fn run_once(&self) -> CycleOutcome {
        let Ok(mut stores) = self.stores.try_lock() else {
            log::debug!("Triage cycle still running, dropping tick");
            return CycleOutcome::Skipped;
        };

        let started = Instant::now();
        match self.run_locked(&mut stores).await {
            Ok(report) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                log::debug!("Triage cycle finished in {duration_ms}ms: {report:?}");
                self.stats.record_event(StatEvent::CycleCompleted {
                    fetched: report.fetched,
                    duration_ms,
                });
                CycleOutcome::Completed(report)
            }
            Err(e) => {
                let message = format!("{e:#}");
                log::error!("Triage cycle failed: {message}");
                self.stats.record_event(StatEvent::CycleFailed(message.clone()));
                CycleOutcome::Failed(message)
            }
        }
    }

    async fn run_locked(&self, stores: &mut CycleStores) -> Result<CycleReport> {
        let snapshot = stores.config.snapshot();
        let config = snapshot.config.as_ref();

        match stores.queue.cleanup() {
            Ok(cleanup) if cleanup.auto_resolved + cleanup.markers_removed > 0 => log::info!(
                "Queue cleanup: {} auto-resolved, {} done-markers removed",
                cleanup.auto_resolved,
                cleanup.markers_removed
            ),
            Ok(_) => {}
            Err(e) => log::warn!("Queue cleanup failed: {e:#}"),
        }

        let started = Utc::now();
        let since = stores.checkpoint.get().unwrap_or_else(|| {
            (started - Duration::hours(config.inbox.initial_lookback_hours as i64)).timestamp()
        });
        let listing = self
            .inbox
            .list_new_messages(Some(since), &config.inbox.search_query)
            .await
            .context("Failed to list new messages")?;
        self.stats.record_event(StatEvent::Polled);

        let mut report = CycleReport {
            config_version: snapshot.version,
            fetched: listing.ids.len(),
            ..Default::default()
        };
        let mut earliest_failure: Option<i64> = None;
        let mut undated_failure = false;

        // Provider order is newest first.
        for id in listing.ids.iter().rev() {
            if stores.dedup.contains(id) {
                report.deduplicated += 1;
                self.stats.record_event(StatEvent::Deduplicated);
                continue;
            }
            if report.attempted() >= config.inbox.max_messages {
                report.deferred += 1;
                continue;
            }
            match self.process_message(stores, config, id).await {
                Ok(Disposition::NotWhitelisted) => report.not_whitelisted += 1,
                Ok(Disposition::Decided { queued }) => {
                    report.decided += 1;
                    if queued {
                        report.queued += 1;
                    }
                }
                Err(failure) => {
                    report.errors += 1;
                    log::error!("Error processing message {id}: {:#}", failure.error);
                    self.stats.record_event(StatEvent::MessageError(format!(
                        "{id}: {:#}",
                        failure.error
                    )));
                    match failure.received_at {
                        Some(at) => {
                            let at = at.timestamp();
                            earliest_failure = Some(earliest_failure.map_or(at, |e| e.min(at)));
                        }
                        None => undated_failure = true,
                    }
                }
            }
        }

        if config.alerts.suppress_resolved && !config.triage.shadow_mode {
            match suppress_resolved_alerts(&stores.queue, &config.alerts.classification) {
                Ok(suppressed) => {
                    report.suppressed = suppressed;
                    if suppressed > 0 {
                        self.stats
                            .record_event(StatEvent::Suppressed(suppressed as u64));
                    }
                }
                Err(e) => log::warn!("Alert suppression failed: {e:#}"),
            }
        }

        if report.deferred > 0 {
            log::warn!(
                "{} new messages over the limit of {} per cycle, holding checkpoint at {since}",
                report.deferred,
                config.inbox.max_messages
            );
        } else if undated_failure {
            log::warn!(
                "A message failed before its receive time was known, holding checkpoint at {since}"
            );
        } else {
            // Failed messages must stay inside the next listing window.
            let target = earliest_failure
                .map_or(started.timestamp(), |at| (at - 1).min(started.timestamp()));
            report.checkpoint_advanced = stores
                .checkpoint
                .advance(target)
                .context("Failed to advance checkpoint")?;
        }

        Ok(report)
    }

    async fn process_message(
        &self,
        stores: &mut CycleStores,
        config: &Config,
        id: &str,
    ) -> std::result::Result<Disposition, MessageFailure> {
        let meta = self
            .inbox
            .fetch_metadata(id)
            .await
            .context("Failed to fetch metadata")
            .map_err(|error| MessageFailure {
                error,
                received_at: None,
            })?;
        let received_at = meta.received_at;
        self.triage_message(stores, config, id, meta)
            .await
            .map_err(|error| MessageFailure { error, received_at })
    }

    async fn triage_message(
        &self,
        stores: &mut CycleStores,
        config: &Config,
        id: &str,
        meta: MessageMeta,
    ) -> Result<Disposition> {
        let from = DomainUtils::extract_email(&meta.from).to_string();
        let to = DomainUtils::extract_email(&meta.to).to_string();

        // The one match for this message; it also decides whether the body is fetched.
        let rule = match_rule(&meta.from, &meta.subject, &meta.to, &config.triage.rules);
        let action = rule.map_or(RuleAction::Classify, |r| r.action);
        let shadow = config.triage.shadow_mode;

        if !is_whitelisted(
            &meta.from,
            &config.inbox.whitelisted_domains,
            &config.inbox.whitelisted_addresses,
        ) {
            stores.dedup.record(
                id,
                Outcome {
                    from: from.clone(),
                    subject: meta.subject.clone(),
                    action: NOT_WHITELISTED.to_string(),
                    classification: None,
                },
            )?;
            log::debug!("Sender {from} not whitelisted, skipping {id}");
            self.stats.record_event(StatEvent::NotWhitelisted);
            return Ok(Disposition::NotWhitelisted);
        }

        let actionable = action.requires_body() && !shadow;
        let body = if actionable {
            let body = self
                .inbox
                .fetch_body(id)
                .await
                .context("Failed to fetch body")?;
            truncate_body(&body, config.triage.body_max_chars)
        } else {
            String::new()
        };

        let classification = rule.map_or_else(
            || config.triage.default_classification.clone(),
            |r| r.name.clone(),
        );
        let model = rule
            .and_then(|r| r.model.clone())
            .unwrap_or_else(|| config.models.classifier.clone());
        let assigned_to = rule.and_then(|r| r.assign_to.clone());
        let now = Utc::now();

        stores.log.append(&TriageLogEntry {
            timestamp: now,
            email_id: id.to_string(),
            from: from.clone(),
            to: to.clone(),
            subject: meta.subject.clone(),
            received_at: meta.date.clone(),
            classification: classification.clone(),
            action,
            assigned_to: assigned_to.clone(),
            model: model.clone(),
            escalated: action == RuleAction::Escalate,
            shadow,
            processed_at: now,
        })?;

        let mut queued = false;
        if actionable {
            let item = QueueItem {
                email_id: id.to_string(),
                from: from.clone(),
                to,
                subject: meta.subject.clone(),
                date: meta.date.clone(),
                received_at: meta.received_at,
                classification: classification.clone(),
                action,
                assigned_to,
                model,
                body,
                queued_at: now,
            };
            queued = stores.queue.enqueue(&item)?;
            if queued {
                if let Some(webhook) = &self.webhook {
                    webhook.notify(&item);
                }
            }
        }

        stores.dedup.record(
            id,
            Outcome {
                from: from.clone(),
                subject: meta.subject.clone(),
                action: action.to_string(),
                classification: Some(classification.clone()),
            },
        )?;

        self.stats.record_event(StatEvent::Decision {
            rule_name: rule.map(|r| r.name.clone()),
            action: action.to_string(),
        });
        let subject: String = meta.subject.chars().take(LOG_SUBJECT_CHARS).collect();
        log::info!(
            "{}{} | {from} | {subject} | rule={classification}",
            if shadow { "[shadow] " } else { "" },
            action.as_str().to_uppercase()
        );

        Ok(Disposition::Decided { queued })
    }
}

/// Mark every pending DOWN alert that a later UP alert resolved as done.
fn suppress_resolved_alerts(queue: &ActionQueue, alert_classification: &str) -> Result<usize> {
    let pending = queue.pending_items()?;
    let candidates: Vec<AlertCandidate> = pending.iter().map(AlertCandidate::from).collect();
    let suppressible = find_suppressible(&candidates, alert_classification);
    for id in &suppressible {
        log::info!("Suppressing resolved alert {id}");
        queue.mark_done(id);
    }
    Ok(suppressible.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Rule, RuleMatch, WebhookConfig};
    use crate::inbox::{InboxError, MessageListing};
    use async_trait::async_trait;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Scripted inbox. Messages are kept newest first, like the real provider,
    /// and a listing only returns those received after `since`.
    #[derive(Default)]
    struct FakeInbox {
        messages: std::sync::Mutex<Vec<(String, MessageMeta, String)>>,
        failing_metadata: std::sync::Mutex<HashSet<String>>,
        failing_bodies: std::sync::Mutex<HashSet<String>>,
        fail_listing: AtomicBool,
        body_fetches: AtomicUsize,
        listed_since: std::sync::Mutex<Vec<Option<i64>>>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeInbox {
        /// Add a message that arrived after every message already present.
        fn push(&self, id: &str, from: &str, subject: &str, received_at: DateTime<Utc>) {
            let meta = MessageMeta {
                from: from.to_string(),
                to: "Me <me@us.com>".to_string(),
                subject: subject.to_string(),
                date: received_at.to_rfc2822(),
                received_at: Some(received_at),
            };
            self.messages
                .lock()
                .unwrap()
                .insert(0, (id.to_string(), meta, format!("body of {id}")));
        }

        fn fail_metadata(&self, id: &str, fail: bool) {
            toggle(&self.failing_metadata, id, fail);
        }

        fn fail_body(&self, id: &str, fail: bool) {
            toggle(&self.failing_bodies, id, fail);
        }
    }

    fn toggle(set: &std::sync::Mutex<HashSet<String>>, id: &str, on: bool) {
        let mut set = set.lock().unwrap();
        if on {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    #[async_trait]
    impl Inbox for FakeInbox {
        async fn list_new_messages(
            &self,
            since: Option<i64>,
            _query: &str,
        ) -> Result<MessageListing, InboxError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.listed_since.lock().unwrap().push(since);
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(InboxError::Auth("token refresh failed".to_string()));
            }
            Ok(MessageListing {
                ids: self
                    .messages
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(_, meta, _)| match (since, meta.received_at) {
                        (Some(since), Some(at)) => at.timestamp() > since,
                        _ => true,
                    })
                    .map(|(id, _, _)| id.clone())
                    .collect(),
            })
        }

        async fn fetch_metadata(&self, id: &str) -> Result<MessageMeta, InboxError> {
            if self.failing_metadata.lock().unwrap().contains(id) {
                return Err(InboxError::Status {
                    status: 500,
                    body: "backend error".to_string(),
                });
            }
            self.messages
                .lock()
                .unwrap()
                .iter()
                .find(|(mid, _, _)| mid == id)
                .map(|(_, meta, _)| meta.clone())
                .ok_or_else(|| InboxError::Status {
                    status: 404,
                    body: "not found".to_string(),
                })
        }

        async fn fetch_body(&self, id: &str) -> Result<String, InboxError> {
            self.body_fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing_bodies.lock().unwrap().contains(id) {
                return Err(InboxError::Status {
                    status: 503,
                    body: "try again".to_string(),
                });
            }
            self.messages
                .lock()
                .unwrap()
                .iter()
                .find(|(mid, _, _)| mid == id)
                .map(|(_, _, body)| body.clone())
                .ok_or_else(|| InboxError::Decode("no body".to_string()))
        }
    }

    fn rule(name: &str, from: &str, action: RuleAction) -> Rule {
        Rule {
            name: name.to_string(),
            criteria: RuleMatch {
                from: Some(from.to_string()),
                ..Default::default()
            },
            action,
            assign_to: None,
            model: None,
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.triage.rules = vec![
            Rule {
                assign_to: Some("alice".to_string()),
                ..rule("vip", "boss@co.com", RuleAction::Escalate)
            },
            rule("ops-alerts", "*@pingdom.com", RuleAction::Route),
            rule("noise", "*@spam.com", RuleAction::Skip),
            rule("catchall", "*", RuleAction::Classify),
        ];
        config
    }

    struct Harness {
        _dir: tempfile::TempDir,
        base: PathBuf,
        inbox: Arc<FakeInbox>,
        stats: StatisticsCollector,
        cycle: TriageCycle,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            Self::with_inbox(config, FakeInbox::default())
        }

        fn with_inbox(config: Config, inbox: FakeInbox) -> Self {
            Self::build(config, inbox, &WebhookConfig::default())
        }

        fn with_webhook(config: Config, url: String) -> Self {
            let webhook = WebhookConfig {
                url: Some(url),
                ..Default::default()
            };
            Self::build(config, FakeInbox::default(), &webhook)
        }

        fn build(config: Config, inbox: FakeInbox, webhook: &WebhookConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let base = dir.path().to_path_buf();
            let inbox = Arc::new(inbox);
            let stats = StatisticsCollector::new();
            let webhook = WebhookNotifier::from_config(webhook, stats.clone()).unwrap();
            let cycle = TriageCycle::new(
                ConfigSource::fixed(config, base.clone()),
                inbox.clone(),
                stats.clone(),
                webhook,
            )
            .unwrap();
            Self {
                _dir: dir,
                base,
                inbox,
                stats,
                cycle,
            }
        }

        async fn run(&self) -> CycleReport {
            match self.cycle.run_once().await {
                CycleOutcome::Completed(report) => report,
                other => panic!("expected a completed cycle, got {other:?}"),
            }
        }

        fn queue(&self) -> ActionQueue {
            open_queue(&Config::default(), &self.base).unwrap()
        }

        fn log_entries(&self) -> Vec<TriageLogEntry> {
            open_triage_log(&Config::default(), &self.base)
                .read_entries()
                .unwrap()
        }

        fn dedup_action(&self, id: &str) -> Option<String> {
            let raw = std::fs::read_to_string(self.base.join("processed-emails.json")).ok()?;
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            value["emails"][id]["action"].as_str().map(str::to_string)
        }

        fn checkpoint(&self) -> Option<i64> {
            std::fs::read_to_string(self.base.join("last-check"))
                .ok()
                .map(|s| s.trim().parse().unwrap())
        }
    }

    #[tokio::test]
    async fn test_vip_sender_is_escalated_and_queued() {
        let h = Harness::new(test_config());
        h.inbox
            .push("m1", "The Boss <Boss@CO.com>", "Call me", Utc::now());

        let report = h.run().await;
        assert_eq!(report.decided, 1);
        assert_eq!(report.queued, 1);

        let pending = h.queue().pending_items().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].classification, "vip");
        assert_eq!(pending[0].action, RuleAction::Escalate);
        assert_eq!(pending[0].assigned_to.as_deref(), Some("alice"));
        assert_eq!(pending[0].from, "Boss@CO.com");
        assert_eq!(pending[0].body, "body of m1");

        let entries = h.log_entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].escalated);
        assert_eq!(entries[0].model, "small");
        assert_eq!(h.dedup_action("m1").as_deref(), Some("escalate"));

        let stats = h.stats.snapshot();
        assert_eq!(stats.total_escalated, 1);
        assert_eq!(stats.by_rule["vip"], 1);
    }

    #[tokio::test]
    async fn test_empty_whitelist_lets_everyone_through() {
        let h = Harness::new(test_config());
        h.inbox.push("m1", "user@example.com", "Hi", Utc::now());

        let report = h.run().await;
        assert_eq!(report.decided, 1);
        assert_eq!(h.dedup_action("m1").as_deref(), Some("classify"));
        assert_eq!(h.log_entries()[0].classification, "catchall");
    }

    #[tokio::test]
    async fn test_non_whitelisted_sender_is_recorded_but_never_logged_or_queued() {
        let mut config = test_config();
        config.inbox.whitelisted_domains = vec!["other.com".to_string()];
        config.triage.rules.insert(
            0,
            rule("everyone", "*@example.com", RuleAction::Escalate),
        );
        let h = Harness::new(config);
        h.inbox.push("m1", "user@example.com", "Hi", Utc::now());

        let report = h.run().await;
        assert_eq!(report.not_whitelisted, 1);
        assert_eq!(h.dedup_action("m1").as_deref(), Some(NOT_WHITELISTED));
        assert!(h.log_entries().is_empty());
        assert!(h.queue().pending_items().unwrap().is_empty());
        assert_eq!(h.inbox.body_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(h.stats.snapshot().total_not_whitelisted, 1);
    }

    #[tokio::test]
    async fn test_resolved_alert_is_suppressed() {
        let h = Harness::new(test_config());
        let t0 = Utc::now() - Duration::minutes(2);
        h.inbox
            .push("down", "alerts@pingdom.com", "DOWN alert: X (h) is DOWN", t0);
        h.inbox.push(
            "up",
            "alerts@pingdom.com",
            "UP alert: X (h) is UP",
            t0 + Duration::minutes(5),
        );

        let report = h.run().await;
        assert_eq!(report.queued, 2);
        assert_eq!(report.suppressed, 1);

        let queue = h.queue();
        assert!(queue.is_done("down"));
        assert!(!queue.is_pending("down"));
        assert!(queue.is_pending("up"));
        assert_eq!(h.stats.snapshot().total_suppressed, 1);

        // Logged oldest first.
        let ids: Vec<_> = h.log_entries().into_iter().map(|e| e.email_id).collect();
        assert_eq!(ids, vec!["down", "up"]);
    }

    #[tokio::test]
    async fn test_second_run_over_same_batch_is_deduplicated() {
        let h = Harness::new(test_config());
        // Stamped after the first cycle starts, so the next listing still returns them.
        let late = Utc::now() + Duration::minutes(1);
        h.inbox.push("m1", "boss@co.com", "One", late);
        h.inbox.push("m2", "friend@else.org", "Two", late);

        h.run().await;
        let second = h.run().await;
        assert_eq!(second.fetched, 2);
        assert_eq!(second.deduplicated, 2);
        assert_eq!(second.decided, 0);

        assert_eq!(h.log_entries().len(), 2);
        assert_eq!(h.queue().pending_items().unwrap().len(), 1);
        assert_eq!(h.stats.snapshot().total_deduplicated, 2);
    }

    #[tokio::test]
    async fn test_shadow_mode_logs_without_acting() {
        let mut config = test_config();
        config.triage.shadow_mode = true;
        let h = Harness::new(config);
        h.inbox.push("m1", "boss@co.com", "Urgent", Utc::now());

        let report = h.run().await;
        assert_eq!(report.decided, 1);
        assert_eq!(report.queued, 0);
        assert!(h.queue().pending_items().unwrap().is_empty());
        assert_eq!(h.inbox.body_fetches.load(Ordering::SeqCst), 0);

        let entries = h.log_entries();
        assert!(entries[0].shadow);
        assert_eq!(entries[0].action, RuleAction::Escalate);
        assert_eq!(h.dedup_action("m1").as_deref(), Some("escalate"));
    }

    #[tokio::test]
    async fn test_skip_rule_is_logged_and_recorded_but_not_queued() {
        let h = Harness::new(test_config());
        h.inbox.push("m1", "promo@spam.com", "Deals", Utc::now());

        h.run().await;
        assert_eq!(h.log_entries()[0].action, RuleAction::Skip);
        assert_eq!(h.dedup_action("m1").as_deref(), Some("skip"));
        assert!(h.queue().pending_items().unwrap().is_empty());
        assert_eq!(h.stats.snapshot().total_skipped, 1);
    }

    #[tokio::test]
    async fn test_failed_message_is_retried_next_cycle() {
        let h = Harness::new(test_config());
        let now = Utc::now();
        h.inbox
            .push("m1", "boss@co.com", "One", now - Duration::minutes(10));
        h.inbox
            .push("m2", "friend@else.org", "Two", now - Duration::minutes(5));
        h.inbox.fail_metadata("m2", true);

        let first = h.run().await;
        assert_eq!(first.errors, 1);
        assert_eq!(first.decided, 1);
        // Without metadata there is no receive time to hold the window at.
        assert!(!first.checkpoint_advanced);
        assert!(h.checkpoint().is_none());
        assert!(h.dedup_action("m2").is_none());
        assert_eq!(h.stats.snapshot().errors, 1);

        h.inbox.fail_metadata("m2", false);
        let second = h.run().await;
        assert_eq!(second.deduplicated, 1);
        assert_eq!(second.decided, 1);
        assert!(second.checkpoint_advanced);
        assert_eq!(h.dedup_action("m2").as_deref(), Some("classify"));
    }

    #[tokio::test]
    async fn test_checkpoint_stays_below_a_message_that_failed_midway() {
        let h = Harness::new(test_config());
        let now = Utc::now();
        let boss_at = now - Duration::minutes(5);
        h.inbox
            .push("m1", "friend@else.org", "Hi", now - Duration::minutes(10));
        h.inbox.push("boss", "boss@co.com", "Call me", boss_at);
        h.inbox.fail_body("boss", true);

        let first = h.run().await;
        assert_eq!(first.errors, 1);
        assert!(first.checkpoint_advanced);
        assert_eq!(h.checkpoint(), Some(boss_at.timestamp() - 1));
        assert!(h.log_entries().iter().all(|e| e.email_id != "boss"));

        h.inbox.fail_body("boss", false);
        let second = h.run().await;
        assert_eq!(
            h.inbox.listed_since.lock().unwrap()[1],
            Some(boss_at.timestamp() - 1)
        );
        assert_eq!(second.fetched, 1);
        assert_eq!(second.queued, 1);
        assert!(h.queue().is_pending("boss"));
        assert!(h.checkpoint().unwrap() >= now.timestamp());
    }

    #[tokio::test]
    async fn test_message_limit_defers_newest_and_holds_checkpoint() {
        let mut config = test_config();
        config.inbox.max_messages = 2;
        let h = Harness::new(config);
        let now = Utc::now();
        h.inbox
            .push("old", "a@else.org", "Old", now - Duration::minutes(30));
        h.inbox
            .push("mid", "b@else.org", "Mid", now - Duration::minutes(20));
        h.inbox
            .push("new", "c@else.org", "New", now - Duration::minutes(10));

        let first = h.run().await;
        assert_eq!(first.fetched, 3);
        assert_eq!(first.decided, 2);
        assert_eq!(first.deferred, 1);
        assert!(!first.checkpoint_advanced);
        assert!(h.checkpoint().is_none());

        // Already-processed messages do not count against the limit.
        let second = h.run().await;
        assert_eq!(second.fetched, 3);
        assert_eq!(second.deduplicated, 2);
        assert_eq!(second.decided, 1);
        assert_eq!(second.deferred, 0);
        assert!(second.checkpoint_advanced);

        let ids: Vec<_> = h.log_entries().into_iter().map(|e| e.email_id).collect();
        assert_eq!(ids, vec!["old", "mid", "new"]);
    }

    #[tokio::test]
    async fn test_checkpoint_bounds_next_listing() {
        let h = Harness::new(test_config());
        let before = Utc::now().timestamp();

        h.run().await;
        let first_since = h.inbox.listed_since.lock().unwrap()[0].unwrap();
        let lookback = Duration::hours(24).num_seconds();
        assert!((before - lookback - first_since).abs() <= 2);

        let checkpoint = h.checkpoint().unwrap();
        assert!(checkpoint >= before);

        h.inbox
            .push("m1", "a@else.org", "Before", Utc::now() - Duration::hours(1));
        let report = h.run().await;
        assert_eq!(h.inbox.listed_since.lock().unwrap()[1], Some(checkpoint));
        assert_eq!(report.fetched, 0);
    }

    #[tokio::test]
    async fn test_webhook_fires_once_per_newly_queued_item() {
        let events = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let app = Router::new().route(
            "/hook",
            post({
                let events = events.clone();
                move |Json(body): Json<serde_json::Value>| {
                    let events = events.clone();
                    async move {
                        let event = body["event"].as_str().unwrap_or_default().to_string();
                        events.lock().unwrap().push(event);
                        axum::http::StatusCode::OK
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let url = format!("http://{addr}/hook");

        let h = Harness::with_webhook(test_config(), url.clone());
        let at = Utc::now() - Duration::minutes(10);
        h.inbox.push("boss", "boss@co.com", "Call me", at);
        h.inbox
            .push("ping", "alerts@pingdom.com", "Weekly report", at);
        h.inbox.push("chat", "friend@else.org", "Lunch?", at);
        h.inbox.push("promo", "deals@spam.com", "Sale", at);
        h.inbox.push("again", "boss@co.com", "Handled already", at);
        h.queue().mark_done("again");

        let report = h.run().await;
        assert_eq!(report.decided, 5);
        assert_eq!(report.queued, 2);
        let webhook = h.cycle.webhook().unwrap();
        assert_eq!(webhook.drain(std::time::Duration::from_secs(5)).await, 0);

        let mut seen = events.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["triage.escalate", "triage.route"]);
        assert_eq!(h.stats.snapshot().webhooks_sent, 2);

        // Nothing new to queue on a repeat run.
        h.run().await;
        webhook.drain(std::time::Duration::from_secs(5)).await;
        assert_eq!(events.lock().unwrap().len(), 2);

        let mut config = test_config();
        config.triage.shadow_mode = true;
        let shadow = Harness::with_webhook(config, url);
        shadow.inbox.push("boss", "boss@co.com", "Call me", at);
        shadow.run().await;
        shadow
            .cycle
            .webhook()
            .unwrap()
            .drain(std::time::Duration::from_secs(5))
            .await;
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_listing_failure_degrades_without_checkpoint() {
        let h = Harness::new(test_config());
        h.inbox.fail_listing.store(true, Ordering::SeqCst);

        let outcome = h.cycle.run_once().await;
        assert!(matches!(outcome, CycleOutcome::Failed(ref m) if m.contains("token refresh failed")));
        assert!(h.checkpoint().is_none());
        let stats = h.stats.snapshot();
        assert!(stats.degraded);
        assert!(stats.last_check.is_none());

        h.inbox.fail_listing.store(false, Ordering::SeqCst);
        h.run().await;
        assert!(!h.stats.snapshot().degraded);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let gate = Arc::new(Notify::new());
        let inbox = FakeInbox {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let h = Harness::with_inbox(test_config(), inbox);

        let first = h.cycle.run_once();
        let second = async {
            tokio::task::yield_now().await;
            let outcome = h.cycle.run_once().await;
            gate.notify_one();
            outcome
        };
        let (first, second) = tokio::join!(first, second);

        assert!(matches!(first, CycleOutcome::Completed(_)));
        assert_eq!(second, CycleOutcome::Skipped);
        assert_eq!(h.inbox.listed_since.lock().unwrap().len(), 1);
    }
}
