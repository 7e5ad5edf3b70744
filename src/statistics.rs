use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageStats {
    pub started_at: DateTime<Utc>,
    pub total_processed: u64,
    pub total_classified: u64,
    pub total_routed: u64,
    pub total_escalated: u64,
    pub total_skipped: u64,
    pub total_not_whitelisted: u64,
    pub total_deduplicated: u64,
    pub total_suppressed: u64,
    pub errors: u64,
    pub webhooks_sent: u64,
    pub webhook_failures: u64,
    pub cycles: u64,
    pub empty_polls: u64,
    pub by_rule: BTreeMap<String, u64>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_email_at: Option<DateTime<Utc>>,
    pub last_cycle_ms: Option<u64>,
    pub last_error: Option<String>,
    pub degraded: bool,
}

impl TriageStats {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            total_processed: 0,
            total_classified: 0,
            total_routed: 0,
            total_escalated: 0,
            total_skipped: 0,
            total_not_whitelisted: 0,
            total_deduplicated: 0,
            total_suppressed: 0,
            errors: 0,
            webhooks_sent: 0,
            webhook_failures: 0,
            cycles: 0,
            empty_polls: 0,
            by_rule: BTreeMap::new(),
            last_check: None,
            last_email_at: None,
            last_cycle_ms: None,
            last_error: None,
            degraded: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    /// A decision was logged. `rule_name` is `None` when no rule matched.
    Decision {
        rule_name: Option<String>,
        action: String,
    },
    NotWhitelisted,
    Deduplicated,
    Suppressed(u64),
    MessageError(String),
    WebhookSent,
    WebhookFailed(String),
    CycleFailed(String),
    CycleCompleted {
        fetched: usize,
        duration_ms: u64,
    },
    Polled,
}

/// Process-wide counters. Cloning yields another handle to the same counters.
#[derive(Debug, Clone)]
pub struct StatisticsCollector {
    inner: Arc<Mutex<TriageStats>>,
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TriageStats::new())),
        }
    }

    pub fn record_event(&self, event: StatEvent) {
        match self.inner.lock() {
            Ok(mut stats) => Self::process_event(event, &mut stats),
            Err(poisoned) => Self::process_event(event, &mut poisoned.into_inner()),
        }
    }

    pub fn snapshot(&self) -> TriageStats {
        match self.inner.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn process_event(event: StatEvent, stats: &mut TriageStats) {
        let now = Utc::now();

        match event {
            StatEvent::Decision { rule_name, action } => {
                if let Some(rule_name) = rule_name {
                    *stats.by_rule.entry(rule_name).or_insert(0) += 1;
                }
                match action.as_str() {
                    "skip" => stats.total_skipped += 1,
                    "route" => stats.total_routed += 1,
                    "escalate" => stats.total_escalated += 1,
                    _ => stats.total_classified += 1,
                }
                stats.total_processed += 1;
                stats.last_email_at = Some(now);
            }
            StatEvent::NotWhitelisted => stats.total_not_whitelisted += 1,
            StatEvent::Deduplicated => stats.total_deduplicated += 1,
            StatEvent::Suppressed(count) => stats.total_suppressed += count,
            StatEvent::MessageError(message) => {
                stats.errors += 1;
                stats.last_error = Some(message);
            }
            StatEvent::WebhookSent => stats.webhooks_sent += 1,
            StatEvent::WebhookFailed(message) => {
                stats.webhook_failures += 1;
                stats.last_error = Some(message);
            }
            StatEvent::CycleFailed(message) => {
                stats.errors += 1;
                stats.cycles += 1;
                stats.degraded = true;
                stats.last_error = Some(message);
            }
            StatEvent::CycleCompleted {
                fetched,
                duration_ms,
            } => {
                stats.cycles += 1;
                stats.degraded = false;
                stats.last_cycle_ms = Some(duration_ms);
                if fetched == 0 {
                    stats.empty_polls += 1;
                }
            }
            StatEvent::Polled => stats.last_check = Some(now),
        }
    }
}
