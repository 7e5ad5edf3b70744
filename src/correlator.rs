//! Cancels monitoring alerts that a later recovery alert has made moot.
//!
//! Alerts follow the uptime-monitor convention
//! `"DOWN alert: <service> is DOWN"` / `"UP alert: <service> is UP"`.
//! The captured service text is an opaque, case-sensitive key.

use crate::queue::QueueItem;
use crate::triage_log::TriageLogEntry;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Down,
    Up,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertCandidate {
    pub id: String,
    pub classification: String,
    pub subject: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&QueueItem> for AlertCandidate {
    fn from(item: &QueueItem) -> Self {
        Self {
            id: item.email_id.clone(),
            classification: item.classification.clone(),
            subject: item.subject.clone(),
            timestamp: item
                .received_at
                .or_else(|| parse_message_date(&item.date)),
        }
    }
}

impl From<&TriageLogEntry> for AlertCandidate {
    fn from(entry: &TriageLogEntry) -> Self {
        Self {
            id: entry.email_id.clone(),
            classification: entry.classification.clone(),
            subject: entry.subject.clone(),
            timestamp: parse_message_date(&entry.received_at),
        }
    }
}

/// Parse an RFC 2822 `Date` header (or RFC 3339 text) into UTC.
pub fn parse_message_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    // Strip a trailing zone comment such as "(UTC)".
    let without_comment = match raw.rfind(" (") {
        Some(cut) if raw.ends_with(')') => raw[..cut].trim_end(),
        _ => raw,
    };
    DateTime::parse_from_rfc2822(without_comment)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn alert_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(DOWN|UP) alert:\s*(.+?)\s+is\s+(?:DOWN|UP)").expect("alert pattern is valid")
    })
}

/// Extract the alert state and the monitored service from a subject line.
///
/// `"DOWN alert: ORACLE PROD (NOT OPENAI) (asgi.example.app) is DOWN"`
/// yields `(Down, "ORACLE PROD (NOT OPENAI) (asgi.example.app)")`.
pub fn parse_alert(subject: &str) -> Option<(AlertState, &str)> {
    let captures = alert_pattern().captures(subject)?;
    let state = if captures[1].eq_ignore_ascii_case("down") {
        AlertState::Down
    } else {
        AlertState::Up
    };
    Some((state, captures.get(2)?.as_str()))
}

pub fn extract_alert_service(subject: &str) -> Option<&str> {
    parse_alert(subject).map(|(_, service)| service)
}

/// Identities of DOWN alerts followed by a strictly later UP alert for the
/// same service, considering only items of `alert_classification`.
pub fn find_suppressible(items: &[AlertCandidate], alert_classification: &str) -> BTreeSet<String> {
    let alerts: Vec<(&AlertCandidate, AlertState, &str, DateTime<Utc>)> = items
        .iter()
        .filter(|item| item.classification == alert_classification)
        .filter_map(|item| {
            let (state, service) = parse_alert(&item.subject)?;
            Some((item, state, service, item.timestamp?))
        })
        .collect();

    alerts
        .iter()
        .filter(|(_, state, _, _)| *state == AlertState::Down)
        .filter(|(_, _, service, down_at)| {
            alerts.iter().any(|(_, other_state, other_service, up_at)| {
                *other_state == AlertState::Up && other_service == service && up_at > down_at
            })
        })
        .map(|(item, _, _, _)| item.id.clone())
        .collect()
}
