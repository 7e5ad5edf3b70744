pub mod checkpoint;
pub mod config;
pub mod correlator;
pub mod cycle;
pub mod dedup;
pub mod domain_utils;
pub mod inbox;
pub mod matcher;
pub mod queue;
pub mod server;
pub mod statistics;
pub mod store;
pub mod triage_log;
pub mod webhook;
pub mod whitelist;

pub use config::{Config, ConfigSource, Rule, RuleAction};
pub use cycle::{CycleOutcome, CycleReport, TriageCycle};
pub use inbox::{GmailInbox, Inbox, InboxError};
pub use queue::{ActionQueue, QueueItem};
pub use statistics::{StatEvent, StatisticsCollector};
