use crate::domain_utils::AddressPattern;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub inbox: InboxConfig,
    pub triage: TriageConfig,
    pub dedup: DedupConfig,
    pub queue: QueueConfig,
    pub alerts: AlertsConfig,
    pub models: ModelsConfig,
    pub webhook: WebhookConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    pub credentials_path: String,
    pub token_path: String,
    pub api_base: String,
    pub search_query: String,
    pub max_messages: usize,
    pub check_interval_seconds: u64,
    pub request_timeout_seconds: u64,
    pub initial_lookback_hours: u64,
    pub whitelisted_domains: Vec<String>,
    pub whitelisted_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub shadow_mode: bool,
    pub default_classification: String,
    pub rules: Vec<Rule>,
    pub log_file: String,
    pub log_max_bytes: u64,
    pub processed_file: String,
    pub checkpoint_file: String,
    pub body_max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_hours: u64,
    pub cleanup_interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub dir: String,
    pub stale_pending_minutes: u64,
    pub done_retention_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub suppress_resolved: bool,
    pub classification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub classifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub timeout_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(rename = "match", default)]
    pub criteria: RuleMatch,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// All present constraints must hold. Absent constraints match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_contains: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Classify,
    Route,
    Escalate,
    Skip,
}

impl RuleAction {
    /// Only actions that hand work downstream need the message body.
    pub fn requires_body(self) -> bool {
        matches!(self, RuleAction::Route | RuleAction::Escalate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleAction::Classify => "classify",
            RuleAction::Route => "route",
            RuleAction::Escalate => "escalate",
            RuleAction::Skip => "skip",
        }
    }
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            credentials_path: "~/.config/inbox-triage/credentials.json".to_string(),
            token_path: "~/.config/inbox-triage/token.json".to_string(),
            api_base: "https://gmail.googleapis.com/".to_string(),
            search_query: "is:unread".to_string(),
            max_messages: 100,
            check_interval_seconds: 60,
            request_timeout_seconds: 30,
            initial_lookback_hours: 24,
            whitelisted_domains: vec![],
            whitelisted_addresses: vec![],
        }
    }
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            shadow_mode: false,
            default_classification: "general".to_string(),
            rules: vec![],
            log_file: "./email-triage.log".to_string(),
            log_max_bytes: 10 * 1024 * 1024,
            processed_file: "./processed-emails.json".to_string(),
            checkpoint_file: "./last-check".to_string(),
            body_max_chars: 2000,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 168,
            cleanup_interval_minutes: 60,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: "./queue".to_string(),
            stale_pending_minutes: 5,
            done_retention_hours: 24,
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            suppress_resolved: true,
            classification: "ops-alerts".to_string(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            classifier: "small".to_string(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_seconds: 10,
            shutdown_grace_seconds: 5,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8403,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse and validate YAML text.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// A sample configuration with one rule of each action, used by `--generate-config`.
    pub fn example() -> Self {
        let mut config = Config::default();
        config.triage.rules = vec![
            Rule {
                name: "vip".to_string(),
                criteria: RuleMatch {
                    from: Some("boss@example.com".to_string()),
                    ..Default::default()
                },
                action: RuleAction::Escalate,
                assign_to: Some("oncall".to_string()),
                model: None,
            },
            Rule {
                name: "ops-alerts".to_string(),
                criteria: RuleMatch {
                    from: Some("*@pingdom.com".to_string()),
                    ..Default::default()
                },
                action: RuleAction::Route,
                assign_to: Some("ops".to_string()),
                model: None,
            },
            Rule {
                name: "newsletters".to_string(),
                criteria: RuleMatch {
                    subject_contains: vec!["newsletter".to_string(), "digest".to_string()],
                    ..Default::default()
                },
                action: RuleAction::Skip,
                assign_to: None,
                model: None,
            },
            Rule {
                name: "catchall".to_string(),
                criteria: RuleMatch {
                    from: Some("*".to_string()),
                    ..Default::default()
                },
                action: RuleAction::Classify,
                assign_to: None,
                model: None,
            },
        ];
        config
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = HashSet::new();
        for rule in &self.triage.rules {
            if rule.name.trim().is_empty() {
                anyhow::bail!("rule with empty name");
            }
            if !names.insert(rule.name.as_str()) {
                anyhow::bail!("duplicate rule name '{}'", rule.name);
            }
            for pattern in [&rule.criteria.from, &rule.criteria.to].into_iter().flatten() {
                AddressPattern::parse(pattern)
                    .with_context(|| format!("rule '{}'", rule.name))?;
            }
        }
        if self.inbox.check_interval_seconds == 0 {
            anyhow::bail!("inbox.check_interval_seconds must be positive");
        }
        if self.inbox.max_messages == 0 {
            anyhow::bail!("inbox.max_messages must be positive");
        }
        Ok(())
    }
}

/// Resolve a configured path: `~` expands to `$HOME`, relative paths are
/// taken from the config file's directory.
pub fn resolve_path(base_dir: &Path, path: &str) -> PathBuf {
    let expanded = match path.strip_prefix('~') {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
            PathBuf::from(home).join(rest.trim_start_matches('/'))
        }
        None => PathBuf::from(path),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

/// Immutable configuration seen by one cycle.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: Arc<Config>,
}

/// Hot-reloadable configuration backed by a file.
///
/// The file is only re-read from [`ConfigSource::snapshot`], which the
/// triage cycle calls once at cycle start.
pub struct ConfigSource {
    path: PathBuf,
    base_dir: PathBuf,
    current: ConfigSnapshot,
    /// Raw text of the last file seen, valid or not.
    last_content: Option<String>,
}

impl ConfigSource {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Config::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(Self {
            base_dir: base_dir_of(&path),
            path,
            current: ConfigSnapshot {
                version: 1,
                config: Arc::new(config),
            },
            last_content: Some(content),
        })
    }

    /// A source that never reloads, for tests and one-shot tools.
    pub fn fixed(config: Config, base_dir: PathBuf) -> Self {
        Self {
            path: PathBuf::new(),
            base_dir,
            current: ConfigSnapshot {
                version: 1,
                config: Arc::new(config),
            },
            last_content: None,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        resolve_path(&self.base_dir, path)
    }

    pub fn current(&self) -> ConfigSnapshot {
        self.current.clone()
    }

    /// Reload when the file content changed since the last look, then hand
    /// out the current snapshot. A broken file keeps the previous snapshot.
    pub fn snapshot(&mut self) -> ConfigSnapshot {
        if self.path.as_os_str().is_empty() {
            return self.current.clone();
        }
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!(
                    "Cannot read {}, keeping config version {}: {e}",
                    self.path.display(),
                    self.current.version
                );
                return self.current.clone();
            }
        };
        if self.last_content.as_deref() == Some(content.as_str()) {
            return self.current.clone();
        }

        match Config::from_yaml(&content) {
            Ok(config) => {
                self.current = ConfigSnapshot {
                    version: self.current.version + 1,
                    config: Arc::new(config),
                };
                log::info!(
                    "Config reloaded from {} (version {})",
                    self.path.display(),
                    self.current.version
                );
            }
            Err(e) => {
                log::warn!("Config reload failed, keeping version {}: {e:#}", self.current.version);
            }
        }
        self.last_content = Some(content);
        self.current.clone()
    }
}

fn base_dir_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
