//! Gmail REST transport with the OAuth2 refresh-token flow.

use super::{Inbox, InboxError, MessageListing, MessageMeta};
use crate::config::{resolve_path, InboxConfig};
use crate::correlator::parse_message_date;
use crate::store;
use async_trait::async_trait;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_HEADERS: [&str; 4] = ["From", "To", "Subject", "Date"];
/// Refresh this long before the recorded expiry.
const EXPIRY_MARGIN_MS: i64 = 60_000;
const MAX_PAGE_SIZE: usize = 500;

const BASE64_URL_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PartBody {
    #[serde(default)]
    pub data: Option<String>,
}

/// Case-insensitive header lookup; `""` when absent.
pub fn extract_header(message: &GmailMessage, name: &str) -> String {
    message
        .payload
        .as_ref()
        .and_then(|payload| {
            payload
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
        })
        .map(|h| h.value.clone())
        .unwrap_or_default()
}

fn part_data(part: &MessagePart) -> Option<&str> {
    part.body
        .as_ref()
        .and_then(|body| body.data.as_deref())
        .filter(|data| !data.is_empty())
}

fn decode_data(data: &str) -> String {
    let normalized: String = data
        .trim()
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    match BASE64_URL_LENIENT.decode(normalized.as_bytes()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            log::debug!("Undecodable body data: {e}");
            String::new()
        }
    }
}

/// Best-effort plain-text body: the top-level body, then a `text/plain`
/// part, then a `text/html` part, then a nested `text/plain` part.
pub fn extract_body(message: &GmailMessage) -> String {
    let Some(payload) = &message.payload else {
        return String::new();
    };
    if let Some(data) = part_data(payload) {
        return decode_data(data);
    }
    for mime in ["text/plain", "text/html"] {
        if let Some(data) = payload
            .parts
            .iter()
            .filter(|p| p.mime_type == mime)
            .find_map(part_data)
        {
            return decode_data(data);
        }
    }
    payload
        .parts
        .iter()
        .flat_map(|p| p.parts.iter())
        .filter(|p| p.mime_type == "text/plain")
        .find_map(part_data)
        .map(decode_data)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Deserialize)]
struct ClientCredentials {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    token_uri: Option<String>,
}

/// Accepts the `installed` and `web` wrappers as well as a flat object.
fn parse_credentials(raw: &str) -> Result<ClientCredentials, InboxError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| InboxError::Auth(format!("credentials: {e}")))?;
    let inner = value
        .get("installed")
        .or_else(|| value.get("web"))
        .cloned()
        .unwrap_or(value);
    serde_json::from_value(inner).map_err(|e| InboxError::Auth(format!("credentials: {e}")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenData {
    #[serde(default)]
    access_token: Option<String>,
    refresh_token: String,
    /// Milliseconds since the epoch.
    #[serde(default)]
    expiry_date: Option<i64>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenData {
    fn valid_access_token(&self, now_ms: i64) -> Option<&str> {
        match (&self.access_token, self.expiry_date) {
            (Some(token), Some(expiry)) if now_ms < expiry - EXPIRY_MARGIN_MS => Some(token),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub struct GmailInbox {
    client: Client,
    api_base: Url,
    credentials_path: PathBuf,
    token_path: PathBuf,
    token: Mutex<Option<TokenData>>,
}

impl GmailInbox {
    pub fn new(config: &InboxConfig, base_dir: &Path) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .user_agent(concat!("inbox-triage/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let mut api_base = Url::parse(&config.api_base)?;
        if api_base.cannot_be_a_base() {
            anyhow::bail!("inbox.api_base '{}' is not a base URL", config.api_base);
        }
        if !api_base.path().ends_with('/') {
            let path = format!("{}/", api_base.path());
            api_base.set_path(&path);
        }
        Ok(Self {
            client,
            api_base,
            credentials_path: resolve_path(base_dir, &config.credentials_path),
            token_path: resolve_path(base_dir, &config.token_path),
            token: Mutex::new(None),
        })
    }

    fn messages_url(&self, id: Option<&str>) -> Result<Url, InboxError> {
        let mut url = self
            .api_base
            .join("gmail/v1/users/me/messages")
            .map_err(|e| InboxError::Decode(format!("bad api_base: {e}")))?;
        if let Some(id) = id {
            url.path_segments_mut()
                .map_err(|_| InboxError::Decode("bad api_base".to_string()))?
                .push(id);
        }
        Ok(url)
    }

    async fn access_token(&self) -> Result<String, InboxError> {
        let mut guard = self.token.lock().await;
        if guard.is_none() {
            let raw = std::fs::read_to_string(&self.token_path).map_err(|e| {
                InboxError::Auth(format!("cannot read {}: {e}", self.token_path.display()))
            })?;
            let token: TokenData = serde_json::from_str(&raw)
                .map_err(|e| InboxError::Auth(format!("token file: {e}")))?;
            *guard = Some(token);
        }

        let now_ms = Utc::now().timestamp_millis();
        if let Some(token) = guard.as_ref().and_then(|t| t.valid_access_token(now_ms)) {
            return Ok(token.to_string());
        }

        let Some(token) = guard.as_mut() else {
            return Err(InboxError::Auth("no token loaded".to_string()));
        };
        self.refresh(token).await?;
        token
            .access_token
            .clone()
            .ok_or_else(|| InboxError::Auth("refresh returned no access token".to_string()))
    }

    async fn refresh(&self, token: &mut TokenData) -> Result<(), InboxError> {
        log::debug!("Refreshing inbox access token");
        let raw = std::fs::read_to_string(&self.credentials_path).map_err(|e| {
            InboxError::Auth(format!("cannot read {}: {e}", self.credentials_path.display()))
        })?;
        let credentials = parse_credentials(&raw)?;
        let token_uri = credentials
            .token_uri
            .as_deref()
            .unwrap_or(DEFAULT_TOKEN_URI);

        let response = self
            .client
            .post(token_uri)
            .form(&[
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("refresh_token", token.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(InboxError::Auth(format!(
                "token refresh failed: {} {body}",
                status.as_u16()
            )));
        }
        let refreshed: RefreshResponse = serde_json::from_str(&body)
            .map_err(|e| InboxError::Auth(format!("token refresh response: {e}")))?;

        token.access_token = Some(refreshed.access_token);
        if let Some(refresh_token) = refreshed.refresh_token {
            token.refresh_token = refresh_token;
        }
        token.expiry_date = Some(Utc::now().timestamp_millis() + refreshed.expires_in * 1000);

        if let Err(e) = store::write_json_atomic(&self.token_path, token) {
            log::warn!("Failed to save refreshed token: {e:#}");
        }
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<T, InboxError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(InboxError::Status {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| InboxError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Inbox for GmailInbox {
    async fn list_new_messages(
        &self,
        since: Option<i64>,
        query: &str,
    ) -> Result<MessageListing, InboxError> {
        let q = match since {
            Some(since) => format!("{query} after:{since}").trim().to_string(),
            None => query.to_string(),
        };

        let page_size = MAX_PAGE_SIZE.to_string();
        let mut listing = MessageListing::default();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![("q", q.as_str()), ("maxResults", page_size.as_str())];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.as_str()));
            }

            let page: ListResponse = self.get_json(self.messages_url(None)?, &params).await?;
            listing.ids.extend(page.messages.into_iter().map(|m| m.id));
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        log::debug!("Listed {} messages for query '{q}'", listing.ids.len());
        Ok(listing)
    }

    async fn fetch_metadata(&self, id: &str) -> Result<MessageMeta, InboxError> {
        let mut params = vec![("format", "metadata")];
        params.extend(METADATA_HEADERS.iter().map(|h| ("metadataHeaders", *h)));
        let message: GmailMessage = self.get_json(self.messages_url(Some(id))?, &params).await?;

        // The provider's receive time is what `after:` filters on; the sender's
        // Date header is only a fallback.
        let date = extract_header(&message, "Date");
        let received_at = message
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .or_else(|| parse_message_date(&date));
        Ok(MessageMeta {
            from: extract_header(&message, "From"),
            to: extract_header(&message, "To"),
            subject: extract_header(&message, "Subject"),
            date,
            received_at,
        })
    }

    async fn fetch_body(&self, id: &str) -> Result<String, InboxError> {
        let message: GmailMessage = self
            .get_json(self.messages_url(Some(id))?, &[("format", "full")])
            .await?;
        Ok(extract_body(&message))
    }
}
