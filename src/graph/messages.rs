use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::token::AuthHeaders;
use crate::graph::folders::FolderIdMap;
use crate::graph::GraphClient;

pub const DEFAULT_SELECT: &str = "from,subject,body";
const BODY_TEXT_WIDTH: usize = 100;

/// OData parameters for one messages listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub select: String,
    pub filter: Option<String>,
    /// Page size, also used as the per-folder cap.
    pub top: Option<u32>,
}

impl MessageQuery {
    /// Everything received since 00:00:00 UTC on the day of `now`.
    pub fn received_today(now: DateTime<Utc>) -> Self {
        Self {
            select: DEFAULT_SELECT.to_string(),
            filter: Some(format!(
                "receivedDateTime ge {}",
                now.format("%Y-%m-%dT00:00:00Z")
            )),
            top: None,
        }
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::with_capacity(3);
        if !self.select.trim().is_empty() {
            params.push(("$select", self.select.clone()));
        }
        if let Some(filter) = self.filter.as_ref().filter(|filter| !filter.trim().is_empty()) {
            params.push(("$filter", filter.clone()));
        }
        if let Some(top) = self.top {
            params.push(("$top", top.to_string()));
        }
        params
    }
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self::received_today(Utc::now())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GraphMessage {
    id: Option<String>,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    body: Option<GraphBody>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphBody {
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    content: Option<String>,
}

/// A message as returned to callers, tagged with the folder it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailMessage {
    pub folder: String,
    pub id: Option<String>,
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub from_address: Option<String>,
    pub received_at: Option<String>,
    pub body: Option<String>,
    pub body_type: Option<String>,
}

impl MailMessage {
    fn from_graph(folder: &str, message: GraphMessage) -> Self {
        let (from_name, from_address) = message
            .from
            .and_then(|from| from.email_address)
            .map(|email| (non_empty(email.name), non_empty(email.address)))
            .unwrap_or((None, None));
        let (body, body_type) = message
            .body
            .map(|body| (body.content, body.content_type))
            .unwrap_or((None, None));

        Self {
            folder: folder.to_string(),
            id: message.id,
            subject: message.subject,
            from_name,
            from_address,
            received_at: message.received_date_time,
            body,
            body_type,
        }
    }

    pub fn is_html(&self) -> bool {
        self.body_type
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case("html"))
    }

    /// Body as plain text; HTML bodies are rendered with `html2text`.
    pub fn body_text(&self) -> Option<String> {
        let content = self
            .body
            .as_deref()
            .map(str::trim)
            .filter(|content| !content.is_empty())?;

        if !self.is_html() {
            return Some(content.to_string());
        }

        let plain = std::panic::catch_unwind(|| {
            html2text::from_read(content.as_bytes(), BODY_TEXT_WIDTH)
                .lines()
                .map(str::trim_end)
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .unwrap_or_default();
        (!plain.is_empty()).then_some(plain)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderFailure {
    pub folder: String,
    pub reason: String,
}

/// Messages from every folder that answered, plus one entry per folder
/// that did not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub messages: Vec<MailMessage>,
    pub errors: Vec<FolderFailure>,
}

/// Lists messages in each folder of `folder_ids`. A failing folder
/// contributes nothing to `messages` and one entry to `errors`.
pub async fn fetch_messages(
    graph: &GraphClient,
    folder_ids: &FolderIdMap,
    query: &MessageQuery,
    headers: &AuthHeaders,
) -> FetchReport {
    let params = query.params();
    let limit = query.top.map(|top| top as usize);
    let mut report = FetchReport::default();

    for (folder, id) in folder_ids {
        let url = graph.messages_url(id, &params);
        match graph.get_all::<GraphMessage>(url, headers, limit).await {
            Ok(messages) => {
                info!("fetched {} messages from {folder}", messages.len());
                report.messages.extend(
                    messages
                        .into_iter()
                        .map(|message| MailMessage::from_graph(folder, message)),
                );
            }
            Err(error) => {
                warn!("failed to fetch messages from {folder}: {error}");
                report.errors.push(FolderFailure {
                    folder: folder.clone(),
                    reason: error.to_string(),
                });
            }
        }
    }

    report
}
