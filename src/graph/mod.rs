pub mod folders;
pub mod messages;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::token::AuthHeaders;
use crate::config::Settings;
use crate::error::{redact_response_body, Error, Result};

/// Status and raw body of one Graph response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphResponse {
    pub status: u16,
    pub body: String,
}

impl GraphResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait GraphTransport: Send + Sync {
    async fn get(&self, url: &Url, headers: &AuthHeaders) -> Result<GraphResponse>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

#[async_trait]
impl GraphTransport for ReqwestTransport {
    async fn get(&self, url: &Url, headers: &AuthHeaders) -> Result<GraphResponse> {
        let mut request = self
            .client
            .get(url.clone())
            .header("client-request-id", Uuid::new_v4().to_string());
        for (name, value) in headers.pairs() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|source| Error::Transport {
            url: url.to_string(),
            source,
        })?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|source| Error::Transport {
            url: url.to_string(),
            source,
        })?;
        Ok(GraphResponse { status, body })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphPage<T> {
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphMailFolder {
    pub id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

/// Thin client over the signed-in user's mail folders.
pub struct GraphClient {
    base: Url,
    transport: Box<dyn GraphTransport>,
}

impl GraphClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        Self::with_transport(&settings.graph_base, Box::new(ReqwestTransport::new()))
    }

    pub fn with_transport(base: &str, transport: Box<dyn GraphTransport>) -> Result<Self> {
        let base = Url::parse(base.trim_end_matches('/'))
            .map_err(|error| Error::Config(format!("invalid Graph base URL '{base}': {error}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("invalid Graph base URL '{base}'")));
        }
        Ok(Self { base, transport })
    }

    pub fn mail_folders_url(&self) -> Url {
        self.endpoint(&["me", "mailFolders"])
    }

    pub fn folder_url(&self, folder_id: &str) -> Url {
        self.endpoint(&["me", "mailFolders", folder_id])
    }

    pub fn child_folders_url(&self, parent_id: &str) -> Url {
        self.endpoint(&["me", "mailFolders", parent_id, "childFolders"])
    }

    pub fn messages_url(&self, folder_id: &str, query: &[(&str, String)]) -> Url {
        let mut url = self.endpoint(&["me", "mailFolders", folder_id, "messages"]);
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// GET `url` and decode the body. Non-2xx answers become
    /// `RemoteRequest`, undecodable bodies `MalformedResponse`.
    pub async fn get_json(&self, url: &Url, headers: &AuthHeaders) -> Result<Value> {
        debug!("GET {url}");
        let response = self.transport.get(url, headers).await?;
        if !response.is_success() {
            return Err(Error::RemoteRequest {
                url: url.to_string(),
                status: response.status,
                body: redact_response_body(&response.body),
            });
        }

        serde_json::from_str(&response.body)
            .map_err(|error| Error::malformed(url.as_str(), error))
    }

    pub async fn get_page<T: DeserializeOwned>(
        &self,
        url: &Url,
        headers: &AuthHeaders,
    ) -> Result<GraphPage<T>> {
        let value = self.get_json(url, headers).await?;
        serde_json::from_value(value).map_err(|error| Error::malformed(url.as_str(), error))
    }

    /// Collects every page starting at `url`, stopping early once `limit`
    /// items have been gathered.
    pub async fn get_all<T: DeserializeOwned>(
        &self,
        url: Url,
        headers: &AuthHeaders,
        limit: Option<usize>,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(url);

        while let Some(url) = next.take() {
            let page: GraphPage<T> = self.get_page(&url, headers).await?;
            items.extend(page.value);

            if let Some(limit) = limit {
                if items.len() >= limit {
                    items.truncate(limit);
                    break;
                }
            }

            if let Some(link) = page.next_link {
                let link =
                    Url::parse(&link).map_err(|error| Error::malformed(url.as_str(), error))?;
                next = Some(link);
            }
        }

        Ok(items)
    }

    /// True only when `GET mailFolders/{id}` answers 200.
    pub async fn folder_exists(&self, folder_id: &str, headers: &AuthHeaders) -> bool {
        let url = self.folder_url(folder_id);
        match self.transport.get(&url, headers).await {
            Ok(response) if response.status == 200 => true,
            Ok(response) => {
                warn!(
                    "folder {folder_id} check returned {}: {}",
                    response.status,
                    redact_response_body(&response.body)
                );
                false
            }
            Err(error) => {
                warn!("folder {folder_id} check failed: {error}");
                false
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::testing::{FakeGraph, SharedGraph, BASE};
    use super::{GraphClient, GraphMailFolder};
    use crate::auth::token::AuthHeaders;
    use crate::error::Error;

    fn client(fake: FakeGraph) -> (GraphClient, Arc<FakeGraph>) {
        let fake = Arc::new(fake);
        let client = GraphClient::with_transport(BASE, Box::new(SharedGraph(fake.clone())))
            .expect("graph client");
        (client, fake)
    }

    #[test]
    fn builds_mail_folder_urls() {
        let (graph, _) = client(FakeGraph::default());
        assert_eq!(
            graph.mail_folders_url().as_str(),
            "https://graph.test/v1.0/me/mailFolders"
        );
        assert_eq!(
            graph.child_folders_url("AAMk=").as_str(),
            "https://graph.test/v1.0/me/mailFolders/AAMk=/childFolders"
        );
        let url = graph.messages_url(
            "inbox",
            &[("$select", "from,subject,body".to_string())],
        );
        assert_eq!(url.path(), "/v1.0/me/mailFolders/inbox/messages");
        assert_eq!(
            url.query_pairs().next().map(|(k, v)| (k.into_owned(), v.into_owned())),
            Some(("$select".to_string(), "from,subject,body".to_string()))
        );
    }

    #[tokio::test]
    async fn non_success_status_is_remote_error_and_bad_json_is_malformed() {
        let (graph, _) = client(
            FakeGraph::default()
                .route(&format!("{BASE}/me/mailFolders"), 401, "unauthorized")
                .route(&format!("{BASE}/me/mailFolders/x"), 200, "<html>not json"),
        );
        let headers = AuthHeaders::bearer("t");

        let error = graph
            .get_json(&graph.mail_folders_url(), &headers)
            .await
            .expect_err("401 must fail");
        assert!(matches!(error, Error::RemoteRequest { status: 401, .. }));

        let error = graph
            .get_json(&graph.folder_url("x"), &headers)
            .await
            .expect_err("bad json must fail");
        assert!(matches!(error, Error::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn get_all_follows_next_links() {
        let (graph, fake) = client(
            FakeGraph::default()
                .json(
                    "/me/mailFolders",
                    json!({
                        "value": [{
                            "id": "1",
                            "displayName": "Inbox",
                            "childFolderCount": 2,
                            "unreadItemCount": 7
                        }],
                        "@odata.nextLink": format!("{BASE}/me/mailFolders?$skip=1")
                    }),
                )
                .json(
                    "/me/mailFolders?$skip=1",
                    json!({"value": [{"id": "2", "displayName": "Archive"}]}),
                ),
        );

        let folders: Vec<GraphMailFolder> = graph
            .get_all(graph.mail_folders_url(), &AuthHeaders::bearer("t"), None)
            .await
            .expect("list folders");
        let names: Vec<&str> = folders.iter().map(|f| f.display_name.as_str()).collect();
        assert_eq!(names, vec!["Inbox", "Archive"]);
        assert_eq!(fake.requests().len(), 2);
    }

    #[tokio::test]
    async fn page_without_value_is_malformed() {
        let (graph, _) = client(FakeGraph::default().json("/me/mailFolders", json!({"items": []})));
        let error = graph
            .get_all::<GraphMailFolder>(graph.mail_folders_url(), &AuthHeaders::bearer("t"), None)
            .await
            .expect_err("missing value must fail");
        assert!(matches!(error, Error::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn folder_exists_only_for_200() {
        let (graph, _) = client(
            FakeGraph::default()
                .json("/me/mailFolders/live", json!({"id": "live"}))
                .unreachable("/me/mailFolders/flaky"),
        );
        let headers = AuthHeaders::bearer("t");

        assert!(graph.folder_exists("live", &headers).await);
        assert!(!graph.folder_exists("gone", &headers).await);
        assert!(!graph.folder_exists("flaky", &headers).await);
    }
}
