use chrono::Utc;
use tracing::info;

use crate::auth::listener::{Browser, SystemBrowser};
use crate::auth::provider::{IdentityProvider, MicrosoftIdentityClient};
use crate::auth::token::{TokenManager, TokenRecord, TokenStatus};
use crate::config::Settings;
use crate::error::Result;
use crate::graph::folders::{FolderIdMap, FolderResolver, INBOX};
use crate::graph::messages::{fetch_messages, FetchReport, MessageQuery};
use crate::graph::{GraphClient, GraphTransport};

/// Signs in as needed and reads mail through Microsoft Graph.
pub struct MailClient {
    settings: Settings,
    provider: Box<dyn IdentityProvider>,
    browser: Box<dyn Browser>,
    graph: GraphClient,
}

impl MailClient {
    pub fn new(settings: Settings) -> Result<Self> {
        let provider = Box::new(MicrosoftIdentityClient::new(&settings));
        let graph = GraphClient::new(&settings)?;
        Ok(Self {
            settings,
            provider,
            browser: Box::new(SystemBrowser),
            graph,
        })
    }

    pub fn with_parts(
        settings: Settings,
        provider: Box<dyn IdentityProvider>,
        browser: Box<dyn Browser>,
        transport: Box<dyn GraphTransport>,
    ) -> Result<Self> {
        let graph = GraphClient::with_transport(&settings.graph_base, transport)?;
        Ok(Self {
            settings,
            provider,
            browser,
            graph,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn tokens(&self) -> TokenManager<'_> {
        TokenManager::new(&self.settings, self.provider.as_ref(), self.browser.as_ref())
    }

    /// Interactive sign-in regardless of what the token file holds.
    pub async fn login(&self) -> Result<TokenRecord> {
        self.tokens().login().await
    }

    pub fn token_status(&self) -> TokenStatus {
        TokenStatus::inspect(self.tokens().store(), Utc::now())
    }

    pub async fn folder_ids(&self, folder_paths: Option<&str>) -> Result<FolderIdMap> {
        let headers = self.tokens().headers().await?;
        FolderResolver::new(&self.graph, self.settings.folder_id_store())
            .resolve_folder_ids(folder_paths, &headers)
            .await
    }

    /// Messages from the folders named by `folder_paths` (the inbox when
    /// empty), using today's messages when no query is given.
    pub async fn get_messages(
        &self,
        folder_paths: Option<&str>,
        query: Option<MessageQuery>,
    ) -> Result<FetchReport> {
        let headers = self.tokens().headers().await?;
        let folder_paths = folder_paths
            .map(str::trim)
            .filter(|paths| !paths.is_empty())
            .unwrap_or(INBOX);

        let folder_ids = FolderResolver::new(&self.graph, self.settings.folder_id_store())
            .resolve_folder_ids(Some(folder_paths), &headers)
            .await?;
        let query = query.unwrap_or_default();

        let report = fetch_messages(&self.graph, &folder_ids, &query, &headers).await;
        info!(
            "fetched {} messages from {} folders ({} failed)",
            report.messages.len(),
            folder_ids.len(),
            report.errors.len()
        );
        Ok(report)
    }
}
