use std::collections::BTreeMap;

use reqwest::Url;
use tracing::{debug, info, warn};

use crate::auth::token::AuthHeaders;
use crate::config::FolderIdStore;
use crate::error::{Error, Result};
use crate::graph::{GraphClient, GraphMailFolder, GraphPage};

/// Leaf folder name to Graph folder ID.
pub type FolderIdMap = BTreeMap<String, String>;

/// Well-known folder name Graph accepts in place of an ID.
pub const INBOX: &str = "inbox";

#[derive(Debug, Clone, PartialEq, Eq)]
enum RequestedFolder {
    Inbox,
    Path(Vec<String>),
}

impl RequestedFolder {
    fn leaf(&self) -> &str {
        match self {
            Self::Inbox => INBOX,
            Self::Path(segments) => segments.last().map(String::as_str).unwrap_or(INBOX),
        }
    }
}

/// Splits `A/B;C/D` into its requested folders, dropping empty entries.
fn parse_folder_paths(raw: &str) -> Vec<RequestedFolder> {
    raw.split(';')
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .filter_map(|path| {
            if path.eq_ignore_ascii_case(INBOX) {
                return Some(RequestedFolder::Inbox);
            }
            let segments: Vec<String> = path
                .split('/')
                .map(str::trim)
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect();
            (!segments.is_empty()).then_some(RequestedFolder::Path(segments))
        })
        .collect()
}

fn inbox_only() -> FolderIdMap {
    FolderIdMap::from([(INBOX.to_string(), INBOX.to_string())])
}

fn prefix_key(segments: &[String]) -> String {
    segments.join("/").to_lowercase()
}

/// Turns folder paths into folder IDs, caching the answer in the settings
/// file.
pub struct FolderResolver<'a> {
    graph: &'a GraphClient,
    store: FolderIdStore,
}

impl<'a> FolderResolver<'a> {
    pub fn new(graph: &'a GraphClient, store: FolderIdStore) -> Self {
        Self { graph, store }
    }

    /// Resolves `;`-separated folder paths to a map keyed by each path's
    /// leaf name. Paths that cannot be resolved are logged and left out.
    pub async fn resolve_folder_ids(
        &self,
        folder_paths: Option<&str>,
        headers: &AuthHeaders,
    ) -> Result<FolderIdMap> {
        let Some(raw) = folder_paths
            .map(str::trim)
            .filter(|raw| !raw.is_empty() && !raw.eq_ignore_ascii_case(INBOX))
        else {
            return Ok(inbox_only());
        };

        let requested = parse_folder_paths(raw);
        if requested.is_empty() {
            return Ok(inbox_only());
        }
        let leaves: Vec<&str> = requested.iter().map(RequestedFolder::leaf).collect();

        if let Some(cached) = self.verified_cache(&leaves, headers).await {
            info!("using {} cached folder ids", cached.len());
            return Ok(cached);
        }

        info!("resolving folder ids from Microsoft Graph");
        let resolved = self.walk(&requested, headers).await;
        if resolved.is_empty() {
            warn!("none of the requested folders could be resolved");
            return Ok(resolved);
        }

        if let Err(error) = self.store.store(&resolved) {
            warn!("could not cache folder ids: {error}");
        }
        Ok(resolved)
    }

    /// Cached IDs for `leaves`, provided the cache names every leaf and all
    /// of its entries still exist on the server.
    async fn verified_cache(&self, leaves: &[&str], headers: &AuthHeaders) -> Option<FolderIdMap> {
        let cache = match self.store.load() {
            Ok(Some(cache)) => cache,
            Ok(None) => return None,
            Err(error) => {
                warn!("ignoring folder id cache: {error}");
                return None;
            }
        };

        if let Some(missing) = leaves.iter().find(|leaf| !cache.contains_key(**leaf)) {
            debug!("folder id cache has no entry for {missing}");
            return None;
        }

        for (name, id) in &cache {
            if !self.graph.folder_exists(id, headers).await {
                info!("cached id for folder {name} is stale; refreshing folder ids");
                return None;
            }
        }

        Some(
            leaves
                .iter()
                .filter_map(|leaf| {
                    cache
                        .get(*leaf)
                        .map(|id| ((*leaf).to_string(), id.clone()))
                })
                .collect(),
        )
    }

    async fn walk(&self, requested: &[RequestedFolder], headers: &AuthHeaders) -> FolderIdMap {
        // Scaffolding keyed by lowercased path prefix; seeded with the inbox.
        let mut known = inbox_only();
        let mut resolved = FolderIdMap::new();

        for folder in requested {
            let segments = match folder {
                RequestedFolder::Inbox => {
                    resolved.insert(INBOX.to_string(), INBOX.to_string());
                    continue;
                }
                RequestedFolder::Path(segments) => segments,
            };

            match self.walk_path(segments, &mut known, headers).await {
                Ok(id) => {
                    resolved.insert(folder.leaf().to_string(), id);
                }
                Err(error) => warn!("skipping folder {}: {error}", segments.join("/")),
            }
        }

        resolved
    }

    async fn walk_path(
        &self,
        segments: &[String],
        known: &mut FolderIdMap,
        headers: &AuthHeaders,
    ) -> Result<String> {
        let mut parent: Option<String> = None;

        for depth in 0..segments.len() {
            let key = prefix_key(&segments[..=depth]);
            if let Some(id) = known.get(&key) {
                parent = Some(id.clone());
                continue;
            }

            let segment = &segments[depth];
            let child = self
                .find_child(parent.as_deref(), segment, headers)
                .await?
                .ok_or_else(|| Error::FolderNotFound {
                    path: segments.join("/"),
                    segment: segment.clone(),
                })?;

            debug!("resolved {key} to {}", child.id);
            known.insert(key, child.id.clone());
            parent = Some(child.id);
        }

        parent.ok_or_else(|| Error::FolderNotFound {
            path: segments.join("/"),
            segment: String::new(),
        })
    }

    /// First child of `parent` (top level when `None`) whose display name
    /// matches `name` ignoring case. Stops paging once found.
    async fn find_child(
        &self,
        parent: Option<&str>,
        name: &str,
        headers: &AuthHeaders,
    ) -> Result<Option<GraphMailFolder>> {
        let wanted = name.to_lowercase();
        let mut url = match parent {
            Some(parent) => self.graph.child_folders_url(parent),
            None => self.graph.mail_folders_url(),
        };

        loop {
            let page: GraphPage<GraphMailFolder> = self.graph.get_page(&url, headers).await?;
            if let Some(found) = page
                .value
                .into_iter()
                .find(|folder| folder.display_name.to_lowercase() == wanted)
            {
                return Ok(Some(found));
            }

            match page.next_link {
                Some(next) => {
                    url = Url::parse(&next)
                        .map_err(|error| Error::malformed(url.as_str(), error))?;
                }
                None => return Ok(None),
            }
        }
    }
}
