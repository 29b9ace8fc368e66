use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::folders::FolderIdMap;

pub const DEFAULT_GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_AUTHORITY_BASE: &str = "https://login.microsoftonline.com";
pub const DEFAULT_REDIRECT_BASE: &str = "http://localhost";
const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 300;

const CONFIG_ENV: &str = "MAILGRAPH_CONFIG";
const TENANT_ID_ENV: &str = "MAILGRAPH_TENANT_ID";
const CLIENT_ID_ENV: &str = "MAILGRAPH_CLIENT_ID";
const GRAPH_API_BASE_ENV: &str = "MAILGRAPH_GRAPH_API_BASE";
const AUTHORITY_ENV: &str = "MAILGRAPH_AUTHORITY";

const FOLDER_IDS_SECTION: &str = "folder_ids";

/// Ports the loopback listener may bind, scanned in ascending order.
/// `end` is exclusive; without it only `start` is tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: Option<u16>,
}

impl PortRange {
    pub fn candidates(&self) -> std::ops::RangeInclusive<u16> {
        match self.end {
            Some(end) if end > self.start => self.start..=end - 1,
            Some(_) => std::ops::RangeInclusive::new(1, 0),
            None => self.start..=self.start,
        }
    }
}

/// Everything the login flow, token cache and Graph client need, read once
/// from the sectioned settings file and passed around by reference.
#[derive(Debug, Clone)]
pub struct Settings {
    pub path: PathBuf,
    pub tenant_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub redirect_base: String,
    pub ports: PortRange,
    pub callback_timeout: Option<Duration>,
    pub graph_base: String,
    pub authority_base: String,
    pub token_path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    #[serde(default)]
    tenant: IdSection,
    #[serde(default)]
    client: IdSection,
    #[serde(default)]
    scopes: toml::Table,
    #[serde(default)]
    redirect_uri: RedirectSection,
    ports: Option<PortsSection>,
    #[serde(default)]
    callback: CallbackSection,
    #[serde(default)]
    graph: BaseUrlSection,
    #[serde(default)]
    authority: BaseUrlSection,
    #[serde(default)]
    token: TokenSection,
}

#[derive(Debug, Default, Deserialize)]
struct IdSection {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RedirectSection {
    base: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PortsSection {
    start: u16,
    end: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct CallbackSection {
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BaseUrlSection {
    base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenSection {
    path: Option<PathBuf>,
}

impl Settings {
    pub fn default_path() -> Result<PathBuf> {
        if let Some(path) = env_value(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        Ok(mailgraph_home()?.join("mailgraph.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            Error::Config(format!("read settings file {}: {error}", path.display()))
        })?;
        Self::parse_with_env(&raw, path, env_value)
    }

    /// Parses settings text, letting `env` override individual values the
    /// same way process environment variables do in [`Settings::load`].
    pub fn parse_with_env<F>(raw: &str, path: &Path, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed: RawSettings = toml::from_str(raw)
            .map_err(|error| Error::Config(format!("parse {}: {error}", path.display())))?;

        let tenant_id = env(TENANT_ID_ENV)
            .or_else(|| non_blank(parsed.tenant.id))
            .ok_or_else(|| Error::Config(format!("missing [tenant] id ({TENANT_ID_ENV})")))?;
        let client_id = env(CLIENT_ID_ENV)
            .or_else(|| non_blank(parsed.client.id))
            .ok_or_else(|| Error::Config(format!("missing [client] id ({CLIENT_ID_ENV})")))?;

        let scopes: Vec<String> = parsed
            .scopes
            .into_iter()
            .filter_map(|(_, scope)| match scope {
                toml::Value::String(scope) => non_blank(Some(scope)),
                _ => None,
            })
            .collect();
        if scopes.is_empty() {
            return Err(Error::Config("[scopes] must list at least one scope".to_string()));
        }

        let ports = parsed
            .ports
            .ok_or_else(|| Error::Config("missing [ports] start".to_string()))?;
        if let Some(end) = ports.end {
            if end <= ports.start {
                return Err(Error::Config(format!(
                    "[ports] end ({end}) must be greater than start ({})",
                    ports.start
                )));
            }
        }

        let redirect_base = non_blank(parsed.redirect_uri.base)
            .unwrap_or_else(|| DEFAULT_REDIRECT_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        if redirect_base.split_once("://").is_none() {
            return Err(Error::Config(format!(
                "[redirect_uri] base must include a scheme, got '{redirect_base}'"
            )));
        }

        let callback_timeout = match parsed
            .callback
            .timeout_secs
            .unwrap_or(DEFAULT_CALLBACK_TIMEOUT_SECS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let graph_base = env(GRAPH_API_BASE_ENV)
            .or_else(|| non_blank(parsed.graph.base_url))
            .unwrap_or_else(|| DEFAULT_GRAPH_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        let authority_base = env(AUTHORITY_ENV)
            .or_else(|| non_blank(parsed.authority.base_url))
            .unwrap_or_else(|| DEFAULT_AUTHORITY_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        let token_path = match parsed.token.path {
            Some(token_path) if token_path.is_relative() => path
                .parent()
                .map(|dir| dir.join(&token_path))
                .unwrap_or(token_path),
            Some(token_path) => token_path,
            None => path
                .parent()
                .map(|dir| dir.join("token.json"))
                .unwrap_or_else(|| PathBuf::from("token.json")),
        };

        Ok(Self {
            path: path.to_path_buf(),
            tenant_id,
            client_id,
            scopes,
            redirect_base,
            ports: PortRange {
                start: ports.start,
                end: ports.end,
            },
            callback_timeout,
            graph_base,
            authority_base,
            token_path,
        })
    }

    /// Host part of the redirect base, e.g. `localhost` for `http://localhost`.
    pub fn redirect_host(&self) -> &str {
        let without_scheme = self
            .redirect_base
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.redirect_base);
        without_scheme
            .split(['/', ':'])
            .next()
            .unwrap_or(without_scheme)
    }

    /// Redirect URI for a bound loopback port: the port goes right after the
    /// host, ahead of any path the base carries.
    pub fn redirect_uri_for(&self, port: u16) -> String {
        let (scheme, rest) = self
            .redirect_base
            .split_once("://")
            .unwrap_or(("http", &self.redirect_base));
        let host = self.redirect_host();
        let path = rest
            .find('/')
            .map(|index| &rest[index..])
            .unwrap_or_default();
        format!("{scheme}://{host}:{port}{path}")
    }

    pub fn folder_id_store(&self) -> FolderIdStore {
        FolderIdStore::new(&self.path)
    }
}

/// The read-write `[folder_ids]` section of the settings file.
#[derive(Debug, Clone)]
pub struct FolderIdStore {
    path: PathBuf,
}

impl FolderIdStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `Ok(None)` when the file or the section does not exist.
    pub fn load(&self) -> Result<Option<FolderIdMap>> {
        let Some(table) = self.read_table()? else {
            return Ok(None);
        };

        let Some(section) = table.get(FOLDER_IDS_SECTION) else {
            return Ok(None);
        };
        let section = section.as_table().ok_or_else(|| {
            Error::Config(format!(
                "[{FOLDER_IDS_SECTION}] in {} is not a table",
                self.path.display()
            ))
        })?;

        let folder_ids = section
            .iter()
            .filter_map(|(name, id)| id.as_str().map(|id| (name.clone(), id.to_string())))
            .collect::<FolderIdMap>();

        if folder_ids.is_empty() {
            return Ok(None);
        }
        Ok(Some(folder_ids))
    }

    /// Replaces the whole `[folder_ids]` section, leaving every other
    /// section of the file as it was.
    pub fn store(&self, folder_ids: &FolderIdMap) -> Result<()> {
        let mut table = self.read_table()?.unwrap_or_default();

        let section = folder_ids
            .iter()
            .map(|(name, id)| (name.clone(), toml::Value::String(id.clone())))
            .collect::<toml::Table>();
        table.insert(FOLDER_IDS_SECTION.to_string(), toml::Value::Table(section));

        let rendered = toml::to_string_pretty(&table)
            .map_err(|error| Error::Config(format!("render settings: {error}")))?;
        std::fs::write(&self.path, rendered).map_err(|error| Error::storage(&self.path, error))?;

        debug!(
            "stored {} folder ids in {}",
            folder_ids.len(),
            self.path.display()
        );
        Ok(())
    }

    fn read_table(&self) -> Result<Option<toml::Table>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(Error::storage(&self.path, error)),
        };

        raw.parse::<toml::Table>()
            .map(Some)
            .map_err(|error| Error::Config(format!("parse {}: {error}", self.path.display())))
    }
}

pub fn mailgraph_home() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("failed to determine home directory".to_string()))?;
    Ok(home.join(".mailgraph"))
}

fn env_value(key: &str) -> Option<String> {
    non_blank(std::env::var(key).ok())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
