use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::auth::listener::{capture_auth_code, Browser};
use crate::auth::provider::{IdentityProvider, TokenResult};
use crate::config::Settings;
use crate::error::{Error, Result};

/// Persisted token. `expires_on` is stamped as `issued_at + expires_in`
/// whenever a record is created from a provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const RECORD_FIELDS: &[&str] = &[
    "access_token",
    "refresh_token",
    "expires_in",
    "expires_on",
    "token_type",
    "scope",
    "id_token",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    Expired,
    /// No `expires_on`; the record predates stamping or was edited by hand.
    Unstamped,
}

impl TokenRecord {
    /// Fails unless the provider response carries an access token whose
    /// lifetime fits in a timestamp.
    pub fn from_result(result: TokenResult, issued_at: DateTime<Utc>) -> Result<Self> {
        if !result.is_success() {
            return Err(Error::Authentication(
                "token response carried no access token".to_string(),
            ));
        }

        let expires_in = result.expires_in.unwrap_or(0).max(0);
        let expires_on = TimeDelta::try_seconds(expires_in)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| {
                Error::Authentication(format!(
                    "token response expires_in {expires_in} is out of range"
                ))
            })?
            .timestamp();

        // The record stamps these itself; a second copy would not read back.
        let mut extra = result.extra;
        for key in RECORD_FIELDS {
            extra.remove(*key);
        }

        Ok(Self {
            access_token: result.access_token.unwrap_or_default(),
            refresh_token: result.refresh_token.filter(|token| !token.trim().is_empty()),
            expires_in,
            expires_on: Some(expires_on),
            token_type: result.token_type,
            scope: result.scope,
            id_token: result.id_token,
            extra,
        })
    }

    pub fn state(&self, now: DateTime<Utc>) -> TokenState {
        match self.expires_on {
            None => TokenState::Unstamped,
            Some(expires_on) if expires_on > now.timestamp() => TokenState::Valid,
            Some(_) => TokenState::Expired,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_on
            .and_then(|expires_on| DateTime::from_timestamp(expires_on, 0))
    }

    pub fn headers(&self) -> AuthHeaders {
        AuthHeaders::bearer(&self.access_token)
    }
}

/// Headers every Graph request carries.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    authorization: String,
}

impl AuthHeaders {
    pub const CONTENT_TYPE: &'static str = "application/json";

    pub fn bearer(access_token: &str) -> Self {
        Self {
            authorization: format!("Bearer {access_token}"),
        }
    }

    pub fn authorization(&self) -> &str {
        &self.authorization
    }

    pub fn pairs(&self) -> [(&'static str, &str); 2] {
        [
            ("Authorization", self.authorization.as_str()),
            ("Content-Type", Self::CONTENT_TYPE),
        ]
    }
}

impl std::fmt::Debug for AuthHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHeaders")
            .field("authorization", &"Bearer <redacted>")
            .finish()
    }
}

/// What the token file held when it was read.
#[derive(Debug)]
pub enum StoredToken {
    Missing,
    Unreadable(Error),
    Corrupt(String),
    Present(TokenRecord),
}

/// Flat JSON file holding the last token record. Writes replace the whole
/// file and are not atomic; a torn write reads back as `Corrupt`.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> StoredToken {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return StoredToken::Missing
            }
            Err(error) => return StoredToken::Unreadable(Error::storage(&self.path, error)),
        };

        match serde_json::from_str::<TokenRecord>(&raw) {
            Ok(record) if record.access_token.trim().is_empty() => {
                StoredToken::Corrupt("empty access_token".to_string())
            }
            Ok(record) => StoredToken::Present(record),
            Err(error) => StoredToken::Corrupt(error.to_string()),
        }
    }

    pub fn save(&self, record: &TokenRecord) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| Error::storage(parent, error))?;
        }

        let rendered = serde_json::to_string_pretty(record).map_err(|error| {
            Error::storage(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, error),
            )
        })?;
        std::fs::write(&self.path, rendered).map_err(|error| Error::storage(&self.path, error))?;
        restrict_permissions(&self.path);
        Ok(())
    }
}

/// What `mailgraph status` reports about the token file. Built without any
/// network call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenStatus {
    pub path: PathBuf,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub has_refresh_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TokenStatus {
    pub fn inspect(store: &TokenStore, now: DateTime<Utc>) -> Self {
        let mut status = Self {
            path: store.path().to_path_buf(),
            state: "missing",
            expires_at: None,
            has_refresh_token: false,
            detail: None,
        };

        match store.load() {
            StoredToken::Missing => {}
            StoredToken::Unreadable(error) => {
                status.state = "unreadable";
                status.detail = Some(error.to_string());
            }
            StoredToken::Corrupt(reason) => {
                status.state = "corrupt";
                status.detail = Some(reason);
            }
            StoredToken::Present(record) => {
                status.state = match record.state(now) {
                    TokenState::Valid => "valid",
                    TokenState::Expired => "expired",
                    TokenState::Unstamped => "unstamped",
                };
                status.expires_at = record.expires_at();
                status.has_refresh_token = record
                    .refresh_token
                    .as_deref()
                    .is_some_and(|token| !token.trim().is_empty());
            }
        }

        status
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(error) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        debug!("could not restrict permissions on {}: {error}", path.display());
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

/// Produces a usable token record: cached when still valid, refreshed when
/// expired, otherwise obtained through the provider's silent or interactive
/// flow.
pub struct TokenManager<'a> {
    settings: &'a Settings,
    provider: &'a dyn IdentityProvider,
    browser: &'a dyn Browser,
    store: TokenStore,
}

impl<'a> TokenManager<'a> {
    pub fn new(
        settings: &'a Settings,
        provider: &'a dyn IdentityProvider,
        browser: &'a dyn Browser,
    ) -> Self {
        Self {
            settings,
            provider,
            browser,
            store: TokenStore::new(&settings.token_path),
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub async fn headers(&self) -> Result<AuthHeaders> {
        Ok(self.token_record().await?.headers())
    }

    pub async fn token_record(&self) -> Result<TokenRecord> {
        match self.store.load() {
            StoredToken::Missing => {
                info!("no cached token at {}", self.store.path().display());
                self.retrieve().await
            }
            StoredToken::Unreadable(error) => {
                warn!("ignoring token cache: {error}");
                self.retrieve().await
            }
            StoredToken::Corrupt(reason) => {
                warn!(
                    "discarding unreadable token cache {}: {reason}",
                    self.store.path().display()
                );
                self.retrieve().await
            }
            StoredToken::Present(record) => match record.state(Utc::now()) {
                TokenState::Valid => {
                    debug!("using cached token valid until {:?}", record.expires_at());
                    Ok(record)
                }
                TokenState::Unstamped => {
                    warn!("cached token has no expiry; signing in again");
                    self.retrieve().await
                }
                TokenState::Expired => self.refresh(&record).await,
            },
        }
    }

    /// Forces a fresh interactive sign-in and replaces the cached token.
    pub async fn login(&self) -> Result<TokenRecord> {
        let result = self.interactive().await?;
        self.stamp_and_persist(result)
    }

    /// Writes `record` to the token file. A failed write is logged and
    /// reported as `false`; the caller keeps its token either way.
    pub fn persist(&self, record: &TokenRecord) -> bool {
        match self.store.save(record) {
            Ok(()) => true,
            Err(error) => {
                warn!("could not save token cache: {error}");
                false
            }
        }
    }

    async fn refresh(&self, record: &TokenRecord) -> Result<TokenRecord> {
        let refresh_token = record
            .refresh_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                Error::Authentication("cached token expired and has no refresh token".to_string())
            })?;

        info!("cached token expired; refreshing");
        let result = self
            .provider
            .exchange_refresh_token(refresh_token, &self.settings.scopes)
            .await
            .map_err(|error| Error::Authentication(format!("token refresh failed: {error}")))?;
        self.stamp_and_persist(result)
    }

    async fn retrieve(&self) -> Result<TokenRecord> {
        if let Some(account) = self.provider.cached_account() {
            match self
                .provider
                .acquire_silently(&self.settings.scopes, &account)
                .await
            {
                Ok(result) if result.is_success() => return self.stamp_and_persist(result),
                Ok(_) => warn!("silent token acquisition returned no access token"),
                Err(error) => warn!("silent token acquisition failed: {error}"),
            }
        }

        let result = self.interactive().await?;
        self.stamp_and_persist(result)
    }

    async fn interactive(&self) -> Result<TokenResult> {
        let exchange = capture_auth_code(self.settings, self.provider, self.browser).await?;
        let code = exchange
            .code
            .ok_or_else(|| Error::Authentication("no authorization code received".to_string()))?;

        self.provider
            .exchange_code(&code, &self.settings.scopes, &exchange.redirect_uri)
            .await
            .map_err(|error| Error::Authentication(format!("code exchange failed: {error}")))
    }

    fn stamp_and_persist(&self, result: TokenResult) -> Result<TokenRecord> {
        let record = TokenRecord::from_result(result, Utc::now())?;
        self.persist(&record);
        Ok(record)
    }
}
