use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::{Client, Url};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{redact_response_body, Error, Result};

/// Scopes the identity platform always grants alongside the requested ones.
const RESERVED_SCOPES: &[&str] = &["openid", "profile", "offline_access"];
const PKCE_VERIFIER_BYTES: usize = 32;

/// Account remembered by the identity client after a successful login.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub username: Option<String>,
    pub home_account_id: Option<String>,
    refresh_token: String,
}

impl Account {
    pub fn new(
        username: Option<String>,
        home_account_id: Option<String>,
        refresh_token: String,
    ) -> Self {
        Self {
            username,
            home_account_id,
            refresh_token,
        }
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("username", &self.username)
            .field("home_account_id", &self.home_account_id)
            .finish_non_exhaustive()
    }
}

/// Raw token endpoint payload. Only counts as a token when it carries a
/// non-empty access token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenResult {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "int_or_string")]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenResult {
    pub fn is_success(&self) -> bool {
        self.access_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
    }
}

fn int_or_string<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match Option::<IntOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(IntOrString::Int(value)) => Ok(Some(value)),
        Some(IntOrString::Str(value)) => value
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Boundary to the identity provider's authorize and token endpoints.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Zero or one account from the provider client's own cache.
    fn cached_account(&self) -> Option<Account>;

    async fn acquire_silently(&self, scopes: &[String], account: &Account) -> Result<TokenResult>;

    /// Authorization URL forcing a fresh login prompt.
    fn build_authorize_url(&self, scopes: &[String], redirect_uri: &str) -> Result<String>;

    async fn exchange_code(
        &self,
        code: &str,
        scopes: &[String],
        redirect_uri: &str,
    ) -> Result<TokenResult>;

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResult>;
}

#[derive(Debug)]
struct PendingAuthorization {
    redirect_uri: String,
    code_verifier: String,
}

/// Public-client (no secret) authorization code flow with PKCE against the
/// Microsoft identity platform v2.0 endpoints.
#[derive(Debug)]
pub struct MicrosoftIdentityClient {
    client: Client,
    client_id: String,
    authorize_endpoint: String,
    token_endpoint: String,
    rng: SystemRandom,
    pending: Mutex<Option<PendingAuthorization>>,
    account: Mutex<Option<Account>>,
}

impl MicrosoftIdentityClient {
    pub fn new(settings: &Settings) -> Self {
        let authority = format!("{}/{}", settings.authority_base, settings.tenant_id);
        Self {
            client: Client::new(),
            client_id: settings.client_id.clone(),
            authorize_endpoint: format!("{authority}/oauth2/v2.0/authorize"),
            token_endpoint: format!("{authority}/oauth2/v2.0/token"),
            rng: SystemRandom::new(),
            pending: Mutex::new(None),
            account: Mutex::new(None),
        }
    }

    pub fn token_endpoint(&self) -> &str {
        &self.token_endpoint
    }

    async fn request_token(&self, grant: &str, form: &[(&str, &str)]) -> Result<TokenResult> {
        let request_id = Uuid::new_v4();
        debug!("requesting {grant} token (client-request-id {request_id})");

        let mut params = vec![("client_id", self.client_id.as_str()), ("grant_type", grant)];
        params.extend_from_slice(form);

        let response = self
            .client
            .post(&self.token_endpoint)
            .header("client-request-id", request_id.to_string())
            .form(&params)
            .send()
            .await
            .map_err(|source| Error::Transport {
                url: self.token_endpoint.clone(),
                source,
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|source| Error::Transport {
            url: self.token_endpoint.clone(),
            source,
        })?;
        if !status.is_success() {
            return Err(Error::RemoteRequest {
                url: self.token_endpoint.clone(),
                status: status.as_u16(),
                body: redact_response_body(&body),
            });
        }

        let result: TokenResult = serde_json::from_str(&body)
            .map_err(|error| Error::malformed(&self.token_endpoint, error))?;
        self.remember_account(&result);
        Ok(result)
    }

    fn remember_account(&self, result: &TokenResult) {
        if !result.is_success() {
            return;
        }
        let Some(refresh_token) = result.refresh_token.clone() else {
            return;
        };

        let claims = result.id_token.as_deref().and_then(id_token_claims);
        let username = claims.as_ref().and_then(|claims| {
            claims
                .get("preferred_username")
                .or_else(|| claims.get("upn"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let home_account_id = claims.as_ref().and_then(|claims| {
            let oid = claims.get("oid")?.as_str()?;
            let tid = claims.get("tid")?.as_str()?;
            Some(format!("{oid}.{tid}"))
        });

        let mut account = self
            .account
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *account = Some(Account::new(username, home_account_id, refresh_token));
    }

    fn random_url_safe(&self, len: usize) -> Result<String> {
        let mut bytes = vec![0u8; len];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| Error::Authentication("generate random PKCE verifier".to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }
}

#[async_trait]
impl IdentityProvider for MicrosoftIdentityClient {
    fn cached_account(&self) -> Option<Account> {
        self.account
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn acquire_silently(&self, scopes: &[String], account: &Account) -> Result<TokenResult> {
        debug!(
            "acquiring token silently for {}",
            account.username.as_deref().unwrap_or("<unknown account>")
        );
        self.exchange_refresh_token(account.refresh_token(), scopes).await
    }

    fn build_authorize_url(&self, scopes: &[String], redirect_uri: &str) -> Result<String> {
        let code_verifier = self.random_url_safe(PKCE_VERIFIER_BYTES)?;
        let code_challenge = pkce_challenge(&code_verifier);

        let mut url = Url::parse(&self.authorize_endpoint).map_err(|error| {
            Error::Config(format!("parse authorize URL {}: {error}", self.authorize_endpoint))
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("response_mode", "query")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &scope_param(scopes))
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("prompt", "login");

        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *pending = Some(PendingAuthorization {
            redirect_uri: redirect_uri.to_string(),
            code_verifier,
        });

        Ok(url.to_string())
    }

    async fn exchange_code(
        &self,
        code: &str,
        scopes: &[String],
        redirect_uri: &str,
    ) -> Result<TokenResult> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| {
                Error::Authentication("no pending authorization request for this code".to_string())
            })?;
        if pending.redirect_uri != redirect_uri {
            warn!(
                "redirect URI changed between authorize ({}) and token ({redirect_uri}) requests",
                pending.redirect_uri
            );
        }

        let scope = scope_param(scopes);
        self.request_token(
            "authorization_code",
            &[
                ("scope", scope.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("code_verifier", pending.code_verifier.as_str()),
            ],
        )
        .await
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResult> {
        let scope = scope_param(scopes);
        self.request_token(
            "refresh_token",
            &[("scope", scope.as_str()), ("refresh_token", refresh_token)],
        )
        .await
    }
}

/// RFC 7636 S256 challenge for `verifier`.
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(digest(&SHA256, verifier.as_bytes()).as_ref())
}

fn scope_param(scopes: &[String]) -> String {
    let mut all: Vec<&str> = scopes.iter().map(String::as_str).collect();
    for reserved in RESERVED_SCOPES {
        if !all.iter().any(|scope| scope.eq_ignore_ascii_case(reserved)) {
            all.push(reserved);
        }
    }
    all.join(" ")
}

fn id_token_claims(id_token: &str) -> Option<Map<String, Value>> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}
