use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Url;
use uuid::Uuid;

use crate::auth::listener::Browser;
use crate::auth::provider::{Account, IdentityProvider, TokenResult};
use crate::config::Settings;
use crate::error::{Error, Result};

pub(crate) fn temp_dir(label: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("mailgraph-{label}-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp test root");
    root
}

pub(crate) fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}

/// Settings bound to a loopback port and a token file inside `root`.
pub(crate) fn test_settings(root: &Path, graph_base: &str) -> Settings {
    let raw = format!(
        r#"
[tenant]
id = "tenant-a"
[client]
id = "client-a"
[scopes]
mail = "Mail.Read"
[redirect_uri]
base = "http://127.0.0.1"
[ports]
start = {port}
[callback]
timeout_secs = 5
[graph]
base_url = "{graph_base}"
[token]
path = "token.json"
"#,
        port = free_port()
    );
    let path = root.join("mailgraph.toml");
    std::fs::write(&path, &raw).expect("write test settings");
    Settings::parse_with_env(&raw, &path, |_| None).expect("parse test settings")
}

pub(crate) fn token(access: &str, refresh: Option<&str>, expires_in: i64) -> TokenResult {
    TokenResult {
        access_token: Some(access.to_string()),
        refresh_token: refresh.map(str::to_string),
        expires_in: Some(expires_in),
        token_type: Some("Bearer".to_string()),
        ..TokenResult::default()
    }
}

/// Identity provider double that answers from canned token results and
/// records every call it receives.
#[derive(Debug, Default)]
pub(crate) struct FakeProvider {
    pub account: Option<Account>,
    pub silent: Option<TokenResult>,
    pub code: Option<TokenResult>,
    pub refresh: Option<TokenResult>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock calls").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("lock calls").push(call);
    }

    fn answer(&self, canned: &Option<TokenResult>) -> Result<TokenResult> {
        canned.clone().ok_or_else(|| Error::RemoteRequest {
            url: "https://login.test/token".to_string(),
            status: 400,
            body: "{\"error\":\"invalid_grant\"}".to_string(),
        })
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    fn cached_account(&self) -> Option<Account> {
        self.account.clone()
    }

    async fn acquire_silently(&self, _scopes: &[String], account: &Account) -> Result<TokenResult> {
        self.record(format!("silent:{}", account.username.as_deref().unwrap_or("-")));
        self.answer(&self.silent)
    }

    fn build_authorize_url(&self, _scopes: &[String], redirect_uri: &str) -> Result<String> {
        self.record("authorize".to_string());
        let url = Url::parse_with_params(
            "https://login.test/authorize",
            &[("redirect_uri", redirect_uri), ("prompt", "login")],
        )
        .expect("build fake authorize url");
        Ok(url.to_string())
    }

    async fn exchange_code(
        &self,
        code: &str,
        _scopes: &[String],
        redirect_uri: &str,
    ) -> Result<TokenResult> {
        self.record(format!("code:{code}:{redirect_uri}"));
        self.answer(&self.code)
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        _scopes: &[String],
    ) -> Result<TokenResult> {
        self.record(format!("refresh:{refresh_token}"));
        self.answer(&self.refresh)
    }
}

/// Browser double that plays the user: it follows the authorize URL's
/// `redirect_uri` straight back to the loopback listener.
#[derive(Debug, Default)]
pub(crate) struct RedirectingBrowser {
    code: Option<String>,
    opened: AtomicUsize,
}

impl RedirectingBrowser {
    pub fn with_code(code: &str) -> Self {
        Self {
            code: Some(code.to_string()),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Browser for RedirectingBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        self.opened.fetch_add(1, Ordering::SeqCst);

        let url = Url::parse(url).expect("parse authorize url");
        let redirect_uri = url
            .query_pairs()
            .find(|(key, _)| key == "redirect_uri")
            .map(|(_, value)| value.into_owned())
            .expect("authorize url carries redirect_uri");
        let mut target = Url::parse(&redirect_uri).expect("parse redirect uri");
        if let Some(code) = &self.code {
            target.query_pairs_mut().append_pair("code", code);
        }

        tokio::spawn(async move {
            let _ = reqwest::get(target).await;
        });
        Ok(())
    }
}

/// Browser double for flows that must never reach the interactive step.
#[derive(Debug, Default)]
pub(crate) struct NoBrowser;

impl Browser for NoBrowser {
    fn open(&self, _url: &str) -> std::io::Result<()> {
        panic!("interactive login was not expected");
    }
}
