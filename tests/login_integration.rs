use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use mailgraph::auth::{Browser, MicrosoftIdentityClient, TokenManager, TokenRecord, TokenStore};
use mailgraph::graph::ReqwestTransport;
use mailgraph::{MailClient, Settings};
use reqwest::Url;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use uuid::Uuid;

fn temp_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("mailgraph-login-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp test root");
    root
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}

fn write_settings(root: &Path, authority: &str) -> Settings {
    let path = root.join("mailgraph.toml");
    std::fs::write(
        &path,
        format!(
            r#"[tenant]
id = "tenant-it"

[client]
id = "client-it"

[scopes]
mail = "Mail.Read"

[redirect_uri]
base = "http://127.0.0.1"

[ports]
start = {port}

[callback]
timeout_secs = 10

[authority]
base_url = "{authority}"
"#,
            port = free_port()
        ),
    )
    .expect("write settings");
    Settings::load(&path).expect("load settings")
}

/// Minimal token endpoint: answers every POST with a fixed token and keeps
/// the form bodies it received.
async fn spawn_token_endpoint() -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind token endpoint");
    let base = format!("http://{}", listener.local_addr().expect("local addr"));
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let seen = bodies.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let mut reader = BufReader::new(stream);

            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                let line = line.trim();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
            }

            let mut body = vec![0u8; content_length];
            if reader.read_exact(&mut body).await.is_err() {
                continue;
            }
            seen.lock()
                .expect("lock bodies")
                .push(String::from_utf8_lossy(&body).into_owned());

            let payload = r#"{"access_token":"it-access","refresh_token":"it-refresh","expires_in":3600,"token_type":"Bearer","ext_expires_in":3600}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                payload.len()
            );
            let mut stream = reader.into_inner();
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    (base, bodies)
}

/// Plays the user: follows the authorize URL back to the loopback listener.
#[derive(Default)]
struct ApprovingBrowser {
    opened: Mutex<Vec<String>>,
}

impl Browser for ApprovingBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        self.opened.lock().expect("lock opened").push(url.to_string());

        let url = Url::parse(url).expect("parse authorize url");
        let redirect_uri = url
            .query_pairs()
            .find(|(key, _)| key == "redirect_uri")
            .map(|(_, value)| value.into_owned())
            .expect("redirect_uri in authorize url");
        let mut target = Url::parse(&redirect_uri).expect("parse redirect uri");
        target.query_pairs_mut().append_pair("code", "it-code");

        tokio::spawn(async move {
            let _ = reqwest::get(target).await;
        });
        Ok(())
    }
}

#[tokio::test]
async fn interactive_login_exchanges_code_with_pkce_and_caches_token() {
    let root = temp_root();
    let (authority, bodies) = spawn_token_endpoint().await;
    let settings = write_settings(&root, &authority);

    let browser = Arc::new(ApprovingBrowser::default());
    let client = MailClient::with_parts(
        settings.clone(),
        Box::new(MicrosoftIdentityClient::new(&settings)),
        Box::new(SharedBrowser(browser.clone())),
        Box::new(ReqwestTransport::new()),
    )
    .expect("mail client");

    let before = Utc::now().timestamp();
    let record = client.login().await.expect("interactive login");
    assert_eq!(record.access_token, "it-access");
    assert!(record.expires_on.expect("stamped expiry") >= before + 3600);
    assert!(record.extra.contains_key("ext_expires_in"));

    let opened = browser.opened.lock().expect("lock opened").clone();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].contains("prompt=login"));
    assert!(opened[0].contains("code_challenge_method=S256"));

    let bodies = bodies.lock().expect("lock bodies").clone();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("grant_type=authorization_code"));
    assert!(bodies[0].contains("code=it-code"));
    assert!(bodies[0].contains("code_verifier="));

    let status = client.token_status();
    assert_eq!(status.state, "valid");
    assert!(status.has_refresh_token);

    let _ = std::fs::remove_dir_all(root);
}

#[tokio::test]
async fn expired_token_is_refreshed_against_token_endpoint() {
    let root = temp_root();
    let (authority, bodies) = spawn_token_endpoint().await;
    let settings = write_settings(&root, &authority);

    let stale = TokenRecord {
        access_token: "stale".to_string(),
        refresh_token: Some("stale-refresh".to_string()),
        expires_in: 3600,
        expires_on: Some((Utc::now() - Duration::minutes(10)).timestamp()),
        token_type: Some("Bearer".to_string()),
        scope: None,
        id_token: None,
        extra: Default::default(),
    };
    TokenStore::new(&settings.token_path)
        .save(&stale)
        .expect("seed stale token");

    let provider = MicrosoftIdentityClient::new(&settings);
    let browser = ApprovingBrowser::default();
    let manager = TokenManager::new(&settings, &provider, &browser);

    let headers = manager.headers().await.expect("refreshed headers");
    assert_eq!(headers.authorization(), "Bearer it-access");
    assert!(browser.opened.lock().expect("lock opened").is_empty());

    let bodies = bodies.lock().expect("lock bodies").clone();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("grant_type=refresh_token"));
    assert!(bodies[0].contains("refresh_token=stale-refresh"));

    let _ = std::fs::remove_dir_all(root);
}

struct SharedBrowser(Arc<ApprovingBrowser>);

impl Browser for SharedBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        self.0.open(url)
    }
}
