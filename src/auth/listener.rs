use std::time::Duration;

use reqwest::Url;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::auth::provider::IdentityProvider;
use crate::config::Settings;
use crate::error::{Error, Result};

const SUCCESS_PAGE: &str = r#"<html>
    <body style="text-align: center; padding: 20px;">
        <h3>Authentication successful!</h3>
        <p>You can close this window now.</p>
    </body>
</html>
"#;

/// Authorization code captured from one browser redirect, together with the
/// redirect URI it was issued for. Consumed by exactly one code exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCodeExchange {
    pub code: Option<String>,
    pub redirect_uri: String,
}

/// Something that can show the user an authorization URL.
pub trait Browser: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl Browser for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        webbrowser::open(url)
    }
}

/// Single-shot loopback HTTP responder bound to the first free port of the
/// configured range.
#[derive(Debug)]
pub struct CallbackListener {
    listener: TcpListener,
    port: u16,
    redirect_uri: String,
}

impl CallbackListener {
    pub async fn bind(settings: &Settings) -> Result<Self> {
        let host = settings.redirect_host();
        let start = settings.ports.start;
        let end = settings
            .ports
            .end
            .map_or(start, |end| end.saturating_sub(1).max(start));

        for port in settings.ports.candidates() {
            match TcpListener::bind((host, port)).await {
                Ok(listener) => {
                    let redirect_uri = settings.redirect_uri_for(port);
                    info!("listening for the authorization redirect on {redirect_uri}");
                    return Ok(Self {
                        listener,
                        port,
                        redirect_uri,
                    });
                }
                Err(error) => {
                    debug!("port {port} on {host} unavailable: {error}");
                }
            }
        }

        Err(Error::NoAvailablePort { start, end })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Serves exactly one HTTP request and returns its `code` query
    /// parameter. Without a timeout this waits for as long as the user
    /// takes to finish signing in.
    pub async fn wait_for_code(self, timeout: Option<Duration>) -> Result<Option<String>> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.serve_once())
                .await
                .map_err(|_| Error::CallbackTimeout(limit.as_secs()))?,
            None => self.serve_once().await,
        }
    }

    async fn serve_once(self) -> Result<Option<String>> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            match respond(stream).await {
                Ok(Some(params)) => return Ok(params.code),
                // Browsers sometimes open a connection and close it unused.
                Ok(None) => debug!("connection from {peer} closed before sending a request"),
                Err(error) => warn!("dropping redirect connection from {peer}: {error}"),
            }
        }
    }
}

/// Reads one request from `stream` and answers it with the success page.
/// `None` when the peer closed without sending anything.
async fn respond(stream: TcpStream) -> std::io::Result<Option<CallbackParams>> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }

    loop {
        let mut header = String::new();
        let read = reader.read_line(&mut header).await?;
        if read == 0 || header.trim().is_empty() {
            break;
        }
    }

    let params = CallbackParams::from_request_line(&request_line);
    if let Some(error) = &params.error {
        warn!(
            "authorization redirect reported {error}: {}",
            params.error_description.as_deref().unwrap_or("-")
        );
    }

    let mut stream = reader.into_inner();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{SUCCESS_PAGE}",
        SUCCESS_PAGE.len()
    );
    stream.write_all(response.as_bytes()).await?;
    if let Err(error) = stream.shutdown().await {
        debug!("closing redirect connection: {error}");
    }

    Ok(Some(params))
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackParams {
    fn from_request_line(request_line: &str) -> Self {
        let Some(target) = request_line.split_whitespace().nth(1) else {
            return Self::default();
        };
        let Ok(url) = Url::parse("http://localhost").and_then(|base| base.join(target)) else {
            return Self::default();
        };

        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            match &*key {
                "code" if params.code.is_none() => params.code = Some(value.into_owned()),
                "error" => params.error = Some(value.into_owned()),
                "error_description" => params.error_description = Some(value.into_owned()),
                _ => {}
            }
        }
        params
    }
}

/// Runs the browser half of an interactive login: binds the loopback
/// listener, sends the user to the authorization URL and waits for the
/// redirect.
pub async fn capture_auth_code(
    settings: &Settings,
    provider: &dyn IdentityProvider,
    browser: &dyn Browser,
) -> Result<AuthCodeExchange> {
    let listener = CallbackListener::bind(settings).await?;
    let redirect_uri = listener.redirect_uri().to_string();
    let auth_url = provider.build_authorize_url(&settings.scopes, &redirect_uri)?;

    if let Err(error) = browser.open(&auth_url) {
        warn!("could not open a browser: {error}");
        eprintln!("Open this URL to sign in:\n{auth_url}");
    }

    let code = listener.wait_for_code(settings.callback_timeout).await?;
    Ok(AuthCodeExchange { code, redirect_uri })
}
