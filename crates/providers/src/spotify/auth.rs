//! OAuth authorization-code flow: authorization URL, loopback redirect
//! capture, code exchange, refresh and the on-disk token cache.

use super::SpotifySettings;
use crate::{ProviderError, ProviderResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const AUTH_SCOPE: &str =
    "user-read-playback-state user-read-currently-playing user-modify-playback-state";
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(120);

/// Tokens are treated as expired this long before the server says so.
const EXPIRY_MARGIN_SECS: u64 = 60;
const MAX_REQUEST_HEAD: usize = 8 * 1024;
const CALLBACK_PAGE: &str = "Spotify sign-in complete. You can close this window.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: String,
    pub expires_at: u64,
}

impl TokenInfo {
    pub fn is_expired(&self, now_secs: u64) -> bool {
        self.expires_at <= now_secs.saturating_add(EXPIRY_MARGIN_SECS)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    scope: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self, now_secs: u64, previous_refresh: Option<String>) -> TokenInfo {
        TokenInfo {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token: self.refresh_token.or(previous_refresh),
            scope: self.scope,
            expires_at: now_secs.saturating_add(self.expires_in),
        }
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Random 128-bit value echoed back by the redirect.
pub fn oauth_state() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn redirect_uri(port: u16) -> String {
    format!("http://127.0.0.1:{port}/callback")
}

pub fn authorize_url(settings: &SpotifySettings, state: &str) -> ProviderResult<Url> {
    let base = format!("{}/authorize", settings.accounts_base);
    Url::parse_with_params(
        &base,
        &[
            ("client_id", settings.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", redirect_uri(settings.redirect_port).as_str()),
            ("scope", AUTH_SCOPE),
            ("state", state),
            ("show_dialog", "false"),
        ],
    )
    .map_err(|e| ProviderError::Provider(format!("invalid Spotify accounts URL: {e}")))
}

pub async fn load_token(path: &Path) -> Option<TokenInfo> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "no cached spotify token");
            return None;
        }
    };
    match serde_json::from_slice(&data) {
        Ok(token) => Some(token),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable spotify token cache");
            None
        }
    }
}

pub async fn save_token(path: &Path, token: &TokenInfo) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(token).map_err(std::io::Error::other)?;
    tokio::fs::write(path, data).await
}

pub async fn exchange_code(
    http: &reqwest::Client,
    settings: &SpotifySettings,
    code: &str,
) -> ProviderResult<TokenInfo> {
    let redirect = redirect_uri(settings.redirect_port);
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect.as_str()),
    ];
    let resp = token_request(http, settings, &form)
        .await
        .map_err(|e| ProviderError::Provider(format!("Spotify sign-in failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        warn!(%status, %body, "spotify rejected authorization code");
        return Err(ProviderError::Provider(format!(
            "Spotify sign-in failed ({status})"
        )));
    }
    let parsed: TokenResponse = resp
        .json()
        .await
        .map_err(|e| ProviderError::Provider(format!("Spotify sign-in failed: {e}")))?;
    Ok(parsed.into_token(now_secs(), None))
}

/// A rejected refresh means the grant is gone and the user has to sign in
/// again; a transport failure is reported as such.
pub async fn refresh_token(
    http: &reqwest::Client,
    settings: &SpotifySettings,
    refresh: &str,
) -> ProviderResult<TokenInfo> {
    let form = [("grant_type", "refresh_token"), ("refresh_token", refresh)];
    let resp = token_request(http, settings, &form)
        .await
        .map_err(|e| ProviderError::TokenRefresh(e.to_string()))?;
    let status = resp.status();
    if status.is_client_error() {
        warn!(%status, "spotify refused token refresh");
        return Err(ProviderError::NotSignedIn);
    }
    if !status.is_success() {
        return Err(ProviderError::TokenRefresh(format!("status {status}")));
    }
    let parsed: TokenResponse = resp
        .json()
        .await
        .map_err(|e| ProviderError::TokenRefresh(e.to_string()))?;
    Ok(parsed.into_token(now_secs(), Some(refresh.to_string())))
}

async fn token_request(
    http: &reqwest::Client,
    settings: &SpotifySettings,
    form: &[(&str, &str)],
) -> reqwest::Result<reqwest::Response> {
    http.post(format!("{}/api/token", settings.accounts_base))
        .basic_auth(&settings.client_id, Some(&settings.client_secret))
        .form(form)
        .send()
        .await
}

/// Hands the authorization URL to the desktop's URL opener. Failing to
/// launch one is not fatal: the URL is logged for manual use.
pub fn open_in_browser(url: &Url) {
    info!(url = %url, "open this URL to sign in to Spotify");

    #[cfg(target_os = "linux")]
    let mut cmd = std::process::Command::new("xdg-open");
    #[cfg(target_os = "macos")]
    let mut cmd = std::process::Command::new("open");
    #[cfg(target_os = "windows")]
    let mut cmd = {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", ""]);
        c
    };

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    {
        cmd.arg(url.as_str())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        if let Err(err) = cmd.spawn() {
            warn!(error = %err, "could not launch a browser");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Short-lived loopback HTTP listener that captures one OAuth redirect.
pub struct CallbackListener {
    listener: TcpListener,
}

impl CallbackListener {
    pub async fn bind(port: u16) -> ProviderResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| ProviderError::AuthServer(e.to_string()))?;
        Ok(Self { listener })
    }

    pub fn port(&self) -> Option<u16> {
        self.listener.local_addr().ok().map(|a| a.port())
    }

    /// Waits for a request on `/callback`, answers it and shuts down.
    pub async fn wait(self, timeout: Duration) -> ProviderResult<CallbackParams> {
        match tokio::time::timeout(timeout, self.accept_callback()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::SignInTimedOut),
        }
    }

    async fn accept_callback(&self) -> ProviderResult<CallbackParams> {
        loop {
            let (mut stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| ProviderError::AuthServer(e.to_string()))?;
            let head = match read_request_head(&mut stream).await {
                Ok(head) => head,
                Err(err) => {
                    debug!(%peer, error = %err, "dropping unreadable callback request");
                    continue;
                }
            };

            match parse_callback(&head) {
                Some(params) => {
                    respond(&mut stream, "200 OK", CALLBACK_PAGE).await;
                    return Ok(params);
                }
                None => respond(&mut stream, "404 Not Found", "Not found").await,
            }
        }
    }
}

async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_REQUEST_HEAD {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(err) = stream.write_all(response.as_bytes()).await {
        debug!(error = %err, "failed to answer callback request");
    }
    let _ = stream.shutdown().await;
}

/// Extracts the query of a `GET /callback?...` request line.
pub fn parse_callback(head: &str) -> Option<CallbackParams> {
    let request_line = head.lines().next()?;
    let mut parts = request_line.split_whitespace();
    if parts.next()? != "GET" {
        return None;
    }
    let target = parts.next()?;
    let url = Url::parse("http://127.0.0.1").ok()?.join(target).ok()?;
    if url.path() != "/callback" {
        return None;
    }

    let mut params = CallbackParams::default();
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => params.code = Some(value.into_owned()),
            "state" => params.state = Some(value.into_owned()),
            "error" => params.error = Some(value.into_owned()),
            _ => {}
        }
    }
    Some(params)
}
