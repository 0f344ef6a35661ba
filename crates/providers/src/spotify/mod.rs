//! Cloud provider client for the Spotify Web API.

pub mod api;
pub mod artwork;
pub mod auth;

use crate::{MediaProvider, ProviderError, ProviderResult};
use api::WebApi;
use artwork::{ArtworkCache, ArtworkFetch, HttpArtworkFetcher};
use async_trait::async_trait;
use auth::TokenInfo;
use reqwest::Method;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use touchdeck_core::{MediaDevice, MediaState, SpotifyConfig};
use tracing::{debug, info, warn};

pub const PROVIDER_NAME: &str = "spotify";
pub const ACCOUNTS_BASE: &str = "https://accounts.spotify.com";
pub const API_BASE: &str = "https://api.spotify.com/v1";
const API_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotifySettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_port: u16,
    pub device_id: Option<String>,
    pub token_cache_path: PathBuf,
    pub accounts_base: String,
    pub api_base: String,
}

impl SpotifySettings {
    pub fn from_config(cfg: &SpotifyConfig, default_token_cache: PathBuf) -> Self {
        Self {
            client_id: cfg.client_id.trim().to_string(),
            client_secret: cfg.client_secret.trim().to_string(),
            redirect_port: cfg.redirect_port,
            device_id: cfg.device_id.clone().filter(|d| !d.trim().is_empty()),
            token_cache_path: cfg.token_cache_path.clone().unwrap_or(default_token_cache),
            accounts_base: ACCOUNTS_BASE.to_string(),
            api_base: API_BASE.to_string(),
        }
    }

    fn require_credentials(&self) -> ProviderResult<()> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(ProviderError::CredentialsMissing);
        }
        Ok(())
    }
}

struct Session {
    settings: SpotifySettings,
    token: Option<TokenInfo>,
    loaded: bool,
}

pub struct SpotifyProvider {
    http: reqwest::Client,
    api: WebApi,
    session: Mutex<Session>,
    artwork: ArtworkCache,
}

impl SpotifyProvider {
    pub fn new(settings: SpotifySettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .user_agent("touchdeck")
            .build()
            .unwrap_or_else(|err| {
                warn!(error = %err, "falling back to default http client");
                reqwest::Client::new()
            });
        let fetcher: Arc<dyn ArtworkFetch> = Arc::new(HttpArtworkFetcher::new(http.clone()));
        Self::with_parts(settings, http, fetcher)
    }

    pub fn with_parts(
        settings: SpotifySettings,
        http: reqwest::Client,
        artwork_fetcher: Arc<dyn ArtworkFetch>,
    ) -> Self {
        Self {
            api: WebApi::new(http.clone(), settings.api_base.clone()),
            http,
            session: Mutex::new(Session {
                settings,
                token: None,
                loaded: false,
            }),
            artwork: ArtworkCache::new(artwork_fetcher),
        }
    }

    /// Applies new settings. Drops the in-memory token and artwork so the
    /// next call starts from the (possibly different) token cache.
    pub async fn update_config(&self, settings: SpotifySettings) {
        let mut session = self.session.lock().await;
        if session.settings == settings {
            return;
        }
        session.settings = settings;
        session.token = None;
        session.loaded = false;
        drop(session);
        self.artwork.clear().await;
        info!("spotify provider reconfigured");
    }

    /// A usable access token plus the configured target device.
    async fn session_ctx(&self) -> ProviderResult<(String, Option<String>)> {
        let mut session = self.session.lock().await;
        session.settings.require_credentials()?;

        if !session.loaded {
            session.token = auth::load_token(&session.settings.token_cache_path).await;
            session.loaded = true;
        }

        let device = session.settings.device_id.clone();
        let cached = session.token.clone();
        match cached {
            Some(token) if !token.is_expired(auth::now_secs()) => Ok((token.access_token, device)),
            Some(TokenInfo {
                refresh_token: Some(refresh),
                ..
            }) => {
                debug!("refreshing expired spotify token");
                match auth::refresh_token(&self.http, &session.settings, &refresh).await {
                    Ok(fresh) => {
                        if let Err(err) =
                            auth::save_token(&session.settings.token_cache_path, &fresh).await
                        {
                            warn!(error = %err, "failed to persist refreshed spotify token");
                        }
                        let access = fresh.access_token.clone();
                        session.token = Some(fresh);
                        Ok((access, device))
                    }
                    Err(ProviderError::NotSignedIn) => {
                        session.token = None;
                        Err(ProviderError::NotSignedIn)
                    }
                    Err(err) => Err(err),
                }
            }
            _ => Err(ProviderError::NotSignedIn),
        }
    }

    async fn fetch_playing_art_url(&self, token: &str) -> Option<String> {
        let query = [("additional_types", "episode".to_string())];
        match self
            .api
            .get_optional::<api::CurrentlyPlaying>(token, "/me/player/currently-playing", &query)
            .await
        {
            Ok(Some(playing)) => playing.item.as_ref().and_then(api::extract_art_url),
            Ok(None) => None,
            Err(err) => {
                debug!(error = %err, "currently-playing lookup failed");
                None
            }
        }
    }

    async fn control(
        &self,
        method: Method,
        path: &str,
        extra: &[(&'static str, String)],
    ) -> ProviderResult<()> {
        let (token, device) = self.session_ctx().await?;
        let mut query = extra.to_vec();
        query.extend(api::device_query(device.as_deref()));
        self.api.send(method, &token, path, &query, None).await
    }
}

#[async_trait]
impl MediaProvider for SpotifyProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn ensure_ready(&self) -> ProviderResult<()> {
        self.session_ctx().await.map(|_| ())
    }

    async fn get_state(&self) -> ProviderResult<MediaState> {
        let (token, _) = self.session_ctx().await?;
        let query = [("additional_types", "episode".to_string())];
        let Some(playback) = self
            .api
            .get_optional::<api::Playback>(&token, "/me/player", &query)
            .await?
        else {
            return Ok(api::idle_state());
        };
        let Some(item) = playback.item.as_ref() else {
            return Ok(api::device_only_state(&playback));
        };

        let mut art_http = api::extract_art_url(item);
        if art_http.is_none() {
            art_http = self.fetch_playing_art_url(&token).await;
        }
        let art = match art_http {
            Some(url) => self.artwork.resolve(&url).await,
            None => None,
        };

        Ok(api::playback_to_state(&playback, item, art))
    }

    async fn play_pause(&self) -> ProviderResult<()> {
        let (token, _) = self.session_ctx().await?;
        let is_playing = self
            .api
            .get_optional::<api::Playback>(&token, "/me/player", &[])
            .await?
            .is_some_and(|p| p.is_playing);
        let path = if is_playing {
            "/me/player/pause"
        } else {
            "/me/player/play"
        };
        self.control(Method::PUT, path, &[]).await
    }

    async fn next(&self) -> ProviderResult<()> {
        self.control(Method::POST, "/me/player/next", &[]).await
    }

    async fn previous(&self) -> ProviderResult<()> {
        self.control(Method::POST, "/me/player/previous", &[]).await
    }

    async fn seek(&self, position_ms: u64) -> ProviderResult<()> {
        self.control(
            Method::PUT,
            "/me/player/seek",
            &[("position_ms", position_ms.to_string())],
        )
        .await
    }

    async fn set_volume(&self, percent: u8) -> ProviderResult<()> {
        self.control(
            Method::PUT,
            "/me/player/volume",
            &[("volume_percent", percent.min(100).to_string())],
        )
        .await
    }

    async fn list_devices(&self) -> ProviderResult<Vec<MediaDevice>> {
        let (token, _) = self.session_ctx().await?;
        let list = self
            .api
            .get_optional::<api::DeviceList>(&token, "/me/player/devices", &[])
            .await?;
        Ok(list.map(api::parse_devices).unwrap_or_default())
    }

    async fn transfer_playback(&self, device_id: &str, play: bool) -> ProviderResult<()> {
        let (token, _) = self.session_ctx().await?;
        let body = json!({ "device_ids": [device_id], "play": play });
        self.api
            .send(Method::PUT, &token, "/me/player", &[], Some(body))
            .await?;
        self.session.lock().await.settings.device_id = Some(device_id.to_string());
        Ok(())
    }

    /// Runs the authorization-code flow through a loopback redirect.
    async fn authenticate(&self) -> ProviderResult<()> {
        let settings = self.session.lock().await.settings.clone();
        settings.require_credentials()?;

        let state = auth::oauth_state();
        let url = auth::authorize_url(&settings, &state)?;
        let listener = auth::CallbackListener::bind(settings.redirect_port).await?;
        auth::open_in_browser(&url);

        let callback = listener.wait(auth::AUTH_TIMEOUT).await?;
        if let Some(err) = callback.error.as_deref() {
            info!(error = %err, "spotify sign-in declined");
            return Err(ProviderError::SignInCanceled);
        }
        if callback.state.as_deref() != Some(state.as_str()) {
            warn!("spotify sign-in state mismatch");
            return Err(ProviderError::SignInCanceled);
        }
        let Some(code) = callback.code.filter(|c| !c.is_empty()) else {
            return Err(ProviderError::SignInCanceled);
        };

        let token = auth::exchange_code(&self.http, &settings, &code).await?;
        if let Err(err) = auth::save_token(&settings.token_cache_path, &token).await {
            warn!(error = %err, "failed to persist spotify token");
        }

        let mut session = self.session.lock().await;
        session.token = Some(token);
        session.loaded = true;
        info!("spotify sign-in complete");
        Ok(())
    }
}
