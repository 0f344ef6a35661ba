//! Thin Spotify Web API layer: request plumbing, error translation and the
//! mapping of playback payloads onto [`MediaState`].

use crate::{ProviderError, ProviderResult};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use touchdeck_core::{MediaDevice, MediaState, PlaybackStatus, IDLE_TITLE};
use tracing::debug;

use super::PROVIDER_NAME;

pub struct WebApi {
    http: reqwest::Client,
    base: String,
}

impl WebApi {
    pub fn new(http: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }

    fn request(
        &self,
        method: Method,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base))
            .bearer_auth(token)
            .query(query)
    }

    /// GET returning `None` for "204 No Content" (nothing playing).
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> ProviderResult<Option<T>> {
        let resp = self
            .request(Method::GET, token, path, query)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = resp.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(translate_error(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| ProviderError::Provider(format!("Unexpected Spotify response: {e}")))
    }

    pub async fn send(
        &self,
        method: Method,
        token: &str,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> ProviderResult<()> {
        let mut req = self.request(method, token, path, query);
        req = match body {
            Some(body) => req.json(&body),
            // Spotify rejects bodiless PUT/POST without a length header.
            None => req.header(reqwest::header::CONTENT_LENGTH, "0"),
        };
        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(translate_error(status, &body))
    }
}

pub fn device_query(device_id: Option<&str>) -> Vec<(&'static str, String)> {
    device_id
        .map(|id| vec![("device_id", id.to_string())])
        .unwrap_or_default()
}

/// `/me/player` payload.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Playback {
    pub is_playing: bool,
    pub progress_ms: Option<u64>,
    pub device: Option<Device>,
    pub item: Option<Item>,
}

/// `/me/player/currently-playing` payload.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CurrentlyPlaying {
    pub item: Option<Item>,
}

/// A track or an episode.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Item {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub id: Option<String>,
    pub uri: Option<String>,
    pub name: Option<String>,
    pub duration_ms: Option<u64>,
    pub is_local: Option<bool>,
    pub artists: Option<Vec<Artist>>,
    pub album: Option<Collection>,
    pub show: Option<Collection>,
    pub images: Option<Vec<Image>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Artist {
    pub name: Option<String>,
}

/// Album of a track or show of an episode.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Collection {
    pub name: Option<String>,
    pub images: Option<Vec<Image>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Image {
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Device {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub is_active: Option<bool>,
    pub volume_percent: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeviceList {
    pub devices: Option<Vec<Device>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    error: Option<ErrorField>,
}

/// Web API errors are objects; accounts errors are bare strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorField {
    Detail {
        message: Option<String>,
        reason: Option<String>,
    },
    Text(String),
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    debug!(error = %err, "spotify transport failure");
    if err.is_timeout() {
        ProviderError::Provider("Spotify did not respond in time".to_string())
    } else {
        ProviderError::Provider("Could not reach Spotify".to_string())
    }
}

/// Maps an API failure onto the provider error taxonomy.
pub fn translate_error(status: StatusCode, body: &str) -> ProviderError {
    let error = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error);
    let (message, reason) = match error {
        Some(ErrorField::Detail { message, reason }) => (message, reason),
        Some(ErrorField::Text(text)) => (Some(text), None),
        None => (None, None),
    };
    let message = message.unwrap_or_else(|| format!("Spotify error ({status})"));
    let reason = reason.unwrap_or_default();
    let haystack = format!("{message} {reason}").to_uppercase().replace('_', " ");

    if status == StatusCode::FORBIDDEN && haystack.contains("PREMIUM") {
        return ProviderError::PremiumRequired;
    }
    if status == StatusCode::NOT_FOUND && haystack.contains("NO ACTIVE DEVICE") {
        return ProviderError::NoActiveDevice;
    }
    ProviderError::Provider(message)
}

fn first_image_url(images: Option<&[Image]>) -> Option<String> {
    images?
        .first()?
        .url
        .as_deref()
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

fn images_of(collection: Option<&Collection>) -> Option<&[Image]> {
    collection?.images.as_deref()
}

/// Best artwork URL for a track or an episode. Tracks keep artwork on the
/// album, episodes on the item or on their show.
pub fn extract_art_url(item: &Item) -> Option<String> {
    if item.is_local == Some(true) {
        return None;
    }

    match item.kind.as_deref() {
        Some("track") => first_image_url(images_of(item.album.as_ref())),
        Some("episode") => first_image_url(item.images.as_deref())
            .or_else(|| first_image_url(images_of(item.show.as_ref()))),
        _ => first_image_url(images_of(item.album.as_ref()))
            .or_else(|| first_image_url(item.images.as_deref())),
    }
}

pub fn idle_state() -> MediaState {
    MediaState::idle(PROVIDER_NAME)
}

fn clamp_volume(volume: Option<u64>) -> Option<u8> {
    volume.map(|v| v.min(100) as u8)
}

/// Playback with no item: keep the device so the deck still shows where
/// Spotify is connected, but report nothing as playing.
pub fn device_only_state(playback: &Playback) -> MediaState {
    let device = playback.device.as_ref();
    MediaState {
        device_name: device.and_then(|d| d.name.clone()).unwrap_or_default(),
        volume_percent: clamp_volume(device.and_then(|d| d.volume_percent)),
        can_control: true,
        ..idle_state()
    }
}

/// Builds the snapshot for a `/me/player` payload whose item is present.
/// `art_url` is whatever the artwork cache produced for the item.
pub fn playback_to_state(playback: &Playback, item: &Item, art_url: Option<String>) -> MediaState {
    let device = playback.device.as_ref();

    let artist = item
        .artists
        .iter()
        .flatten()
        .filter_map(|a| a.name.as_deref())
        .collect::<Vec<_>>()
        .join(", ");

    let album = match item.kind.as_deref() {
        Some("track") => item.album.as_ref(),
        Some("episode") => item.show.as_ref(),
        _ => None,
    }
    .and_then(|c| c.name.clone())
    .unwrap_or_default();

    MediaState {
        source: PROVIDER_NAME.to_string(),
        title: item
            .name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(IDLE_TITLE)
            .to_string(),
        artist,
        album,
        art_url,
        is_playing: playback.is_playing,
        progress_ms: playback.progress_ms.unwrap_or(0),
        duration_ms: item.duration_ms.unwrap_or(0),
        device_name: device.and_then(|d| d.name.clone()).unwrap_or_default(),
        volume_percent: clamp_volume(device.and_then(|d| d.volume_percent)),
        can_seek: true,
        can_control: true,
        track_id: item.id.clone().or_else(|| item.uri.clone()),
        bus_name: None,
        status: if playback.is_playing {
            PlaybackStatus::Playing
        } else {
            PlaybackStatus::Paused
        },
        message: None,
    }
}

/// Devices without an id or a name cannot be targeted and are skipped.
pub fn parse_devices(list: DeviceList) -> Vec<MediaDevice> {
    list.devices
        .unwrap_or_default()
        .into_iter()
        .filter_map(|d| {
            let id = d.id.filter(|s| !s.is_empty())?;
            let name = d.name.filter(|s| !s.is_empty())?;
            Some(MediaDevice {
                id,
                name,
                device_type: d.kind.unwrap_or_default(),
                is_active: d.is_active.unwrap_or(false),
                volume_percent: clamp_volume(d.volume_percent),
            })
        })
        .collect()
}
