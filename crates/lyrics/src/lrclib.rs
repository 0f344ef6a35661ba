use crate::lrc::parse_lrc;
use crate::query::LyricsQuery;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use touchdeck_core::SyncedLyrics;
use tracing::{debug, warn};

pub const USER_AGENT: &str = concat!("touchdeck-lyrics/", env!("CARGO_PKG_VERSION"));
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LyricsFetchError {
    #[error("lyrics not found")]
    NotFound,
    #[error("lyrics lookup failed: {0}")]
    Other(String),
}

/// One lookup against a lyrics backend. `Ok(None)` means the backend knows
/// the track but has no synced lyrics for it.
#[async_trait]
pub trait LyricsSource: Send + Sync {
    async fn fetch(&self, query: &LyricsQuery) -> Result<Option<SyncedLyrics>, LyricsFetchError>;
}

#[derive(Debug, Deserialize)]
struct LrclibRecord {
    #[serde(rename = "syncedLyrics", default)]
    synced_lyrics: Option<String>,
}

pub struct LrclibClient {
    http: reqwest::Client,
    api_url: String,
}

impl LrclibClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|err| {
                warn!(error = %err, "falling back to default http client");
                reqwest::Client::new()
            });
        Self {
            http,
            api_url: api_url.into(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

#[async_trait]
impl LyricsSource for LrclibClient {
    async fn fetch(&self, query: &LyricsQuery) -> Result<Option<SyncedLyrics>, LyricsFetchError> {
        let duration = query.duration_s.to_string();
        let resp = self
            .http
            .get(&self.api_url)
            .query(&[
                ("artist_name", query.artist.as_str()),
                ("track_name", query.track.as_str()),
                ("album_name", query.album.as_str()),
                ("duration", duration.as_str()),
            ])
            .send()
            .await
            .map_err(|e| LyricsFetchError::Other(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(track = %query.track, artist = %query.artist, "lrclib: not found");
            return Err(LyricsFetchError::NotFound);
        }
        if !status.is_success() {
            return Err(LyricsFetchError::Other(format!("HTTP {status}")));
        }

        let record: LrclibRecord = resp
            .json()
            .await
            .map_err(|e| LyricsFetchError::Other(format!("malformed response: {e}")))?;

        Ok(record
            .synced_lyrics
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| parse_lrc(&s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tolerates_missing_synced_field() {
        let rec: LrclibRecord =
            serde_json::from_str(r#"{"id":1,"plainLyrics":"words"}"#).unwrap();
        assert!(rec.synced_lyrics.is_none());

        let rec: LrclibRecord =
            serde_json::from_str(r#"{"syncedLyrics":"[00:01.00]hi"}"#).unwrap();
        assert_eq!(rec.synced_lyrics.as_deref(), Some("[00:01.00]hi"));
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_plain_failure() {
        let client = LrclibClient::new("http://127.0.0.1:9/api/get");
        let query = LyricsQuery {
            track: "Song".into(),
            artist: "A".into(),
            album: String::new(),
            duration_s: 200,
        };
        assert!(matches!(
            client.fetch(&query).await,
            Err(LyricsFetchError::Other(_))
        ));
    }
}
