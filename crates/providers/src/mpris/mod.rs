//! Remote player client for the MPRIS "now playing" protocol.
//!
//! The wire itself sits behind [`PlayerBus`]; this module owns player
//! selection and the mapping to [`MediaState`]. Every bus failure on the
//! read path collapses into the idle state.

use crate::{MediaProvider, ProviderError, ProviderResult};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use touchdeck_core::{MediaState, PlaybackStatus};
use tracing::{debug, trace};

#[cfg(target_os = "linux")]
pub mod dbus;

pub const PROVIDER_NAME: &str = "mpris";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("player vanished: {0}")]
    PlayerGone(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub art_url: Option<String>,
    pub track_id: Option<String>,
    pub length_us: Option<i64>,
}

/// Everything read from one player in a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerReading {
    pub status: String,
    pub metadata: TrackMetadata,
    pub position_us: i64,
    pub can_seek: bool,
}

#[async_trait]
pub trait PlayerBus: Send + Sync {
    /// Bus names in the `org.mpris.MediaPlayer2.` namespace.
    async fn list_players(&self) -> Result<Vec<String>, BusError>;
    async fn playback_status(&self, player: &str) -> Result<String, BusError>;
    async fn read_player(&self, player: &str) -> Result<PlayerReading, BusError>;
    async fn play_pause(&self, player: &str) -> Result<(), BusError>;
    async fn next(&self, player: &str) -> Result<(), BusError>;
    async fn previous(&self, player: &str) -> Result<(), BusError>;
    async fn set_position(
        &self,
        player: &str,
        track_ref: &str,
        position_ms: u64,
    ) -> Result<(), BusError>;
}

pub struct MprisProvider<B> {
    bus: B,
    preferred: Mutex<Option<String>>,
}

impl<B: PlayerBus> MprisProvider<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            preferred: Mutex::new(None),
        }
    }

    /// Best-effort snapshot of the selected player.
    pub async fn now_playing(&self) -> MediaState {
        let mut preferred = self.preferred.lock().await;
        match self.read_state(&mut preferred).await {
            Ok(state) => state,
            Err(err) => {
                debug!(error = %err, "mpris read failed; reporting idle");
                MediaState::idle(PROVIDER_NAME)
            }
        }
    }

    async fn read_state(&self, preferred: &mut Option<String>) -> Result<MediaState, BusError> {
        let players = self.bus.list_players().await?;
        let Some(name) = self.pick_player(&players, preferred).await else {
            return Ok(MediaState::idle(PROVIDER_NAME));
        };

        let reading = self.bus.read_player(&name).await?;
        Ok(state_from_reading(name, reading))
    }

    /// Keeps the previous choice while it is still on the bus, otherwise
    /// prefers a playing player, otherwise the first one listed.
    async fn pick_player(&self, names: &[String], preferred: &mut Option<String>) -> Option<String> {
        let first = names.first()?;
        if let Some(current) = preferred.as_ref() {
            if names.contains(current) {
                return Some(current.clone());
            }
        }

        for name in names {
            match self.bus.playback_status(name).await {
                Ok(status) if status == "Playing" => {
                    *preferred = Some(name.clone());
                    return Some(name.clone());
                }
                Ok(_) => {}
                Err(err) => trace!(player = %name, error = %err, "skipping player during selection"),
            }
        }

        *preferred = Some(first.clone());
        Some(first.clone())
    }
}

fn state_from_reading(bus_name: String, reading: PlayerReading) -> MediaState {
    let status = PlaybackStatus::from_label(&reading.status);
    let meta = reading.metadata;
    let non_empty = |s: Option<String>| s.filter(|v| !v.is_empty());

    MediaState {
        source: PROVIDER_NAME.to_string(),
        title: non_empty(meta.title).unwrap_or_else(|| "Unknown Title".to_string()),
        artist: non_empty(meta.artist).unwrap_or_else(|| "Unknown Artist".to_string()),
        album: meta.album.unwrap_or_default(),
        art_url: non_empty(meta.art_url),
        is_playing: status == PlaybackStatus::Playing,
        progress_ms: us_to_ms(reading.position_us),
        duration_ms: us_to_ms(meta.length_us.unwrap_or(0)),
        device_name: String::new(),
        volume_percent: None,
        can_seek: reading.can_seek,
        can_control: true,
        track_id: non_empty(meta.track_id),
        bus_name: Some(bus_name),
        status,
        message: None,
    }
}

/// Floor division; negative positions clamp to zero.
fn us_to_ms(us: i64) -> u64 {
    u64::try_from(us).unwrap_or(0) / 1_000
}

fn control_error(err: BusError) -> ProviderError {
    ProviderError::Provider(format!("Media player did not respond: {err}"))
}

#[async_trait]
impl<B: PlayerBus> MediaProvider for MprisProvider<B> {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn get_state(&self) -> ProviderResult<MediaState> {
        Ok(self.now_playing().await)
    }

    async fn play_pause(&self) -> ProviderResult<()> {
        let state = self.now_playing().await;
        if let Some(bus_name) = state.bus_name {
            self.bus.play_pause(&bus_name).await.map_err(control_error)?;
        }
        Ok(())
    }

    async fn next(&self) -> ProviderResult<()> {
        let state = self.now_playing().await;
        if let Some(bus_name) = state.bus_name {
            self.bus.next(&bus_name).await.map_err(control_error)?;
        }
        Ok(())
    }

    async fn previous(&self) -> ProviderResult<()> {
        let state = self.now_playing().await;
        if let Some(bus_name) = state.bus_name {
            self.bus.previous(&bus_name).await.map_err(control_error)?;
        }
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> ProviderResult<()> {
        let state = self.now_playing().await;
        if let (Some(bus_name), Some(track_id), true) =
            (state.bus_name, state.track_id, state.can_seek)
        {
            self.bus
                .set_position(&bus_name, &track_id, position_ms)
                .await
                .map_err(control_error)?;
        }
        Ok(())
    }

    async fn set_volume(&self, _percent: u8) -> ProviderResult<()> {
        // Volume is not standardised across MPRIS players.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BusError, MprisProvider, PlayerBus, PlayerReading, TrackMetadata};
    use crate::MediaProvider;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use touchdeck_core::PlaybackStatus;

    #[derive(Default)]
    struct FakeBus {
        players: Mutex<Vec<String>>,
        statuses: Mutex<HashMap<String, String>>,
        vanished: Mutex<bool>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeBus {
        fn with(players: &[(&str, &str)]) -> Self {
            let bus = Self::default();
            bus.set(players);
            bus
        }

        fn set(&self, players: &[(&str, &str)]) {
            let mut names = self.players.lock().unwrap();
            let mut statuses = self.statuses.lock().unwrap();
            names.clear();
            statuses.clear();
            for (name, status) in players {
                names.push(name.to_string());
                statuses.insert(name.to_string(), status.to_string());
            }
        }

        fn status(&self, player: &str) -> Result<String, BusError> {
            self.statuses
                .lock()
                .unwrap()
                .get(player)
                .cloned()
                .ok_or_else(|| BusError::PlayerGone(player.to_string()))
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl PlayerBus for FakeBus {
        async fn list_players(&self) -> Result<Vec<String>, BusError> {
            Ok(self.players.lock().unwrap().clone())
        }

        async fn playback_status(&self, player: &str) -> Result<String, BusError> {
            self.status(player)
        }

        async fn read_player(&self, player: &str) -> Result<PlayerReading, BusError> {
            if *self.vanished.lock().unwrap() {
                return Err(BusError::PlayerGone(player.to_string()));
            }
            Ok(PlayerReading {
                status: self.status(player)?,
                metadata: TrackMetadata {
                    title: Some(format!("{player} song")),
                    artist: Some("Artist".to_string()),
                    album: None,
                    art_url: None,
                    track_id: Some("/org/mpris/MediaPlayer2/Track/1".to_string()),
                    length_us: Some(180_999_999),
                },
                position_us: 1_999_999,
                can_seek: true,
            })
        }

        async fn play_pause(&self, player: &str) -> Result<(), BusError> {
            self.record(format!("PlayPause {player}"));
            Ok(())
        }

        async fn next(&self, player: &str) -> Result<(), BusError> {
            self.record(format!("Next {player}"));
            Ok(())
        }

        async fn previous(&self, player: &str) -> Result<(), BusError> {
            self.record(format!("Previous {player}"));
            Ok(())
        }

        async fn set_position(
            &self,
            player: &str,
            track_ref: &str,
            position_ms: u64,
        ) -> Result<(), BusError> {
            self.record(format!("SetPosition {player} {track_ref} {position_ms}"));
            Ok(())
        }
    }

    const A: &str = "org.mpris.MediaPlayer2.a";
    const B: &str = "org.mpris.MediaPlayer2.b";

    #[tokio::test]
    async fn prefers_playing_player_then_sticks_to_it() {
        let provider = MprisProvider::new(FakeBus::with(&[(A, "Paused"), (B, "Playing")]));

        let first = provider.now_playing().await;
        assert_eq!(first.bus_name.as_deref(), Some(B));
        assert_eq!(first.status, PlaybackStatus::Playing);

        provider.bus.set(&[(A, "Paused"), (B, "Paused")]);
        let second = provider.now_playing().await;
        assert_eq!(second.bus_name.as_deref(), Some(B));
        assert!(!second.is_playing);
    }

    #[tokio::test]
    async fn falls_back_to_first_player() {
        let provider = MprisProvider::new(FakeBus::with(&[(A, "Stopped"), (B, "Paused")]));
        assert_eq!(provider.now_playing().await.bus_name.as_deref(), Some(A));
    }

    #[tokio::test]
    async fn reselects_when_preferred_player_disappears() {
        let provider = MprisProvider::new(FakeBus::with(&[(A, "Playing")]));
        assert_eq!(provider.now_playing().await.bus_name.as_deref(), Some(A));

        provider.bus.set(&[(B, "Paused")]);
        assert_eq!(provider.now_playing().await.bus_name.as_deref(), Some(B));
    }

    #[tokio::test]
    async fn truncates_microseconds_to_milliseconds() {
        let provider = MprisProvider::new(FakeBus::with(&[(A, "Playing")]));
        let state = provider.now_playing().await;
        assert_eq!(state.progress_ms, 1_999);
        assert_eq!(state.duration_ms, 180_999);
        assert_eq!(state.title, "org.mpris.MediaPlayer2.a song");
    }

    #[tokio::test]
    async fn vanished_player_maps_to_idle() {
        let provider = MprisProvider::new(FakeBus::with(&[(A, "Playing")]));
        *provider.bus.vanished.lock().unwrap() = true;
        let state = provider.now_playing().await;
        assert!(state.is_idle());
        assert!(!state.can_control);
        assert_eq!(state.title, "Nothing Playing");
    }

    #[tokio::test]
    async fn no_players_is_idle_and_controls_are_noops() {
        let provider = MprisProvider::new(FakeBus::default());
        assert!(provider.now_playing().await.is_idle());
        assert!(provider.play_pause().await.is_ok());
        assert!(provider.bus.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn seek_sends_track_ref_to_selected_player() {
        let provider = MprisProvider::new(FakeBus::with(&[(A, "Playing")]));
        assert!(provider.seek(42_000).await.is_ok());
        let calls = provider.bus.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![format!("SetPosition {A} /org/mpris/MediaPlayer2/Track/1 42000")]
        );
    }
}
