use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use touchdeck_core::{DeckConfig, MediaState, PlaybackStatus};
use touchdeck_lyrics::{LyricsEvent, LyricsResolver, LyricsStatus};
use touchdeck_providers::MediaManager;
use tracing::{debug, info};

pub const LYRICS_NOT_FOUND_NOTICE: &str = "Could not find lyrics";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiffKind {
    TrackChanged,
    StateChanged,
    Nothing,
}

/// What the shell renders after one poll.
#[derive(Debug, Clone, Serialize)]
pub struct DeckFrame {
    pub state: MediaState,
    pub diff: DiffKind,
    /// Active lyric line, or the not-found notice while it is showing.
    pub lyric_line: String,
    pub notice_active: bool,
    #[serde(skip)]
    pub lyrics: LyricsStatus,
    #[serde(skip)]
    pub next_poll_in: Duration,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub playing_poll: Duration,
    pub paused_poll: Duration,
    pub idle_poll: Duration,
    pub not_found_notice: Duration,
    pub lyrics_enabled: bool,
}

impl EngineConfig {
    pub fn from_deck_config(cfg: &DeckConfig) -> Self {
        Self {
            playing_poll: Duration::from_millis(cfg.intervals.playing_poll_ms),
            paused_poll: Duration::from_millis(cfg.intervals.paused_poll_ms),
            idle_poll: Duration::from_millis(cfg.intervals.idle_poll_ms),
            not_found_notice: Duration::from_millis(cfg.lyrics.not_found_notice_ms),
            lyrics_enabled: cfg.lyrics.enabled,
        }
    }
}

/// Poll coordinator: reads the façade, diffs snapshots, drives the lyrics
/// resolver and decides when to poll next.
pub struct DeckEngine {
    cfg: EngineConfig,
    manager: Arc<MediaManager>,
    lyrics: LyricsResolver,
    last_state: Option<MediaState>,
    notice_until: Option<Instant>,
}

impl DeckEngine {
    pub fn new(cfg: EngineConfig, manager: Arc<MediaManager>, mut lyrics: LyricsResolver) -> Self {
        lyrics.set_enabled(cfg.lyrics_enabled);
        Self {
            cfg,
            manager,
            lyrics,
            last_state: None,
            notice_until: None,
        }
    }

    pub fn update_config(&mut self, cfg: EngineConfig) {
        self.lyrics.set_enabled(cfg.lyrics_enabled);
        self.cfg = cfg;
    }

    pub fn manager(&self) -> &Arc<MediaManager> {
        &self.manager
    }

    pub fn lyrics(&self) -> &LyricsResolver {
        &self.lyrics
    }

    pub fn lyrics_mut(&mut self) -> &mut LyricsResolver {
        &mut self.lyrics
    }

    pub fn last_state(&self) -> Option<&MediaState> {
        self.last_state.as_ref()
    }

    pub async fn tick(&mut self, now: Instant) -> DeckFrame {
        let state = self.manager.get_state().await;
        self.process(state, now)
    }

    /// Waits for a pending lyrics lookup and rebuilds the frame for the last
    /// snapshot.
    pub async fn settle_lyrics(&mut self) -> Option<DeckFrame> {
        let event = self.lyrics.settle().await;
        self.apply_lyrics_event(event, Instant::now());
        let state = self.last_state.clone()?;
        Some(self.frame(state, DiffKind::Nothing, Instant::now()))
    }

    pub fn process(&mut self, state: MediaState, now: Instant) -> DeckFrame {
        let diff = compute_diff(self.last_state.as_ref(), &state);
        self.log_transition(&state, diff);

        if diff == DiffKind::TrackChanged {
            self.notice_until = None;
        }
        let event = self.lyrics.observe(&state);
        self.apply_lyrics_event(event, now);

        self.last_state = Some(state.clone());
        self.frame(state, diff, now)
    }

    fn apply_lyrics_event(&mut self, event: Option<LyricsEvent>, now: Instant) {
        if event == Some(LyricsEvent::NotFound) {
            self.notice_until = Some(now + self.cfg.not_found_notice);
        }
    }

    fn frame(&mut self, state: MediaState, diff: DiffKind, now: Instant) -> DeckFrame {
        let notice_active = match self.notice_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.notice_until = None;
                false
            }
            None => false,
        };
        let lyric_line = if notice_active {
            LYRICS_NOT_FOUND_NOTICE.to_string()
        } else {
            self.lyrics.active_line(state.progress_ms).to_string()
        };

        DeckFrame {
            next_poll_in: self.next_poll(state.status),
            lyrics: self.lyrics.status(),
            state,
            diff,
            lyric_line,
            notice_active,
        }
    }

    fn log_transition(&self, state: &MediaState, diff: DiffKind) {
        let prev = self.last_state.as_ref();
        if prev.map(|p| p.source.as_str()) != Some(state.source.as_str()) {
            info!(provider = %state.source, "media provider active");
        }
        if prev.and_then(|p| p.art_url.as_ref()) != state.art_url.as_ref() {
            debug!(has_art = state.art_url.is_some(), "artwork changed");
        }
        match diff {
            DiffKind::TrackChanged => {
                info!(title = %state.title, artist = %state.artist, status = %state.status, "track changed")
            }
            DiffKind::StateChanged => debug!(status = %state.status, "playback state changed"),
            DiffKind::Nothing => {}
        }
    }

    fn next_poll(&self, status: PlaybackStatus) -> Duration {
        match status {
            PlaybackStatus::Playing => self.cfg.playing_poll,
            PlaybackStatus::Paused => self.cfg.paused_poll,
            PlaybackStatus::Stopped | PlaybackStatus::Error => self.cfg.idle_poll,
        }
    }
}

fn same_track(a: &MediaState, b: &MediaState) -> bool {
    a.source == b.source
        && a.track_id == b.track_id
        && a.title == b.title
        && a.artist == b.artist
        && a.album == b.album
}

fn compute_diff(prev: Option<&MediaState>, curr: &MediaState) -> DiffKind {
    match prev {
        None if curr.is_idle() => DiffKind::Nothing,
        None => DiffKind::TrackChanged,
        Some(prev) if !same_track(prev, curr) => DiffKind::TrackChanged,
        Some(prev)
            if prev.status != curr.status
                || prev.is_playing != curr.is_playing
                || prev.message != curr.message =>
        {
            DiffKind::StateChanged
        }
        Some(_) => DiffKind::Nothing,
    }
}
