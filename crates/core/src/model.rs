use serde::{Deserialize, Serialize};
use std::fmt;

pub const IDLE_TITLE: &str = "Nothing Playing";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    Playing,
    Paused,
    #[default]
    Stopped,
    Error,
}

impl PlaybackStatus {
    /// Maps the status strings players report (`Playing`, `Paused`, `Stopped`).
    /// Anything unrecognised is treated as stopped.
    pub fn from_label(label: &str) -> Self {
        match label {
            "Playing" => Self::Playing,
            "Paused" => Self::Paused,
            "Error" => Self::Error,
            _ => Self::Stopped,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Playing => "Playing",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One poll's view of the active player. Built fresh on every poll and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaState {
    pub source: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Either a remote URL or an inline `data:` image.
    pub art_url: Option<String>,
    pub is_playing: bool,
    pub progress_ms: u64,
    pub duration_ms: u64,
    pub device_name: String,
    pub volume_percent: Option<u8>,
    pub can_seek: bool,
    pub can_control: bool,
    pub track_id: Option<String>,
    pub bus_name: Option<String>,
    pub status: PlaybackStatus,
    pub message: Option<String>,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            source: String::new(),
            title: IDLE_TITLE.to_string(),
            artist: String::new(),
            album: String::new(),
            art_url: None,
            is_playing: false,
            progress_ms: 0,
            duration_ms: 0,
            device_name: String::new(),
            volume_percent: None,
            can_seek: false,
            can_control: false,
            track_id: None,
            bus_name: None,
            status: PlaybackStatus::Stopped,
            message: None,
        }
    }
}

impl MediaState {
    /// The neutral state: nothing playing, no controls.
    pub fn idle(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            status: PlaybackStatus::Error,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == PlaybackStatus::Stopped && self.title == IDLE_TITLE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDevice {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub volume_percent: Option<u8>,
}

fn default_action_timeout_ms() -> u64 {
    30_000
}

/// A user-defined quick action. Owned by configuration and only ever read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomQuickAction {
    pub key: String,
    pub title: String,
    pub command: String,
    #[serde(default = "default_action_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LyricLine {
    pub at_ms: u64,
    pub text: String,
}

/// Lines sorted ascending by `at_ms`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncedLyrics {
    lines: Vec<LyricLine>,
}

impl SyncedLyrics {
    pub fn new(mut lines: Vec<LyricLine>) -> Self {
        lines.sort_by_key(|l| l.at_ms);
        Self { lines }
    }

    pub fn lines(&self) -> &[LyricLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn into_lines(self) -> Vec<LyricLine> {
        self.lines
    }

    /// The line active at `position_ms`: the last one whose timestamp is not
    /// after the position, or `""` before the first line.
    pub fn line_at(&self, position_ms: u64) -> &str {
        let mut last = "";
        for line in &self.lines {
            if position_ms < line.at_ms {
                break;
            }
            last = &line.text;
        }
        last
    }
}
