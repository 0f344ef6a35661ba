use crate::lyrics_cache::LyricsCache;
use crate::model::CustomQuickAction;
use crate::quick_actions::filter_quick_action_keys;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const KNOWN_PROVIDERS: [&str; 2] = ["mpris", "spotify"];
pub const DEFAULT_PROVIDER: &str = "mpris";

fn default_schema_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigIntervals {
    pub playing_poll_ms: u64,
    pub paused_poll_ms: u64,
    pub idle_poll_ms: u64,
    pub file_watch_poll_ms: u64,
}

impl Default for ConfigIntervals {
    fn default() -> Self {
        Self {
            playing_poll_ms: 500,
            paused_poll_ms: 1_000,
            idle_poll_ms: 3_000,
            file_watch_poll_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_port: u16,
    pub device_id: Option<String>,
    pub token_cache_path: Option<PathBuf>,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_port: 8765,
            device_id: None,
            token_cache_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LyricsConfig {
    pub enabled: bool,
    pub api_url: String,
    pub not_found_notice_ms: u64,
}

impl Default for LyricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: "https://lrclib.net/api/get".to_string(),
            not_found_notice_ms: 10_000,
        }
    }
}

/// The settings snapshot the media core consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeckConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub media_provider: String,
    pub intervals: ConfigIntervals,
    pub spotify: SpotifyConfig,
    pub lyrics: LyricsConfig,
    pub custom_actions: Vec<CustomQuickAction>,
    pub quick_actions: Vec<String>,
    pub lyrics_cache: LyricsCache,
    pub log_level: String,
}

impl Default for DeckConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            media_provider: DEFAULT_PROVIDER.to_string(),
            intervals: ConfigIntervals::default(),
            spotify: SpotifyConfig::default(),
            lyrics: LyricsConfig::default(),
            custom_actions: Vec::new(),
            quick_actions: vec!["play_pause".to_string(), "next_track".to_string()],
            lyrics_cache: LyricsCache::default(),
            log_level: "info".to_string(),
        }
    }
}

impl DeckConfig {
    /// Clamps out-of-range values and drops unknown selections, the way a
    /// hand-edited settings file is expected to be repaired on load.
    pub fn sanitize(&mut self) {
        let provider = self.media_provider.trim().to_lowercase();
        self.media_provider = if KNOWN_PROVIDERS.contains(&provider.as_str()) {
            provider
        } else {
            DEFAULT_PROVIDER.to_string()
        };

        let i = &mut self.intervals;
        i.playing_poll_ms = i.playing_poll_ms.clamp(250, 3_000);
        i.paused_poll_ms = i.paused_poll_ms.clamp(250, 10_000);
        i.idle_poll_ms = i.idle_poll_ms.clamp(250, 30_000);
        i.file_watch_poll_ms = i.file_watch_poll_ms.max(1_000);

        self.custom_actions
            .retain(|a| !a.key.trim().is_empty() && !a.command.trim().is_empty());
        for action in &mut self.custom_actions {
            action.timeout_ms = action.timeout_ms.max(1);
        }
        self.quick_actions = filter_quick_action_keys(&self.quick_actions, &self.custom_actions);
    }

    pub fn custom_action(&self, key: &str) -> Option<&CustomQuickAction> {
        self.custom_actions.iter().find(|a| a.key == key)
    }
}
