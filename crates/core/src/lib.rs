pub mod config;
pub mod format;
pub mod lyrics_cache;
pub mod model;
pub mod quick_actions;

pub use config::{ConfigIntervals, DeckConfig, LyricsConfig, SpotifyConfig};
pub use lyrics_cache::LyricsCache;
pub use model::{
    CustomQuickAction, LyricLine, MediaDevice, MediaState, PlaybackStatus, SyncedLyrics,
    IDLE_TITLE,
};
