//! Synchronized lyrics: LRC parsing, LRCLIB lookups and the per-track
//! resolver that keeps the active line in step with playback.

pub mod lrc;
pub mod lrclib;
pub mod query;
pub mod resolver;

pub use lrc::parse_lrc;
pub use lrclib::{LrclibClient, LyricsFetchError, LyricsSource};
pub use query::{build_candidates, LyricsQuery};
pub use resolver::{fingerprint, LyricsEvent, LyricsResolver, LyricsStatus};
