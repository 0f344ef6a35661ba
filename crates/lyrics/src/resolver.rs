//! Per-track lyrics state machine.
//!
//! Each track is identified by a fingerprint. When it changes the pending
//! lookup is aborted and the line cleared; a lookup result is only applied
//! while its fingerprint is still the current one.

use crate::lrclib::{LyricsFetchError, LyricsSource};
use crate::query::{build_candidates, duration_secs, LyricsQuery};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use touchdeck_core::format::normalize_text;
use touchdeck_core::{LyricsCache, MediaState, SyncedLyrics};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LyricsStatus {
    Idle,
    Fetching,
    Found,
    NotFound,
    Failed,
}

/// A lookup that finished for the current track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LyricsEvent {
    Found,
    NotFound,
    Failed,
}

#[derive(Debug)]
enum Outcome {
    Found(SyncedLyrics),
    NotFound,
    Failed,
}

/// `track_id|title|artist|album|seconds`, text normalized. `None` when the
/// state does not describe a track lyrics could be looked up for.
pub fn fingerprint(state: &MediaState) -> Option<String> {
    if state.is_idle() || state.title.trim().is_empty() || state.duration_ms == 0 {
        return None;
    }
    Some(format!(
        "{}|{}|{}|{}|{}",
        state.track_id.as_deref().unwrap_or_default(),
        normalize_text(&state.title),
        normalize_text(&state.artist),
        normalize_text(&state.album),
        duration_secs(state.duration_ms),
    ))
}

pub struct LyricsResolver {
    source: Arc<dyn LyricsSource>,
    cache: LyricsCache,
    cache_dirty: bool,
    enabled: bool,
    current: Option<String>,
    status: LyricsStatus,
    lyrics: Option<SyncedLyrics>,
    task: Option<JoinHandle<()>>,
    results_tx: mpsc::UnboundedSender<(String, Outcome)>,
    results_rx: mpsc::UnboundedReceiver<(String, Outcome)>,
}

impl LyricsResolver {
    pub fn new(source: Arc<dyn LyricsSource>, cache: LyricsCache) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            source,
            cache,
            cache_dirty: false,
            enabled: true,
            current: None,
            status: LyricsStatus::Idle,
            lyrics: None,
            task: None,
            results_tx,
            results_rx,
        }
    }

    pub fn status(&self) -> LyricsStatus {
        self.status
    }

    pub fn lyrics(&self) -> Option<&SyncedLyrics> {
        self.lyrics.as_ref()
    }

    pub fn current_fingerprint(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn cache(&self) -> &LyricsCache {
        &self.cache
    }

    /// True once per batch of new cache entries.
    pub fn take_cache_dirty(&mut self) -> bool {
        std::mem::take(&mut self.cache_dirty)
    }

    /// Swaps the backend. The current track is looked up again.
    pub fn set_source(&mut self, source: Arc<dyn LyricsSource>) {
        self.source = source;
        self.reset(None);
    }

    /// Disabling drops the current track so a later enable starts over.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        self.reset(None);
    }

    pub fn active_line(&self, position_ms: u64) -> &str {
        self.lyrics
            .as_ref()
            .map_or("", |lyrics| lyrics.line_at(position_ms))
    }

    /// Feeds a fresh snapshot. Starts, keeps or abandons a lookup and
    /// returns the outcome of a lookup that completed since the last call.
    pub fn observe(&mut self, state: &MediaState) -> Option<LyricsEvent> {
        let fp = if self.enabled { fingerprint(state) } else { None };
        if fp != self.current {
            self.reset(fp);
            if let Some(fp) = self.current.clone() {
                self.begin(&fp, state);
            }
        }
        self.drain()
    }

    /// Waits for the pending lookup, if any, and applies it.
    pub async fn settle(&mut self) -> Option<LyricsEvent> {
        while self.status == LyricsStatus::Fetching {
            let (fp, outcome) = self.results_rx.recv().await?;
            if let Some(event) = self.apply(fp, outcome) {
                return Some(event);
            }
        }
        None
    }

    fn reset(&mut self, fp: Option<String>) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.current = fp;
        self.lyrics = None;
        self.status = LyricsStatus::Idle;
    }

    fn begin(&mut self, fp: &str, state: &MediaState) {
        if let Some(hit) = self.cache.get(fp) {
            debug!(fingerprint = fp, lines = hit.lines().len(), "lyrics cache hit");
            self.lyrics = Some(hit);
            self.status = LyricsStatus::Found;
            return;
        }

        let candidates =
            build_candidates(&state.title, &state.artist, &state.album, state.duration_ms);
        if candidates.is_empty() {
            self.status = LyricsStatus::Failed;
            return;
        }

        self.status = LyricsStatus::Fetching;
        let source = self.source.clone();
        let tx = self.results_tx.clone();
        let fp = fp.to_string();
        self.task = Some(tokio::spawn(async move {
            let outcome = AssertUnwindSafe(lookup(source.as_ref(), &candidates))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    warn!(fingerprint = %fp, "lyrics lookup panicked");
                    Outcome::Failed
                });
            let _ = tx.send((fp, outcome));
        }));
    }

    fn drain(&mut self) -> Option<LyricsEvent> {
        let mut last = None;
        while let Ok((fp, outcome)) = self.results_rx.try_recv() {
            if let Some(event) = self.apply(fp, outcome) {
                last = Some(event);
            }
        }
        last
    }

    fn apply(&mut self, fp: String, outcome: Outcome) -> Option<LyricsEvent> {
        if self.current.as_deref() != Some(fp.as_str()) || self.status != LyricsStatus::Fetching {
            debug!(fingerprint = %fp, "dropping stale lyrics result");
            return None;
        }
        self.task = None;
        let event = match outcome {
            Outcome::Found(lyrics) => {
                info!(fingerprint = %fp, lines = lyrics.lines().len(), "lyrics found");
                self.cache.insert(fp, &lyrics);
                self.cache_dirty = true;
                self.lyrics = Some(lyrics);
                self.status = LyricsStatus::Found;
                LyricsEvent::Found
            }
            Outcome::NotFound => {
                info!(fingerprint = %fp, "lyrics not found");
                self.status = LyricsStatus::NotFound;
                LyricsEvent::NotFound
            }
            Outcome::Failed => {
                debug!(fingerprint = %fp, "lyrics unavailable");
                self.status = LyricsStatus::Failed;
                LyricsEvent::Failed
            }
        };
        Some(event)
    }
}

impl Drop for LyricsResolver {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Tries candidates in order. Reports not-found only when some candidate
/// said so and none failed for another reason.
async fn lookup(source: &dyn LyricsSource, candidates: &[LyricsQuery]) -> Outcome {
    let mut not_found = 0usize;
    let mut other_failures = 0usize;

    for query in candidates {
        match source.fetch(query).await {
            Ok(Some(lyrics)) if !lyrics.is_empty() => return Outcome::Found(lyrics),
            Ok(_) => {}
            Err(LyricsFetchError::NotFound) => not_found += 1,
            Err(LyricsFetchError::Other(err)) => {
                debug!(track = %query.track, artist = %query.artist, error = %err, "lyrics lookup failed");
                other_failures += 1;
            }
        }
    }

    if not_found > 0 && other_failures == 0 {
        Outcome::NotFound
    } else {
        Outcome::Failed
    }
}
