//! Candidate lookups. LRCLIB wants close textual matches, so a track is
//! tried under progressively cleaner spellings.

use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LyricsQuery {
    pub track: String,
    pub artist: String,
    pub album: String,
    pub duration_s: u64,
}

const ARTIST_SEPARATORS: &[char] = &[',', '&', '/', ';', '+'];

fn bracketed_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*[\(\[][^\)\]]*[\)\]]").ok())
        .as_ref()
}

fn dash_suffix_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+-\s+.*$").ok()).as_ref()
}

fn featuring_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s*[\(\[]?\b(?:feat\.?|ft\.?|featuring)(?:\s|$).*$").ok())
        .as_ref()
}

fn strip(re: Option<&Regex>, s: &str) -> String {
    match re {
        Some(re) => re.replace_all(s, "").into_owned(),
        None => s.to_string(),
    }
}

fn or_original(cleaned: String, original: &str) -> String {
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        original.trim().to_string()
    } else {
        cleaned.to_string()
    }
}

/// Drops bracketed tags like `(Remastered 2011)` and ` - Live` suffixes.
pub fn clean_title(title: &str) -> String {
    let without_tags = strip(bracketed_re(), title);
    or_original(strip(dash_suffix_re(), &without_tags), title)
}

/// Drops `feat.`/`ft.`/`featuring` credits.
pub fn clean_artist(artist: &str) -> String {
    or_original(strip(featuring_re(), artist), artist)
}

/// Text before the first artist separator.
pub fn primary_artist(artist: &str) -> String {
    let head = artist.split(ARTIST_SEPARATORS).next().unwrap_or(artist);
    or_original(clean_artist(head), artist)
}

/// Whole seconds, never below one. Exact halves round to the even second.
pub fn duration_secs(duration_ms: u64) -> u64 {
    let (whole, rest) = (duration_ms / 1_000, duration_ms % 1_000);
    let rounded = match rest.cmp(&500) {
        Ordering::Less => whole,
        Ordering::Greater => whole + 1,
        Ordering::Equal => whole + whole % 2,
    };
    rounded.max(1)
}

/// Ordered, de-duplicated lookups for a track. Empty when the track cannot
/// be looked up at all (no title, no artist or unknown length).
pub fn build_candidates(
    title: &str,
    artist: &str,
    album: &str,
    duration_ms: u64,
) -> Vec<LyricsQuery> {
    let (title, artist, album) = (title.trim(), artist.trim(), album.trim());
    if title.is_empty() || artist.is_empty() || duration_ms == 0 {
        return Vec::new();
    }

    let duration_s = duration_secs(duration_ms);
    let clean_t = clean_title(title);
    let clean_a = clean_artist(artist);
    let primary = primary_artist(artist);

    let spellings = [
        (title, artist),
        (clean_t.as_str(), artist),
        (clean_t.as_str(), clean_a.as_str()),
        (clean_t.as_str(), primary.as_str()),
    ];

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let with_album = spellings.iter().map(|&(t, a)| (t, a, album));
    let without_album = spellings[1..].iter().map(|&(t, a)| (t, a, ""));
    for (track, artist, album) in with_album.chain(without_album) {
        let query = LyricsQuery {
            track: track.to_string(),
            artist: artist.to_string(),
            album: album.to_string(),
            duration_s,
        };
        if seen.insert(query.clone()) {
            out.push(query);
        }
    }
    out
}
