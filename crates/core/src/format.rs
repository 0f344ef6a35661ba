/// `m:ss` rendering used by the shell and by command placeholders.
pub fn ms_to_mmss(ms: u64) -> String {
    let total_sec = ms / 1_000;
    format!("{}:{:02}", total_sec / 60, total_sec % 60)
}

/// Lowercases and collapses runs of whitespace.
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
