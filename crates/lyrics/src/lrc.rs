use regex::Regex;
use std::sync::OnceLock;
use touchdeck_core::{LyricLine, SyncedLyrics};

fn timestamp_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+):(\d{2})(?:\.(\d{1,3}))?\]").ok())
        .as_ref()
}

/// Parses an LRC blob into sorted lines. Every `[mm:ss(.fff)]` stamp on a
/// line produces its own entry. Returns `None` when nothing timed survives.
pub fn parse_lrc(text: &str) -> Option<SyncedLyrics> {
    let re = timestamp_re()?;
    let mut lines = Vec::new();

    for raw in text.lines() {
        let body = re.replace_all(raw, "");
        let body = body.trim();
        if body.is_empty() {
            continue;
        }
        for caps in re.captures_iter(raw) {
            let (Some(min), Some(sec)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let (Ok(min), Ok(sec)) = (min.as_str().parse::<u64>(), sec.as_str().parse::<u64>())
            else {
                continue;
            };
            let millis = caps.get(3).map_or(0, |m| fraction_to_ms(m.as_str()));
            let Some(at_ms) = stamp_ms(min, sec, millis) else {
                continue;
            };
            lines.push(LyricLine {
                at_ms,
                text: body.to_string(),
            });
        }
    }

    if lines.is_empty() {
        None
    } else {
        Some(SyncedLyrics::new(lines))
    }
}

fn stamp_ms(min: u64, sec: u64, millis: u64) -> Option<u64> {
    min.checked_mul(60)
        .and_then(|s| s.checked_add(sec))
        .and_then(|s| s.checked_mul(1_000))
        .and_then(|s| s.checked_add(millis))
}

/// `.5` is half a second, `.05` fifty millis: pad on the right to 3 digits.
fn fraction_to_ms(frac: &str) -> u64 {
    let mut digits: String = frac.chars().take(3).collect();
    while digits.len() < 3 {
        digits.push('0');
    }
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::parse_lrc;

    #[test]
    fn parses_and_sorts_stamps() {
        let lrc = "[00:12.50]second\n[00:01]first\n[01:02.345]third";
        let lyrics = parse_lrc(lrc).unwrap();
        let got: Vec<_> = lyrics
            .lines()
            .iter()
            .map(|l| (l.at_ms, l.text.as_str()))
            .collect();
        assert_eq!(
            got,
            vec![(1_000, "first"), (12_500, "second"), (62_345, "third")]
        );
    }

    #[test]
    fn repeated_stamps_share_text() {
        let lyrics = parse_lrc("[00:10.00][00:30.00] chorus ").unwrap();
        assert_eq!(lyrics.lines().len(), 2);
        assert!(lyrics.lines().iter().all(|l| l.text == "chorus"));
        assert_eq!(lyrics.lines()[1].at_ms, 30_000);
    }

    #[test]
    fn single_fraction_digit_means_tenths() {
        let lyrics = parse_lrc("[00:00.5]x").unwrap();
        assert_eq!(lyrics.lines()[0].at_ms, 500);
    }

    #[test]
    fn untimed_or_blank_lines_yield_nothing() {
        assert!(parse_lrc("just some words\nno stamps here").is_none());
        assert!(parse_lrc("[00:01.00]\n[ar:Someone]").is_none());
        assert!(parse_lrc("").is_none());
    }

    #[test]
    fn oversized_stamps_are_skipped() {
        let lyrics = parse_lrc("[99999999999999999:00]x\n[00:01]ok").unwrap();
        assert_eq!(lyrics.lines().len(), 1);
        assert_eq!(lyrics.lines()[0].at_ms, 1_000);
        assert_eq!(lyrics.lines()[0].text, "ok");

        // Too many digits to fit a u64 at all.
        assert!(parse_lrc("[999999999999999999999999:00]x").is_none());
    }

    #[test]
    fn malformed_stamps_are_not_timed() {
        assert!(parse_lrc("[0:5]x\n[aa:bb]y\n[00:1.5]z").is_none());
        let lyrics = parse_lrc("[00:1x]bad\n[00:02.25]good").unwrap();
        assert_eq!(lyrics.lines().len(), 1);
        assert_eq!(lyrics.lines()[0].at_ms, 2_250);
    }

    #[test]
    fn rendering_back_preserves_pairs() {
        let source = "[00:03.200]c\n[00:01.000]a\n[00:02.100]b";
        let parsed = parse_lrc(source).unwrap();
        let rendered: String = parsed
            .lines()
            .iter()
            .map(|l| {
                format!(
                    "[{:02}:{:02}.{:03}]{}\n",
                    l.at_ms / 60_000,
                    (l.at_ms / 1_000) % 60,
                    l.at_ms % 1_000,
                    l.text
                )
            })
            .collect();
        assert_eq!(parse_lrc(&rendered), Some(parsed));
    }

    #[test]
    fn active_line_follows_position() {
        let lyrics = parse_lrc("[00:01.00]a\n[00:05.00]b").unwrap();
        assert_eq!(lyrics.line_at(0), "");
        assert_eq!(lyrics.line_at(1_000), "a");
        assert_eq!(lyrics.line_at(4_999), "a");
        assert_eq!(lyrics.line_at(60_000), "b");
    }
}
