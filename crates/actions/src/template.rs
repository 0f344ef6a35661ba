use touchdeck_core::format::ms_to_mmss;
use touchdeck_core::MediaState;

fn placeholder(name: &str, state: &MediaState) -> String {
    match name {
        "title" => state.title.clone(),
        "artist" => state.artist.clone(),
        "album" => state.album.clone(),
        "status" => state.status.label().to_string(),
        "position_ms" => state.progress_ms.to_string(),
        "length_ms" => state.duration_ms.to_string(),
        "position_mmss" => ms_to_mmss(state.progress_ms),
        "length_mmss" => ms_to_mmss(state.duration_ms),
        "track_id" => state.track_id.clone().unwrap_or_default(),
        "bus_name" => state.bus_name.clone().unwrap_or_default(),
        _ => String::new(),
    }
}

/// Fills `{name}` placeholders from the current state. Unknown names become
/// empty, `{{` and `}}` are literal braces and values are inserted as-is.
pub fn render_command(template: &str, state: &MediaState) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(i) = rest.find(|c: char| c == '{' || c == '}') {
        out.push_str(&rest[..i]);
        let tail = &rest[i..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
        } else if let Some(stripped) = tail.strip_prefix('{') {
            match stripped.find('}') {
                Some(end) if !stripped[..end].contains('{') => {
                    out.push_str(&placeholder(stripped[..end].trim(), state));
                    rest = &stripped[end + 1..];
                }
                _ => {
                    out.push('{');
                    rest = stripped;
                }
            }
        } else {
            out.push('}');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::render_command;
    use touchdeck_core::{MediaState, PlaybackStatus};

    fn state() -> MediaState {
        MediaState {
            title: "Song".into(),
            artist: "Artist".into(),
            album: "Album".into(),
            progress_ms: 65_000,
            duration_ms: 200_000,
            status: PlaybackStatus::Playing,
            track_id: Some("/org/mpris/track/1".into()),
            bus_name: Some("org.mpris.MediaPlayer2.vlc".into()),
            ..MediaState::default()
        }
    }

    #[test]
    fn fills_every_placeholder() {
        let out = render_command(
            "{title}|{artist}|{album}|{status}|{position_ms}|{length_ms}|{position_mmss}|{length_mmss}|{track_id}|{bus_name}",
            &state(),
        );
        assert_eq!(
            out,
            "Song|Artist|Album|Playing|65000|200000|1:05|3:20|/org/mpris/track/1|org.mpris.MediaPlayer2.vlc"
        );
    }

    #[test]
    fn missing_values_render_empty() {
        let s = MediaState::idle("mpris");
        assert_eq!(render_command("id=[{track_id}] x=[{nope}]", &s), "id=[] x=[]");
    }

    #[test]
    fn braces_escape_and_survive() {
        let s = state();
        assert_eq!(render_command("{{title}}", &s), "{title}");
        assert_eq!(render_command("awk '{{print $1}}'", &s), "awk '{print $1}'");
        assert_eq!(render_command("open { brace", &s), "open { brace");
        assert_eq!(render_command("close } brace", &s), "close } brace");
        assert_eq!(render_command("{ {title}", &s), "{ Song");
    }
}
