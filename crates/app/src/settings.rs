use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::SystemTime;
use touchdeck_core::DeckConfig;

pub type LiveConfig = Arc<RwLock<DeckConfig>>;

pub fn default_config_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("touchdeck").join("settings.json")
}

pub fn default_token_cache_path() -> PathBuf {
    let base = dirs::cache_dir()
        .or_else(dirs::config_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("touchdeck").join("spotify_token.json")
}

pub fn read_live(live: &LiveConfig) -> RwLockReadGuard<'_, DeckConfig> {
    live.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn replace_live(live: &LiveConfig, cfg: DeckConfig) {
    let mut guard = live.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = cfg;
}

/// Applies `edit` to the file as stored, without environment overrides, so
/// values injected through the environment never end up on disk.
pub fn update_file(path: &Path, edit: impl FnOnce(&mut DeckConfig)) -> Result<()> {
    let mut cfg = if path.exists() {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))?
    } else {
        DeckConfig::default()
    };
    edit(&mut cfg);
    save_config(path, &cfg)
}

pub fn init_config(path: &Path) -> Result<()> {
    save_config(path, &DeckConfig::default())
}

pub fn save_config(path: &Path, cfg: &DeckConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(cfg)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}

/// Missing file means defaults. The result is always sanitized and carries
/// environment overrides.
pub fn load_or_default(path: &Path) -> Result<DeckConfig> {
    let mut cfg = if !path.exists() {
        DeckConfig::default()
    } else {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))?
    };
    apply_env_overrides(&mut cfg, |name| std::env::var(name).ok());
    cfg.sanitize();
    Ok(cfg)
}

fn apply_env_overrides(cfg: &mut DeckConfig, var: impl Fn(&str) -> Option<String>) {
    let set = |name: &str| var(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = set("TOUCHDECK_MEDIA_PROVIDER") {
        cfg.media_provider = v;
    }
    if let Some(v) = set("TOUCHDECK_LOG_LEVEL") {
        cfg.log_level = v;
    }
    if let Some(v) = set("TOUCHDECK_SPOTIFY_CLIENT_ID") {
        cfg.spotify.client_id = v;
    }
    if let Some(v) = set("TOUCHDECK_SPOTIFY_CLIENT_SECRET") {
        cfg.spotify.client_secret = v;
    }
}

pub fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

/// Last modification time of the config file that this process has seen.
/// Writes made here are recorded so the watcher only reacts to outside edits.
#[derive(Clone, Debug)]
pub struct MtimeMark {
    path: PathBuf,
    seen: Arc<Mutex<Option<SystemTime>>>,
}

impl MtimeMark {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            seen: Arc::new(Mutex::new(file_mtime(path))),
        }
    }

    pub fn record(&self) {
        *self.seen.lock().unwrap_or_else(|p| p.into_inner()) = file_mtime(&self.path);
    }

    /// True once per change of an existing file since the last look.
    pub fn changed(&self) -> bool {
        let current = file_mtime(&self.path);
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        if current.is_some() && current != *seen {
            *seen = current;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use touchdeck_core::{LyricLine, SyncedLyrics};

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.media_provider, "mpris");
        assert_eq!(cfg.intervals.playing_poll_ms, 500);
    }

    #[test]
    fn init_then_load_round_trips_with_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("touchdeck").join("settings.json");
        init_config(&path).unwrap();

        let mut cfg = load_or_default(&path).unwrap();
        cfg.lyrics_cache.insert(
            "id|song|artist|album|200",
            &SyncedLyrics::new(vec![LyricLine { at_ms: 1_000, text: "hello".into() }]),
        );
        save_config(&path, &cfg).unwrap();

        let reloaded = load_or_default(&path).unwrap();
        assert!(reloaded.lyrics_cache.contains("id|song|artist|album|200"));
    }

    #[test]
    fn hand_edited_values_are_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"media_provider":"Winamp","intervals":{"playing_poll_ms":5},"quick_actions":["bogus"],
                "lyrics_cache":{"fp":[{"at_ms":-1,"text":"bad"},{"at_ms":10,"text":"ok"}]}}"#,
        )
        .unwrap();
        let cfg = load_or_default(&path).unwrap();
        assert_eq!(cfg.media_provider, "mpris");
        assert_eq!(cfg.intervals.playing_poll_ms, 250);
        assert_eq!(cfg.quick_actions, vec!["play_pause", "next_track"]);
        assert_eq!(cfg.lyrics_cache.get("fp").map(|l| l.lines().len()), Some(1));
    }

    #[test]
    fn update_file_keeps_unrelated_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"media_provider":"spotify","log_level":"debug"}"#).unwrap();

        update_file(&path, |cfg| cfg.spotify.device_id = Some("dev-1".into())).unwrap();

        let cfg = load_or_default(&path).unwrap();
        assert_eq!(cfg.media_provider, "spotify");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.spotify.device_id.as_deref(), Some("dev-1"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn env_overrides_skip_blank_values() {
        let mut cfg = DeckConfig::default();
        apply_env_overrides(&mut cfg, |name| match name {
            "TOUCHDECK_MEDIA_PROVIDER" => Some("spotify".to_string()),
            "TOUCHDECK_LOG_LEVEL" => Some("  ".to_string()),
            "TOUCHDECK_SPOTIFY_CLIENT_ID" => Some("abc".to_string()),
            _ => None,
        });
        assert_eq!(cfg.media_provider, "spotify");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.spotify.client_id, "abc");
        assert!(cfg.spotify.client_secret.is_empty());
    }

    fn touch(path: &Path, secs: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn own_writes_do_not_count_as_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        init_config(&path).unwrap();
        touch(&path, 1_000);

        let mark = MtimeMark::new(&path);
        assert!(!mark.changed());

        update_file(&path, |c| c.log_level = "debug".into()).unwrap();
        touch(&path, 2_000);
        mark.record();
        assert!(!mark.changed());

        touch(&path, 3_000);
        assert!(mark.changed());
        assert!(!mark.changed());
    }

    #[test]
    fn missing_file_is_not_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let mark = MtimeMark::new(&dir.path().join("absent.json"));
        assert!(!mark.changed());
    }
}
