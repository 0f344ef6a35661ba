use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use touchdeck_core::{DeckConfig, MediaDevice, MediaState};

pub mod manager;
pub mod mpris;
pub mod spotify;

pub use manager::MediaManager;

/// Failures a provider reports to the façade. Every variant except
/// [`ProviderError::Internal`] carries a message meant for the user.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Spotify is not signed in")]
    NotSignedIn,
    #[error("Spotify credentials are missing")]
    CredentialsMissing,
    #[error("Spotify sign-in was canceled")]
    SignInCanceled,
    #[error("Spotify sign-in timed out")]
    SignInTimedOut,
    #[error("Could not start local auth server: {0}")]
    AuthServer(String),
    #[error("Spotify token refresh failed: {0}")]
    TokenRefresh(String),
    #[error("Spotify Premium is required for that control")]
    PremiumRequired,
    #[error("No active Spotify device. Pick one in Settings -> Media.")]
    NoActiveDevice,
    #[error("{0} does not support that action")]
    Unsupported(&'static str),
    #[error("{0}")]
    Provider(String),
    #[error("internal provider failure: {0}")]
    Internal(String),
}

impl ProviderError {
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// The capability set every media backend implements.
///
/// Providers are shared behind `Arc` and keep their own session state, so
/// every method takes `&self`.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Warm-up hook, e.g. loading or refreshing credentials.
    async fn ensure_ready(&self) -> ProviderResult<()> {
        Ok(())
    }

    async fn get_state(&self) -> ProviderResult<MediaState>;
    async fn play_pause(&self) -> ProviderResult<()>;
    async fn next(&self) -> ProviderResult<()>;
    async fn previous(&self) -> ProviderResult<()>;
    async fn seek(&self, position_ms: u64) -> ProviderResult<()>;
    async fn set_volume(&self, percent: u8) -> ProviderResult<()>;

    async fn list_devices(&self) -> ProviderResult<Vec<MediaDevice>> {
        Ok(Vec::new())
    }

    async fn transfer_playback(&self, _device_id: &str, _play: bool) -> ProviderResult<()> {
        Ok(())
    }

    async fn authenticate(&self) -> ProviderResult<()> {
        Err(ProviderError::Unsupported(self.name()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Mpris,
    Spotify,
}

impl ProviderKind {
    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_lowercase().as_str() {
            "mpris" => Some(Self::Mpris),
            "spotify" => Some(Self::Spotify),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Mpris => "mpris",
            Self::Spotify => "spotify",
        }
    }
}

/// Maps provider kinds to live instances. Lookups are done per call so a
/// settings change takes effect on the next poll.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn MediaProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ProviderKind, provider: Arc<dyn MediaProvider>) {
        self.providers.insert(kind, provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn MediaProvider>> {
        self.providers.get(&kind).cloned()
    }

    /// Resolves a settings key, falling back to MPRIS and then to whatever
    /// is registered when the key is unknown or not registered.
    pub fn resolve(&self, key: &str) -> Option<Arc<dyn MediaProvider>> {
        self.resolve_entry(key).map(|(_, provider)| provider)
    }

    /// Like [`resolve`](Self::resolve) but also reports which kind answered.
    pub fn resolve_entry(&self, key: &str) -> Option<(ProviderKind, Arc<dyn MediaProvider>)> {
        let entry = |kind: ProviderKind| self.get(kind).map(|provider| (kind, provider));
        ProviderKind::from_key(key)
            .and_then(entry)
            .or_else(|| entry(ProviderKind::Mpris))
            .or_else(|| self.kinds().into_iter().find_map(entry))
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.key());
        kinds
    }
}

/// Every provider the platform supports, plus a typed handle to the ones
/// that can be reconfigured in place.
#[derive(Clone)]
pub struct ProviderSet {
    pub registry: ProviderRegistry,
    pub spotify: Arc<spotify::SpotifyProvider>,
    default_token_cache: PathBuf,
}

impl ProviderSet {
    /// Pushes a reloaded settings snapshot into the live providers.
    pub async fn apply_config(&self, cfg: &DeckConfig) {
        self.spotify
            .update_config(spotify::SpotifySettings::from_config(
                &cfg.spotify,
                self.default_token_cache.clone(),
            ))
            .await;
    }
}

pub fn build_registry(cfg: &DeckConfig, default_token_cache: PathBuf) -> ProviderSet {
    let spotify = Arc::new(spotify::SpotifyProvider::new(
        spotify::SpotifySettings::from_config(&cfg.spotify, default_token_cache.clone()),
    ));
    let mut registry = ProviderRegistry::new();
    registry.register(ProviderKind::Mpris, platform::mpris_provider());
    registry.register(ProviderKind::Spotify, spotify.clone());
    ProviderSet {
        registry,
        spotify,
        default_token_cache,
    }
}

/// Stands in for a backend the current platform cannot reach.
#[cfg_attr(target_os = "linux", allow(dead_code))]
struct NullProvider {
    name: &'static str,
}

#[async_trait]
impl MediaProvider for NullProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn get_state(&self) -> ProviderResult<MediaState> {
        Ok(MediaState::idle(self.name))
    }

    async fn play_pause(&self) -> ProviderResult<()> {
        Ok(())
    }

    async fn next(&self) -> ProviderResult<()> {
        Ok(())
    }

    async fn previous(&self) -> ProviderResult<()> {
        Ok(())
    }

    async fn seek(&self, _position_ms: u64) -> ProviderResult<()> {
        Ok(())
    }

    async fn set_volume(&self, _percent: u8) -> ProviderResult<()> {
        Ok(())
    }
}

mod platform {
    use super::MediaProvider;
    use std::sync::Arc;

    #[cfg(target_os = "linux")]
    pub fn mpris_provider() -> Arc<dyn MediaProvider> {
        Arc::new(crate::mpris::MprisProvider::new(
            crate::mpris::dbus::DbusPlayerBus::new(),
        ))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn mpris_provider() -> Arc<dyn MediaProvider> {
        Arc::new(super::NullProvider { name: "mpris" })
    }
}

#[cfg(test)]
mod tests {
    use super::{build_registry, NullProvider, ProviderKind, ProviderRegistry};
    use std::path::PathBuf;
    use std::sync::Arc;
    use touchdeck_core::DeckConfig;

    #[test]
    fn provider_keys_are_case_insensitive() {
        assert_eq!(ProviderKind::from_key(" Spotify "), Some(ProviderKind::Spotify));
        assert_eq!(ProviderKind::from_key("MPRIS"), Some(ProviderKind::Mpris));
        assert_eq!(ProviderKind::from_key("winamp"), None);
    }

    #[test]
    fn registry_falls_back_to_mpris() {
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderKind::Mpris, Arc::new(NullProvider { name: "mpris" }));
        let resolved = registry.resolve("spotify").map(|p| p.name());
        assert_eq!(resolved, Some("mpris"));
        let resolved = registry.resolve("nonsense").map(|p| p.name());
        assert_eq!(resolved, Some("mpris"));
        let kind = registry.resolve_entry("spotify").map(|(kind, _)| kind);
        assert_eq!(kind, Some(ProviderKind::Mpris));
    }

    #[test]
    fn registry_without_mpris_uses_what_is_registered() {
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderKind::Spotify, Arc::new(NullProvider { name: "spotify" }));
        let kind = registry.resolve_entry("mpris").map(|(kind, _)| kind);
        assert_eq!(kind, Some(ProviderKind::Spotify));
    }

    #[test]
    fn empty_registry_resolves_nothing() {
        assert!(ProviderRegistry::new().resolve("mpris").is_none());
    }

    #[test]
    fn build_registry_registers_every_kind() {
        let set = build_registry(&DeckConfig::default(), PathBuf::from("token.json"));
        assert_eq!(
            set.registry.kinds(),
            vec![ProviderKind::Mpris, ProviderKind::Spotify]
        );
        assert_eq!(set.registry.resolve("spotify").map(|p| p.name()), Some("spotify"));
    }
}
