//! Provider façade: resolves the active provider on every call, serializes
//! controls and turns every failure into a state or a message.

use crate::{MediaProvider, ProviderError, ProviderRegistry, ProviderResult};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use touchdeck_core::config::DEFAULT_PROVIDER;
use touchdeck_core::{MediaDevice, MediaState};
use tracing::{debug, error, warn};

/// Supplies the configured provider key. Called on every operation.
pub type ProviderSelector = Arc<dyn Fn() -> String + Send + Sync>;

const CONTROL_FAILED: &str = "Media control failed";
const NOT_READY: &str = "Media provider not ready";
const NO_PROVIDER: &str = "No media provider available";

pub struct MediaManager {
    registry: ProviderRegistry,
    selector: ProviderSelector,
    control_lock: Mutex<()>,
}

impl MediaManager {
    pub fn new(registry: ProviderRegistry, selector: ProviderSelector) -> Self {
        Self {
            registry,
            selector,
            control_lock: Mutex::new(()),
        }
    }

    pub fn active_key(&self) -> String {
        let key = (self.selector)().trim().to_lowercase();
        if key.is_empty() {
            DEFAULT_PROVIDER.to_string()
        } else {
            key
        }
    }

    fn provider(&self, key: &str) -> Option<Arc<dyn MediaProvider>> {
        self.registry.resolve(key)
    }

    /// Never fails: provider errors become an `Error` state with the
    /// provider's message, anything else becomes the neutral state.
    pub async fn get_state(&self) -> MediaState {
        let requested = self.active_key();
        let Some((kind, provider)) = self.registry.resolve_entry(&requested) else {
            return MediaState::idle(requested);
        };
        let source = kind.key().to_string();

        match AssertUnwindSafe(provider.get_state()).catch_unwind().await {
            Ok(Ok(mut state)) => {
                state.source = source;
                state
            }
            Ok(Err(err)) if err.is_user_facing() => MediaState::error(source, err.to_string()),
            Ok(Err(err)) => {
                warn!(provider = provider.name(), error = %err, "provider failed; reporting idle");
                MediaState::idle(source)
            }
            Err(_) => {
                error!(provider = provider.name(), "provider panicked while reading state");
                MediaState::idle(source)
            }
        }
    }

    pub async fn play_pause(&self) -> Option<String> {
        self.run_action("play_pause", |p| async move { p.play_pause().await }.boxed())
            .await
    }

    pub async fn next(&self) -> Option<String> {
        self.run_action("next", |p| async move { p.next().await }.boxed())
            .await
    }

    pub async fn previous(&self) -> Option<String> {
        self.run_action("previous", |p| async move { p.previous().await }.boxed())
            .await
    }

    pub async fn seek(&self, position_ms: u64) -> Option<String> {
        self.run_action("seek", move |p| {
            async move { p.seek(position_ms).await }.boxed()
        })
        .await
    }

    pub async fn set_volume(&self, percent: u8) -> Option<String> {
        self.run_action("set_volume", move |p| {
            async move { p.set_volume(percent).await }.boxed()
        })
        .await
    }

    pub async fn transfer_playback(&self, device_id: &str, play: bool) -> Option<String> {
        let device_id = device_id.to_string();
        self.run_action("transfer_playback", move |p| {
            async move { p.transfer_playback(&device_id, play).await }.boxed()
        })
        .await
    }

    pub async fn list_devices(&self) -> Vec<MediaDevice> {
        let Some(provider) = self.provider(&self.active_key()) else {
            return Vec::new();
        };
        match AssertUnwindSafe(provider.list_devices()).catch_unwind().await {
            Ok(Ok(devices)) => devices,
            Ok(Err(err)) => {
                debug!(provider = provider.name(), error = %err, "device listing failed");
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }

    pub async fn ensure_ready(&self) -> Option<String> {
        let Some(provider) = self.provider(&self.active_key()) else {
            return Some(NO_PROVIDER.to_string());
        };
        let result = AssertUnwindSafe(provider.ensure_ready()).catch_unwind().await;
        user_message(result, NOT_READY)
    }

    /// Sign-in can take minutes, so it does not hold the control lock.
    pub async fn authenticate(&self) -> Option<String> {
        let Some(provider) = self.provider(&self.active_key()) else {
            return Some(NO_PROVIDER.to_string());
        };
        let result = AssertUnwindSafe(provider.authenticate()).catch_unwind().await;
        user_message(result, "Sign-in failed")
    }

    async fn run_action<F>(&self, action: &'static str, f: F) -> Option<String>
    where
        F: FnOnce(Arc<dyn MediaProvider>) -> BoxFuture<'static, ProviderResult<()>>,
    {
        let Some(provider) = self.provider(&self.active_key()) else {
            return Some(NO_PROVIDER.to_string());
        };
        let name = provider.name();

        let _guard = self.control_lock.lock().await;
        let result = AssertUnwindSafe(f(provider)).catch_unwind().await;
        let message = user_message(result, CONTROL_FAILED);
        if let Some(msg) = &message {
            debug!(provider = name, action, error = %msg, "media control failed");
        }
        message
    }
}

fn user_message(
    result: Result<ProviderResult<()>, Box<dyn std::any::Any + Send>>,
    fallback: &str,
) -> Option<String> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) if err.is_user_facing() => Some(err.to_string()),
        Ok(Err(ProviderError::Internal(detail))) => {
            warn!(%detail, "internal provider failure");
            Some(fallback.to_string())
        }
        Ok(Err(_)) | Err(_) => Some(fallback.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::MediaManager;
    use crate::{MediaProvider, ProviderError, ProviderKind, ProviderRegistry, ProviderResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use touchdeck_core::{MediaState, PlaybackStatus};

    #[derive(Default)]
    struct Scripted {
        name: &'static str,
        state_error: Option<ProviderError>,
        panic_on_state: bool,
        panic_on_control: bool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Scripted {
        fn named(name: &'static str) -> Self {
            Self {
                name,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl MediaProvider for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn get_state(&self) -> ProviderResult<MediaState> {
            if self.panic_on_state {
                panic!("provider bug");
            }
            match &self.state_error {
                Some(err) => Err(err.clone()),
                None => Ok(MediaState {
                    title: format!("{} track", self.name),
                    status: PlaybackStatus::Playing,
                    ..MediaState::default()
                }),
            }
        }

        async fn play_pause(&self) -> ProviderResult<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn next(&self) -> ProviderResult<()> {
            Err(ProviderError::NoActiveDevice)
        }

        async fn previous(&self) -> ProviderResult<()> {
            Err(ProviderError::Internal("socket closed".to_string()))
        }

        async fn seek(&self, _position_ms: u64) -> ProviderResult<()> {
            if self.panic_on_control {
                panic!("control bug");
            }
            Ok(())
        }

        async fn set_volume(&self, _percent: u8) -> ProviderResult<()> {
            Ok(())
        }
    }

    fn manager_with(provider: Scripted, key: &str) -> (MediaManager, Arc<Scripted>) {
        let provider = Arc::new(provider);
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderKind::Mpris, provider.clone());
        let key = key.to_string();
        (
            MediaManager::new(registry, Arc::new(move || key.clone())),
            provider,
        )
    }

    #[tokio::test]
    async fn provider_error_becomes_error_state() {
        let (manager, _) = manager_with(
            Scripted {
                state_error: Some(ProviderError::NotSignedIn),
                ..Scripted::named("mpris")
            },
            "mpris",
        );
        let state = manager.get_state().await;
        assert_eq!(state.status, PlaybackStatus::Error);
        assert_eq!(state.message.as_deref(), Some("Spotify is not signed in"));
        assert_eq!(state.source, "mpris");
    }

    #[tokio::test]
    async fn internal_errors_and_panics_become_neutral_state() {
        let (manager, _) = manager_with(
            Scripted {
                state_error: Some(ProviderError::Internal("boom".to_string())),
                ..Scripted::named("mpris")
            },
            "mpris",
        );
        assert!(manager.get_state().await.is_idle());

        let (manager, _) = manager_with(
            Scripted {
                panic_on_state: true,
                ..Scripted::named("mpris")
            },
            "mpris",
        );
        assert!(manager.get_state().await.is_idle());
    }

    #[tokio::test]
    async fn panicking_control_is_reported_and_releases_the_lock() {
        let (manager, _) = manager_with(
            Scripted {
                panic_on_control: true,
                ..Scripted::named("mpris")
            },
            "mpris",
        );
        assert_eq!(manager.seek(1_000).await.as_deref(), Some("Media control failed"));
        assert_eq!(manager.play_pause().await, None);
    }

    #[tokio::test]
    async fn state_source_names_the_provider_that_answered() {
        let (manager, _) = manager_with(Scripted::named("mpris"), "spotify");
        assert_eq!(manager.active_key(), "spotify");
        let state = manager.get_state().await;
        assert_eq!(state.title, "mpris track");
        assert_eq!(state.source, "mpris");

        let (manager, _) = manager_with(
            Scripted {
                panic_on_state: true,
                ..Scripted::named("mpris")
            },
            "winamp",
        );
        let state = manager.get_state().await;
        assert!(state.is_idle());
        assert_eq!(state.source, "mpris");
    }

    #[tokio::test]
    async fn controls_return_user_messages() {
        let (manager, _) = manager_with(Scripted::named("mpris"), "mpris");
        assert_eq!(manager.play_pause().await, None);
        assert_eq!(
            manager.next().await.as_deref(),
            Some("No active Spotify device. Pick one in Settings -> Media.")
        );
        assert_eq!(manager.previous().await.as_deref(), Some("Media control failed"));
    }

    #[tokio::test]
    async fn controls_are_mutually_exclusive() {
        let (manager, provider) = manager_with(Scripted::named("mpris"), "mpris");
        let manager = Arc::new(manager);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = manager.clone();
                tokio::spawn(async move { m.play_pause().await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.ok().flatten(), None);
        }
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_choice_is_reread_every_call() {
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderKind::Mpris, Arc::new(Scripted::named("mpris")));
        registry.register(ProviderKind::Spotify, Arc::new(Scripted::named("spotify")));
        let choice = Arc::new(Mutex::new("mpris".to_string()));
        let selector = {
            let choice = choice.clone();
            Arc::new(move || choice.lock().unwrap().clone())
        };
        let manager = MediaManager::new(registry, selector);

        assert_eq!(manager.get_state().await.title, "mpris track");
        *choice.lock().unwrap() = "Spotify".to_string();
        let state = manager.get_state().await;
        assert_eq!(state.title, "spotify track");
        assert_eq!(state.source, "spotify");
    }

    #[tokio::test]
    async fn unsupported_sign_in_is_reported() {
        let (manager, _) = manager_with(Scripted::named("mpris"), "mpris");
        assert_eq!(
            manager.authenticate().await.as_deref(),
            Some("mpris does not support that action")
        );
        assert!(manager.list_devices().await.is_empty());
        assert_eq!(manager.ensure_ready().await, None);
    }
}
