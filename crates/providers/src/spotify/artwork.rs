use async_trait::async_trait;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Artwork larger than this is not pulled into memory.
pub const MAX_ART_BYTES: usize = 2_500_000;
const ART_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl FetchedImage {
    pub fn to_data_url(&self) -> String {
        let b64 = base64::engine::general_purpose::STANDARD.encode(&self.bytes);
        format!("data:{};base64,{b64}", self.content_type)
    }
}

#[async_trait]
pub trait ArtworkFetch: Send + Sync {
    /// `None` for any failure, including oversized images.
    async fn fetch(&self, url: &str) -> Option<FetchedImage>;
}

pub struct HttpArtworkFetcher {
    http: reqwest::Client,
    max_bytes: usize,
}

impl HttpArtworkFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            max_bytes: MAX_ART_BYTES,
        }
    }
}

#[async_trait]
impl ArtworkFetch for HttpArtworkFetcher {
    async fn fetch(&self, url: &str) -> Option<FetchedImage> {
        let mut resp = match self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, "touchdeck/spotify-provider")
            .timeout(ART_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!(%url, status = %resp.status(), "artwork request failed");
                return None;
            }
            Err(err) => {
                debug!(%url, error = %err, "artwork request failed");
                return None;
            }
        };

        if resp
            .content_length()
            .is_some_and(|len| len > self.max_bytes as u64)
        {
            debug!(%url, "artwork exceeds size cap");
            return None;
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| guess_content_type(url).to_string());

        let mut bytes = Vec::new();
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    bytes.extend_from_slice(&chunk);
                    if bytes.len() > self.max_bytes {
                        debug!(%url, "artwork exceeds size cap");
                        return None;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(%url, error = %err, "artwork download interrupted");
                    return None;
                }
            }
        }

        Some(FetchedImage {
            content_type,
            bytes,
        })
    }
}

fn guess_content_type(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

struct CachedArt {
    url: String,
    data_url: Option<String>,
}

/// Single-slot cache from artwork URL to inline `data:` URL.
///
/// The slot lock is held across the download so overlapping polls for the
/// same URL download once; the later caller reuses the stored result. A
/// failed download is cached too, until the URL changes.
pub struct ArtworkCache {
    fetcher: Arc<dyn ArtworkFetch>,
    slot: Mutex<Option<CachedArt>>,
}

impl ArtworkCache {
    pub fn new(fetcher: Arc<dyn ArtworkFetch>) -> Self {
        Self {
            fetcher,
            slot: Mutex::new(None),
        }
    }

    pub async fn resolve(&self, url: &str) -> Option<String> {
        if url.is_empty() {
            return None;
        }
        if url.starts_with("data:") {
            return Some(url.to_string());
        }

        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.url == url {
                return cached.data_url.clone();
            }
        }

        let data_url = self.fetcher.fetch(url).await.map(|img| img.to_data_url());
        info!(
            %url,
            converted = data_url.is_some(),
            data_len = data_url.as_ref().map(String::len).unwrap_or(0),
            "cover art changed"
        );
        *slot = Some(CachedArt {
            url: url.to_string(),
            data_url: data_url.clone(),
        });
        data_url
    }

    pub async fn clear(&self) {
        *self.slot.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::{guess_content_type, ArtworkCache, ArtworkFetch, FetchedImage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingFetcher {
        downloads: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ArtworkFetch for CountingFetcher {
        async fn fetch(&self, _url: &str) -> Option<FetchedImage> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return None;
            }
            Some(FetchedImage {
                content_type: "image/png".to_string(),
                bytes: vec![1, 2, 3],
            })
        }
    }

    #[tokio::test]
    async fn unchanged_url_is_downloaded_once() {
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = ArtworkCache::new(fetcher.clone());

        let first = cache.resolve("https://i.scdn.co/image/a").await;
        let second = cache.resolve("https://i.scdn.co/image/a").await;
        assert_eq!(first.as_deref(), Some("data:image/png;base64,AQID"));
        assert_eq!(first, second);
        assert_eq!(fetcher.downloads.load(Ordering::SeqCst), 1);

        let _ = cache.resolve("https://i.scdn.co/image/b").await;
        assert_eq!(fetcher.downloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overlapping_polls_share_one_download() {
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = Arc::new(ArtworkCache::new(fetcher.clone()));

        let a = tokio::spawn({
            let cache = cache.clone();
            async move { cache.resolve("https://x/1.png").await }
        });
        let b = tokio::spawn({
            let cache = cache.clone();
            async move { cache.resolve("https://x/1.png").await }
        });
        let (a, b) = (a.await.ok().flatten(), b.await.ok().flatten());
        assert_eq!(a, b);
        assert_eq!(fetcher.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_cached_until_url_changes() {
        let fetcher = Arc::new(CountingFetcher {
            fail: true,
            ..CountingFetcher::default()
        });
        let cache = ArtworkCache::new(fetcher.clone());
        assert_eq!(cache.resolve("https://x/broken").await, None);
        assert_eq!(cache.resolve("https://x/broken").await, None);
        assert_eq!(fetcher.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn data_urls_pass_through() {
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = ArtworkCache::new(fetcher.clone());
        let inline = "data:image/jpeg;base64,AAAA";
        assert_eq!(cache.resolve(inline).await.as_deref(), Some(inline));
        assert_eq!(fetcher.downloads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn guesses_type_from_extension() {
        assert_eq!(guess_content_type("https://x/a.PNG?size=1"), "image/png");
        assert_eq!(guess_content_type("https://x/a.webp"), "image/webp");
        assert_eq!(guess_content_type("https://i.scdn.co/image/ab67"), "image/jpeg");
    }
}
