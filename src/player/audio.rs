use super::audio_types::AudioStage;
use super::catalog::ScenarioCatalog;
use super::types::{AudioTarget, ResolveError, SynthesisError, VoiceMap};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Cache I/O error: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error("Audio download failed: {0}")]
    Download(String),
}

/// Text-to-speech provider. Returns a remote URL of the generated audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<String, SynthesisError>;
}

#[async_trait]
pub trait AudioDownloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, AudioError>;
}

/// Anything that can turn a scenario line into a playable URL.
#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn resolve(&self, scenario_id: &str, target: AudioTarget) -> Result<String, ResolveError>;
}

pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, AudioError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AudioError::Download(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AudioDownloader for HttpDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>, AudioError> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", "ScenarioPlayer/0.1")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AudioError::Download(e.to_string()))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AudioError::Download(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Disk cache of narrated audio, one `.mp3` per (scenario, target).
pub struct AudioCache {
    cache_dir: PathBuf,
    public_prefix: String,
}

impl AudioCache {
    /// The directory is created on first write, not here.
    pub fn new(cache_dir: impl Into<PathBuf>, public_prefix: &str) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            public_prefix: public_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Scenario ids go into file names verbatim only when they are plain
    /// identifiers; anything else is replaced by a digest.
    fn file_stem(scenario_id: &str) -> Cow<'_, str> {
        let plain = !scenario_id.is_empty()
            && scenario_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if plain {
            Cow::Borrowed(scenario_id)
        } else {
            let mut hasher = Sha256::new();
            hasher.update(scenario_id.as_bytes());
            let digest = format!("{:x}", hasher.finalize());
            Cow::Owned(digest[..16].to_string())
        }
    }

    pub fn file_name(scenario_id: &str, target: AudioTarget) -> String {
        format!("{}_{}.mp3", Self::file_stem(scenario_id), target)
    }

    fn cache_path(&self, file_name: &str) -> PathBuf {
        self.cache_dir.join(file_name)
    }

    pub fn public_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.public_prefix, file_name)
    }

    /// Public URL of the cached entry, if there is one.
    pub fn lookup(&self, scenario_id: &str, target: AudioTarget) -> Option<String> {
        let name = Self::file_name(scenario_id, target);
        if self.cache_path(&name).is_file() {
            Some(self.public_url(&name))
        } else {
            None
        }
    }

    /// Write the audio and return its public URL. Existing entries are left as they are.
    pub fn store(&self, scenario_id: &str, target: AudioTarget, bytes: &[u8]) -> Result<String, AudioError> {
        let name = Self::file_name(scenario_id, target);
        let path = self.cache_path(&name);
        if path.is_file() {
            return Ok(self.public_url(&name));
        }

        fs::create_dir_all(&self.cache_dir)?;

        // Atomic write: a half-written file must never look like a cache hit
        let tmp = self.cache_dir.join(format!("{}.tmp", name));
        fs::write(&tmp, bytes)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        Ok(self.public_url(&name))
    }

    /// Bytes of a cached entry addressed by its public URL.
    pub fn read_public(&self, url: &str) -> Option<Vec<u8>> {
        let name = url.strip_prefix(&self.public_prefix)?.strip_prefix('/')?;
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return None;
        }
        fs::read(self.cache_path(name)).ok()
    }

    /// Total cache size in MB and entry count.
    pub fn stats(&self) -> (f64, u32) {
        let mut total_bytes: u64 = 0;
        let mut count: u32 = 0;
        if let Ok(entries) = fs::read_dir(&self.cache_dir) {
            for entry in entries.flatten() {
                let is_mp3 = entry.path().extension().map(|e| e == "mp3").unwrap_or(false);
                if let Ok(meta) = entry.metadata() {
                    if meta.is_file() && is_mp3 {
                        total_bytes += meta.len();
                        count += 1;
                    }
                }
            }
        }
        let size_mb = total_bytes as f64 / (1024.0 * 1024.0);
        (size_mb, count)
    }
}

/// Resolves scenario lines to playable URLs: cache first, synthesis otherwise.
pub struct AudioResolver {
    catalog: Arc<ScenarioCatalog>,
    cache: AudioCache,
    voices: VoiceMap,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    downloader: Arc<dyn AudioDownloader>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AudioResolver {
    pub fn new(
        catalog: Arc<ScenarioCatalog>,
        cache: AudioCache,
        voices: VoiceMap,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        downloader: Arc<dyn AudioDownloader>,
    ) -> Self {
        Self {
            catalog,
            cache,
            voices,
            synthesizer,
            downloader,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &AudioCache {
        &self.cache
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Checks the cache, then synthesises, downloads and caches.
    ///
    /// Requests for the same key are serialised, so a key is synthesised at
    /// most once while its cache entry is being produced. When only the
    /// caching step fails the remote URL is returned uncached.
    pub async fn resolve_with_progress(
        &self,
        scenario_id: &str,
        target: AudioTarget,
        mut on_progress: impl FnMut(AudioStage, &str) + Send,
    ) -> Result<String, ResolveError> {
        let scenario = self
            .catalog
            .get(scenario_id)
            .ok_or_else(|| ResolveError::NotFound(scenario_id.to_string()))?;
        let (text, speaker_id) = scenario
            .narration(target)
            .ok_or_else(|| ResolveError::InvalidIndex(target.to_string()))?;

        let key = AudioCache::file_name(scenario_id, target);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        if let Some(url) = self.cache.lookup(scenario_id, target) {
            tracing::debug!("Audio cache hit: {}", key);
            on_progress(AudioStage::CacheHit, "Found in cache");
            return Ok(url);
        }

        let voice = self.voices.for_speaker(speaker_id);
        tracing::info!("Synthesizing {} with voice {}", key, voice);
        on_progress(AudioStage::Synthesizing, "Generating speech...");
        let remote_url = self.synthesizer.synthesize(text, voice).await?;

        on_progress(AudioStage::Caching, "Caching audio...");
        match self.persist(scenario_id, target, &remote_url).await {
            Ok(url) => Ok(url),
            Err(e) => {
                tracing::warn!("Error caching audio {}: {}. Serving remote URL.", key, e);
                on_progress(AudioStage::CacheFallback, "Caching failed, using remote audio");
                Ok(remote_url)
            }
        }
    }

    async fn persist(&self, scenario_id: &str, target: AudioTarget, remote_url: &str) -> Result<String, AudioError> {
        let bytes = self.downloader.download(remote_url).await?;
        self.cache.store(scenario_id, target, &bytes)
    }
}

#[async_trait]
impl AudioSource for AudioResolver {
    async fn resolve(&self, scenario_id: &str, target: AudioTarget) -> Result<String, ResolveError> {
        self.resolve_with_progress(scenario_id, target, |_, _| {}).await
    }
}
