//! Local weight cache guard backed by the Hugging Face hub

use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::Cache;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::config::TranslatorConfig;
use crate::core::errors::{Result, TranslationError};

/// Source of model files: a local cache lookup plus a remote fetch
pub trait ModelHub: Send + Sync {
    /// Path of `filename` if it is already present locally
    fn cached_path(&self, filename: &str) -> Option<PathBuf>;

    /// Fetch `filename` into the local cache and return its path
    fn download(&self, filename: &str) -> Result<PathBuf>;
}

/// Hub client for one model repository, sharing the configured cache directory
pub struct HfHub {
    model_id: String,
    cache: Cache,
    api: Option<Api>,
}

impl HfHub {
    /// Create a hub client; offline configurations never build a remote client
    pub fn new(config: &TranslatorConfig) -> Result<Self> {
        let cache = Cache::new(config.cache_dir.clone());

        let api = if config.offline {
            None
        } else {
            let api = ApiBuilder::new()
                .with_cache_dir(config.cache_dir.clone())
                .with_token(config.hugging_face_token.clone())
                .with_progress(false)
                .build()?;
            Some(api)
        };

        Ok(Self {
            model_id: config.model_id.clone(),
            cache,
            api,
        })
    }
}

impl ModelHub for HfHub {
    fn cached_path(&self, filename: &str) -> Option<PathBuf> {
        self.cache.model(self.model_id.clone()).get(filename)
    }

    fn download(&self, filename: &str) -> Result<PathBuf> {
        let api = self.api.as_ref().ok_or_else(|| TranslationError::DownloadError {
            file: filename.to_string(),
            message: "hub is in offline mode".to_string(),
        })?;

        let path = api.model(self.model_id.clone()).download(filename)?;
        Ok(path)
    }
}

/// Resolved local paths of every required model file
#[derive(Debug, Clone, Default)]
pub struct CachedModel {
    files: BTreeMap<String, PathBuf>,
}

impl CachedModel {
    /// Local path of a required file
    pub fn path(&self, filename: &str) -> Result<&Path> {
        self.files
            .get(filename)
            .map(|p| p.as_path())
            .ok_or_else(|| TranslationError::model_load(format!("{} is not a cached model file", filename)))
    }

    /// Local path of a file, if it was part of the required set
    pub fn get(&self, filename: &str) -> Option<&Path> {
        self.files.get(filename).map(|p| p.as_path())
    }

    /// Paths of every `.safetensors` weight file, in filename order
    pub fn weight_paths(&self) -> Vec<&Path> {
        self.files
            .iter()
            .filter(|(name, _)| name.ends_with(".safetensors"))
            .map(|(_, p)| p.as_path())
            .collect()
    }

    /// Every cached file with its local path
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.files.iter().map(|(name, path)| (name.as_str(), path.as_path()))
    }

    /// Number of cached files
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether no file is cached
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Make sure every required file is present locally, downloading the missing ones
pub fn ensure_cached(config: &TranslatorConfig, hub: &dyn ModelHub) -> Result<CachedModel> {
    let mut files = BTreeMap::new();
    let mut missing = Vec::new();

    for filename in &config.filenames {
        match hub.cached_path(filename) {
            Some(path) => {
                debug!("Cache hit: {} -> {}", filename, path.display());
                files.insert(filename.clone(), path);
            }
            None => missing.push(filename.clone()),
        }
    }

    if missing.is_empty() {
        info!("All {} model files for {} found in cache", files.len(), config.model_id);
        return Ok(CachedModel { files });
    }

    if config.offline {
        return Err(TranslationError::DownloadError {
            file: missing.join(", "),
            message: "files are not cached and offline mode is enabled".to_string(),
        });
    }

    info!(
        "Downloading {} missing model file(s) for {}: {:?}",
        missing.len(),
        config.model_id,
        missing
    );

    for filename in missing {
        let path = download_with_retry(config, hub, &filename)?;
        files.insert(filename, path);
    }

    Ok(CachedModel { files })
}

/// Longest wait between two download attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// `base_ms * 2^(attempt-1)`, capped at [`MAX_RETRY_DELAY`]
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2_u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
}

fn download_with_retry(
    config: &TranslatorConfig,
    hub: &dyn ModelHub,
    filename: &str,
) -> Result<PathBuf> {
    let mut last_error = None;

    for attempt in 0..=config.download_max_retries {
        if attempt > 0 {
            let delay = backoff_delay(config.download_retry_delay_ms, attempt);
            debug!("Retry attempt {} for {} in {:?}", attempt, filename, delay);
            std::thread::sleep(delay);
        }

        match hub.download(filename) {
            Ok(path) => {
                if attempt > 0 {
                    info!("Downloaded {} after {} retries", filename, attempt);
                } else {
                    info!("Downloaded {}", filename);
                }
                return Ok(path);
            }
            Err(e) => {
                warn!("Download of {} failed (attempt {}): {}", filename, attempt + 1, e);
                last_error = Some(e);
            }
        }
    }

    Err(TranslationError::DownloadError {
        file: filename.to_string(),
        message: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no download attempted".to_string()),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory hub that records every download attempt
    pub(crate) struct StubHub {
        root: PathBuf,
        cached: Mutex<HashSet<String>>,
        failures_left: Mutex<u32>,
        pub(crate) attempts: Mutex<Vec<String>>,
    }

    impl StubHub {
        pub(crate) fn new(root: &Path, cached: &[&str]) -> Self {
            Self {
                root: root.to_path_buf(),
                cached: Mutex::new(cached.iter().map(|f| f.to_string()).collect()),
                failures_left: Mutex::new(0),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn failing(self, failures: u32) -> Self {
            *self.failures_left.lock().unwrap() = failures;
            self
        }

        pub(crate) fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl ModelHub for StubHub {
        fn cached_path(&self, filename: &str) -> Option<PathBuf> {
            self.cached
                .lock()
                .unwrap()
                .contains(filename)
                .then(|| self.root.join(filename))
        }

        fn download(&self, filename: &str) -> Result<PathBuf> {
            self.attempts.lock().unwrap().push(filename.to_string());

            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TranslationError::InternalError("connection reset".to_string()));
            }

            self.cached.lock().unwrap().insert(filename.to_string());
            Ok(self.root.join(filename))
        }
    }

    fn config(filenames: &[&str]) -> TranslatorConfig {
        TranslatorConfig {
            model_id: "org/nanai-t5".to_string(),
            filenames: filenames.iter().map(|f| f.to_string()).collect(),
            download_retry_delay_ms: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_fully_cached_model_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let hub = StubHub::new(dir.path(), &["config.json", "model.safetensors"]);

        let cached = ensure_cached(&config(&["config.json", "model.safetensors"]), &hub).unwrap();

        assert!(hub.attempts().is_empty());
        assert_eq!(cached.len(), 2);
        assert_eq!(cached.weight_paths(), vec![dir.path().join("model.safetensors").as_path()]);
    }

    #[test]
    fn test_one_download_per_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        // config.json alone being cached must not mask missing weights
        let hub = StubHub::new(dir.path(), &["config.json"]);
        let config = config(&["config.json", "model.safetensors", "tokenizer.json"]);

        let cached = ensure_cached(&config, &hub).unwrap();

        assert_eq!(hub.attempts(), vec!["model.safetensors", "tokenizer.json"]);
        assert_eq!(cached.path("tokenizer.json").unwrap(), dir.path().join("tokenizer.json"));
        assert!(cached.path("spiece.model").is_err());
    }

    #[test]
    fn test_download_retries_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let hub = StubHub::new(dir.path(), &["config.json"]).failing(2);

        let cached = ensure_cached(&config(&["config.json", "model.safetensors"]), &hub).unwrap();

        assert_eq!(hub.attempts().len(), 3);
        assert!(cached.get("model.safetensors").is_some());
    }

    #[test]
    fn test_download_gives_up_after_max_retries() {
        let dir = tempfile::tempdir().unwrap();
        let hub = StubHub::new(dir.path(), &[]).failing(10);
        let config = TranslatorConfig {
            download_max_retries: 1,
            ..config(&["config.json", "model.safetensors"])
        };

        let result = ensure_cached(&config, &hub);

        assert!(matches!(result, Err(TranslationError::DownloadError { ref file, .. }) if file == "config.json"));
        assert_eq!(hub.attempts(), vec!["config.json", "config.json"]);
    }

    #[test]
    fn test_backoff_doubles_and_is_capped() {
        assert_eq!(backoff_delay(1000, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1000, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(1000, 64), MAX_RETRY_DELAY);
        assert_eq!(backoff_delay(u64::MAX, 200), MAX_RETRY_DELAY);
        assert_eq!(backoff_delay(0, 100), Duration::ZERO);
    }

    #[test]
    fn test_offline_mode_never_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let hub = StubHub::new(dir.path(), &["config.json"]);
        let config = TranslatorConfig {
            offline: true,
            ..config(&["config.json", "model.safetensors"])
        };

        let result = ensure_cached(&config, &hub);

        assert!(matches!(result, Err(TranslationError::DownloadError { ref file, .. }) if file == "model.safetensors"));
        assert!(hub.attempts().is_empty());
    }

    #[test]
    fn test_hf_hub_reads_existing_cache_layout() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("models--org--nanai-t5");
        let snapshot = repo.join("snapshots").join("0123abcd");
        std::fs::create_dir_all(repo.join("refs")).unwrap();
        std::fs::create_dir_all(&snapshot).unwrap();
        std::fs::write(repo.join("refs").join("main"), "0123abcd").unwrap();
        std::fs::write(snapshot.join("config.json"), "{}").unwrap();
        std::fs::write(snapshot.join("model.safetensors"), b"weights").unwrap();

        let config = TranslatorConfig {
            cache_dir: dir.path().to_path_buf(),
            offline: true,
            ..config(&["config.json", "model.safetensors"])
        };
        let hub = HfHub::new(&config).unwrap();

        let cached = ensure_cached(&config, &hub).unwrap();
        assert_eq!(cached.path("config.json").unwrap(), snapshot.join("config.json"));

        assert!(hub.cached_path("tokenizer.json").is_none());
        assert!(matches!(
            hub.download("tokenizer.json"),
            Err(TranslationError::DownloadError { .. })
        ));
    }
}
