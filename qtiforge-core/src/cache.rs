use crate::types::Segmentation;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Version constants for cache invalidation
pub mod versions {
    pub const QTIFORGE_VERSION: &str = env!("CARGO_PKG_VERSION");
    pub const SEGMENTATION_VERSION: &str = "1.0.0";
}

/// Segmentation cache key (PDF + segmentation config → chunks)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SegmentationCacheKey {
    pub pdf_hash: String,
    pub config_hash: String,
    pub qtiforge_version: String,
    pub segmentation_version: String,
}

impl SegmentationCacheKey {
    pub fn new(pdf_hash: String, config_hash: String) -> Self {
        Self {
            pdf_hash,
            config_hash,
            qtiforge_version: versions::QTIFORGE_VERSION.to_string(),
            segmentation_version: versions::SEGMENTATION_VERSION.to_string(),
        }
    }

    pub fn to_cache_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.pdf_hash);
        hasher.update(&self.config_hash);
        hasher.update(&self.qtiforge_version);
        hasher.update(&self.segmentation_version);
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationCacheValue {
    pub segmentation: Segmentation,
    pub created_at: DateTime<Utc>,
    pub processing_time_ms: u64,
    pub cache_version: String,
}

impl SegmentationCacheValue {
    pub fn new(segmentation: Segmentation, processing_time_ms: u64) -> Self {
        Self {
            segmentation,
            created_at: Utc::now(),
            processing_time_ms,
            cache_version: versions::QTIFORGE_VERSION.to_string(),
        }
    }
}

/// Cache for segmentation results.
///
/// Only segmentation is cached: it is the expensive, model-dependent step
/// and everything after it is cheap to redo.
pub trait SegmentationCache: Send + Sync {
    fn get(&self, key: &SegmentationCacheKey) -> Result<Option<SegmentationCacheValue>>;
    fn store(&self, key: &SegmentationCacheKey, value: &SegmentationCacheValue) -> Result<()>;
}

/// File-based cache under a local directory
pub struct FileCache {
    cache_dir: PathBuf,
}

impl FileCache {
    pub fn new(cache_dir: impl AsRef<Path>) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().join("segmentation");
        fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    fn entry_path(&self, key: &SegmentationCacheKey) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key.to_cache_hash()))
    }
}

impl SegmentationCache for FileCache {
    fn get(&self, key: &SegmentationCacheKey) -> Result<Option<SegmentationCacheValue>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let json_str = fs::read_to_string(&path)?;
        match serde_json::from_str(&json_str) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                // Stale layout from an older build: treat as a miss
                log::warn!("⚠️  Ignoring unreadable cache entry {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    fn store(&self, key: &SegmentationCacheKey, value: &SegmentationCacheValue) -> Result<()> {
        let json_str = serde_json::to_string_pretty(value)
            .map_err(|e| anyhow!("Failed to serialize segmentation cache entry: {}", e))?;
        fs::write(self.entry_path(key), json_str)?;
        Ok(())
    }
}

/// Disables caching
#[derive(Default)]
pub struct NoOpCache;

impl SegmentationCache for NoOpCache {
    fn get(&self, _key: &SegmentationCacheKey) -> Result<Option<SegmentationCacheValue>> {
        Ok(None) // Always cache miss
    }

    fn store(&self, _key: &SegmentationCacheKey, _value: &SegmentationCacheValue) -> Result<()> {
        Ok(())
    }
}

/// SHA-256 of the whole PDF.
pub fn calculate_pdf_hash(pdf_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pdf_bytes.len().to_le_bytes());
    hasher.update(pdf_bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash of any serializable config section, via its JSON form.
pub fn calculate_config_hash<T: Serialize>(config: &T) -> Result<String> {
    let config_json = serde_json::to_string(config)
        .map_err(|e| anyhow!("Failed to serialize config for hashing: {}", e))?;

    let mut hasher = Sha256::new();
    hasher.update(config_json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentationConfig;
    use crate::types::SegmentationStrategy;

    #[test]
    fn test_pdf_hash_consistency() {
        let pdf_data = b"%PDF-1.7 test content";
        assert_eq!(calculate_pdf_hash(pdf_data), calculate_pdf_hash(pdf_data));
        assert_ne!(calculate_pdf_hash(b"%PDF-1.7 a"), calculate_pdf_hash(b"%PDF-1.7 b"));
    }

    #[test]
    fn test_config_hash_tracks_changes() {
        let a = SegmentationConfig::default();
        let b = SegmentationConfig {
            llm_split_page_threshold: 10,
            ..SegmentationConfig::default()
        };
        assert_ne!(calculate_config_hash(&a).unwrap(), calculate_config_hash(&b).unwrap());
    }

    #[test]
    fn test_file_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        let key = SegmentationCacheKey::new("pdf".into(), "cfg".into());
        assert!(cache.get(&key).unwrap().is_none());

        let value = SegmentationCacheValue::new(
            Segmentation {
                chunks: vec![],
                shared_contexts: vec![],
                strategy: SegmentationStrategy::Direct,
                page_count: 2,
                missing_questions: vec![],
            },
            12,
        );
        cache.store(&key, &value).unwrap();
        let cached = cache.get(&key).unwrap().unwrap();
        assert_eq!(cached.segmentation.page_count, 2);
    }
}
