//! Content-addressed template cache, keyed by the SHA-256 of the template
//! file's bytes, with LRU-by-last-access eviction under a single write lock
//! and a background sweep for stale entries. The rest of the workspace
//! reaches for `dashmap` for concurrent maps; this one needs ordered LRU
//! eviction across the whole map, so a single `parking_lot::Mutex`-guarded
//! structure is the better fit.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bulkmail_common::error::Error;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// A parsed template, opaque to the cache: callers render it themselves.
#[derive(Debug, Clone)]
pub struct Template {
    pub source: Arc<str>,
}

impl Template {
    fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let source = std::str::from_utf8(bytes)
            .map_err(|e| Error::Internal(format!("template is not valid UTF-8: {e}")))?;
        Ok(Self {
            source: Arc::from(source),
        })
    }
}

struct Entry {
    template: Template,
    last_access: Instant,
}

struct Inner {
    entries: HashMap<[u8; 32], Entry>,
}

/// Configuration for the cache.
#[derive(Debug, Clone)]
pub struct TemplateCacheConfig {
    pub max_age: Duration,
    pub max_size: usize,
}

impl Default for TemplateCacheConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 60),
            max_size: 256,
        }
    }
}

/// The template cache.
pub struct TemplateCache {
    config: TemplateCacheConfig,
    inner: Mutex<Inner>,
}

impl TemplateCache {
    #[must_use]
    pub fn new(config: TemplateCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
            }),
        }
    }

    /// Hashes `path`'s contents, returning the cached parse on a hit or
    /// parsing and inserting on a miss, evicting the least-recently-used
    /// entry first if the cache is at capacity.
    ///
    /// # Errors
    /// Returns an `Error::Io` if the file cannot be read, or `Error::Internal`
    /// if it is not valid UTF-8.
    pub async fn get(&self, path: &Path) -> Result<Template, Error> {
        let bytes = tokio::fs::read(path).await?;
        let key = content_key(&bytes);

        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.last_access = Instant::now();
                return Ok(entry.template.clone());
            }
        }

        let template = Template::parse(&bytes)?;

        let mut inner = self.inner.lock();
        // Another task may have raced us to parse the same content; prefer
        // the already-inserted entry to avoid double work being observable.
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.last_access = Instant::now();
            return Ok(entry.template.clone());
        }

        if inner.entries.len() >= self.config.max_size {
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| *key)
            {
                inner.entries.remove(&lru_key);
            }
        }

        inner.entries.insert(
            key,
            Entry {
                template: template.clone(),
                last_access: Instant::now(),
            },
        );

        Ok(template)
    }

    /// Evicts entries whose `last_access` age exceeds `max_age`. Intended to
    /// be driven by a background task waking every `max_age / 2`.
    pub fn evict_stale(&self) {
        let mut inner = self.inner.lock();
        let max_age = self.config.max_age;
        inner.entries.retain(|_, entry| entry.last_access.elapsed() <= max_age);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns the background eviction task, returning a handle that cancels the
/// sweep when dropped.
pub fn spawn_eviction_task(cache: Arc<TemplateCache>) -> tokio::task::JoinHandle<()> {
    let interval = cache.config.max_age / 2;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        loop {
            ticker.tick().await;
            cache.evict_stale();
        }
    })
}

fn content_key(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &str) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), contents).unwrap();
        file
    }

    #[tokio::test]
    async fn get_parses_and_caches_on_miss() {
        let cache = TemplateCache::new(TemplateCacheConfig::default());
        let file = write_temp("Hello {{ name }}");

        let template = cache.get(file.path()).await.unwrap();
        assert_eq!(&*template.source, "Hello {{ name }}");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn get_hits_cache_for_identical_content() {
        let cache = TemplateCache::new(TemplateCacheConfig::default());
        let file = write_temp("same content");

        cache.get(file.path()).await.unwrap();
        cache.get(file.path()).await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn eviction_drops_entries_at_capacity() {
        let cache = TemplateCache::new(TemplateCacheConfig {
            max_age: Duration::from_secs(600),
            max_size: 1,
        });

        let first = write_temp("first");
        let second = write_temp("second");

        cache.get(first.path()).await.unwrap();
        cache.get(second.path()).await.unwrap();

        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn evict_stale_removes_old_entries() {
        let cache = TemplateCache::new(TemplateCacheConfig {
            max_age: Duration::from_millis(1),
            max_size: 10,
        });
        let file = write_temp("stale soon");
        cache.get(file.path()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.evict_stale();

        assert!(cache.is_empty());
    }
}
