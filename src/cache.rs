//! [ContactCache]: path-keyed loader for contact records.
//!
//! Entries hold a strong [Arc] while they are in use. Each [ContactCache::tick] without a hit
//! counts an entry's TTL down, and at zero the strong handle is dropped. A [Weak] handle stays
//! behind, so a caller still holding the record can be served the same instance. Every lookup
//! compares the file's modification time with the one recorded at load, so a stale record is
//! never returned.

use enumset::EnumSet;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::{Instant, SystemTime},
};
use walkdir::WalkDir;

use crate::{
    codec::schema::Schema,
    config::{CacheSettings, ContactsConfig},
    error::ContactError,
    paths::{is_within, lexical_normalize, normalize_key},
    properties::{ContactId, ContactType},
    store::{ContactProperties, ReadonlyStore},
};

#[derive(Debug)]
struct CacheEntry {
    path: PathBuf,
    strong: Option<Arc<ReadonlyStore>>,
    weak: Weak<ReadonlyStore>,
    modified: SystemTime,
    ttl: u32,
}

#[derive(Debug)]
pub struct ContactCache {
    root: PathBuf,
    /// `root` with symlinks resolved, when that differs.
    real_root: Option<PathBuf>,
    schema: Arc<Schema>,
    settings: CacheSettings,
    use_subfolders: bool,
    types: EnumSet<ContactType>,
    entries: HashMap<String, CacheEntry>,
    last_tick: Instant,
}

impl ContactCache {
    pub fn new<P: AsRef<Path>>(root: P, schema: Arc<Schema>, settings: CacheSettings) -> Self {
        let root = root.as_ref();
        let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
        let root = lexical_normalize(root);
        let real_root = std::fs::canonicalize(&root).ok().filter(|real| real != &root);
        ContactCache {
            root,
            real_root,
            schema,
            settings,
            use_subfolders: true,
            types: EnumSet::all(),
            entries: HashMap::new(),
            last_tick: Instant::now(),
        }
    }

    pub fn from_config(config: &ContactsConfig, schema: Arc<Schema>) -> Self {
        let mut cache = ContactCache::new(&config.root_dir, schema, config.cache.clone());
        cache.use_subfolders = config.use_subfolders;
        cache.types = config.types;
        cache
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    pub fn types(&self) -> EnumSet<ContactType> {
        self.types
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        self.settings.tick_interval()
    }

    pub fn use_subfolders(&self) -> bool {
        self.use_subfolders
    }

    /// Absolute, normalized form of `path` beneath the cache root. Relative paths are taken
    /// relative to the root. Anything outside the root is [ContactError::NotFound].
    pub fn resolve<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf, ContactError> {
        let path = path.as_ref();
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let normalized = lexical_normalize(joined);
        if is_within(&self.root, &normalized) {
            return Ok(normalized);
        }
        if let Some(real_root) = &self.real_root {
            if is_within(real_root, &normalized) {
                let rest = normalized.strip_prefix(real_root)?;
                return Ok(self.root.join(rest));
            }
        }
        Err(ContactError::NotFound(format!(
            "{path:?} is outside of {:?}",
            self.root
        )))
    }

    /// Load `path`, serving the cached record when the file is unchanged.
    pub fn get<P: AsRef<Path>>(&mut self, path: P) -> Result<Arc<ReadonlyStore>, ContactError> {
        let path = self.resolve(path)?;
        let key = normalize_key(&path);
        let modified = match std::fs::metadata(&path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                if self.entries.remove(&key).is_some() {
                    tracing::debug!("[ContactCache] {path:?} is gone, evicted");
                }
                return Err(err.into());
            }
        };

        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.modified == modified {
                let live = entry.strong.clone().or_else(|| entry.weak.upgrade());
                if let Some(store) = live {
                    entry.strong = Some(store.clone());
                    entry.ttl = self.settings.ttl_ticks;
                    tracing::trace!("[ContactCache] hit {path:?}");
                    return Ok(store);
                }
            }
            tracing::debug!("[ContactCache] {path:?} changed on disk, reloading");
            self.entries.remove(&key);
        }

        let store = Arc::new(ReadonlyStore::load(&path, self.schema.clone())?);
        self.entries.insert(
            key,
            CacheEntry {
                path,
                weak: Arc::downgrade(&store),
                strong: Some(store.clone()),
                modified,
                ttl: self.settings.ttl_ticks,
            },
        );
        Ok(store)
    }

    /// Lazily load every record of the given types under the root. Files that fail to load are
    /// logged and skipped.
    pub fn get_all(
        &mut self,
        types: EnumSet<ContactType>,
    ) -> impl Iterator<Item = (PathBuf, Arc<ReadonlyStore>)> + '_ {
        let max_depth = if self.use_subfolders { usize::MAX } else { 1 };
        WalkDir::new(&self.root)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::warn!("[ContactCache] skipping unreadable directory entry: {err}");
                        return None;
                    }
                };
                if !entry.file_type().is_file() || !ContactType::matches(types, entry.path()) {
                    return None;
                }
                let path = entry.into_path();
                match self.get(&path) {
                    Ok(store) => Some((path, store)),
                    Err(err) => {
                        tracing::warn!("[ContactCache] skipping {path:?}: {err}");
                        None
                    }
                }
            })
    }

    /// First record under the root whose ContactID is `id`.
    pub fn find_by_id(&mut self, id: ContactId) -> Option<(PathBuf, Arc<ReadonlyStore>)> {
        let types = self.types;
        self.get_all(types)
            .find(|(_, store)| store.contact_id().map_or(false, |found| found == id))
    }

    /// Age every entry by one tick. Expired entries drop their strong handle. Entries nobody
    /// else holds are purged.
    pub fn tick(&mut self) {
        self.last_tick = Instant::now();
        self.entries.retain(|_, entry| {
            if entry.strong.is_some() {
                entry.ttl = entry.ttl.saturating_sub(1);
                if entry.ttl > 0 {
                    return true;
                }
                entry.strong = None;
                tracing::trace!("[ContactCache] demoted {:?}", entry.path);
            }
            let alive = entry.weak.strong_count() > 0;
            if !alive {
                tracing::debug!("[ContactCache] purged {:?}", entry.path);
            }
            alive
        });
    }

    /// Run [ContactCache::tick] if the tick interval has passed since the last one.
    pub fn maybe_tick(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_tick) < self.settings.tick_interval() {
            return false;
        }
        self.tick();
        true
    }

    pub fn invalidate<P: AsRef<Path>>(&mut self, path: P) -> bool {
        match self.resolve(path) {
            Ok(path) => self.entries.remove(&normalize_key(path)).is_some(),
            Err(_) => false,
        }
    }

    /// Entries with a strong handle.
    pub fn is_retained<P: AsRef<Path>>(&self, path: P) -> bool {
        self.resolve(path)
            .ok()
            .and_then(|path| self.entries.get(&normalize_key(path)))
            .map_or(false, |entry| entry.strong.is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
