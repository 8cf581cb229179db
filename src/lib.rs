pub mod cache;
pub mod codec;
pub mod debounce;
pub mod notes;
pub mod paths;
pub mod scanner;
pub mod store;

#[cfg(test)]
mod cache_ops_test;



use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub use cache::{Card, CardPatch, MetadataCache, VersionEntry};
pub use codec::{CardCodec, CardData, JsonCardCodec};
pub use notes::{CardNote, NoteStore, Remark};
pub use store::{CardRecord, CardStore, ScanState};

use debounce::{Debouncer, EventSuppressor};
use scanner::watcher::LibraryWatcher;
use scanner::{ScanContext, ScanScheduler, ScanTask};

/// Construction-time settings for a library instance. Config file loading
/// belongs to the embedding application; this is plain data.
#[derive(Debug, Clone)]
pub struct LibraryConfig {
    /// The watched card library root.
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub notes_path: PathBuf,
    /// Start the filesystem watcher (out-of-band change detection).
    pub watch: bool,
    /// Quiet period before a scheduled cache reload runs.
    pub reload_delay: Duration,
    /// Quiet period before a burst of watch events queues one scan.
    pub scan_debounce: Duration,
}

impl LibraryConfig {
    /// Defaults place the database and sidecar notes under
    /// `<root>/.cardvault/`, which the hidden-name filter keeps out of
    /// every walk and scan.
    pub fn new(root: &Path) -> Self {
        let data_dir = root.join(".cardvault");
        Self {
            root: root.to_path_buf(),
            db_path: data_dir.join("metadata.db"),
            notes_path: data_dir.join("notes.json"),
            watch: true,
            reload_delay: Duration::from_millis(800),
            scan_debounce: Duration::from_secs(1),
        }
    }
}

/// The composition root owning every piece of the indexing core: the
/// persistent store, the in-memory metadata cache, the codec seam, the
/// scan worker and the watcher. Route handlers receive a shared reference
/// to one instance; there is no hidden global.
pub struct CardLibrary {
    config: LibraryConfig,
    store: Arc<CardStore>,
    notes: Arc<NoteStore>,
    cache: Arc<MetadataCache>,
    codec: Arc<dyn CardCodec>,
    suppressor: Arc<EventSuppressor>,
    reload: Arc<Debouncer>,
    scan: ScanScheduler,
    scan_tx: Sender<ScanTask>,
    worker: Option<JoinHandle<()>>,
    _watcher: Option<LibraryWatcher>,
}

impl CardLibrary {
    /// Open with the built-in JSON codec.
    pub fn open(config: LibraryConfig) -> Result<Self, String> {
        Self::open_with_codec(config, Arc::new(JsonCardCodec))
    }

    pub fn open_with_codec(
        config: LibraryConfig,
        codec: Arc<dyn CardCodec>,
    ) -> Result<Self, String> {
        std::fs::create_dir_all(&config.root)
            .map_err(|e| format!("Failed to create library root: {}", e))?;

        let store = Arc::new(CardStore::open(&config.db_path)?);
        let notes = Arc::new(NoteStore::new(&config.notes_path));
        let cache = Arc::new(MetadataCache::new(&config.root));

        let ctx = ScanContext {
            root: config.root.clone(),
            store: Arc::clone(&store),
            codec: Arc::clone(&codec),
        };

        // A database created just now means the library has never been
        // indexed; populate it from the files before the first load.
        if store.is_fresh() {
            scanner::import_library(&ctx)?;
        }

        let reload_cache = Arc::clone(&cache);
        let reload_store = Arc::clone(&store);
        let reload_notes = Arc::clone(&notes);
        let reload = Arc::new(Debouncer::new(config.reload_delay, move |reason| {
            log::debug!("[Cache] reload ({})", reason);
            if let Err(e) = reload_cache.rebuild(&reload_store, &reload_notes) {
                log::error!("Scheduled reload failed: {}", e);
            }
        }));

        // First load. On failure the cache stays uninitialized and the
        // next read triggers a synchronous retry.
        if let Err(e) = cache.rebuild(&store, &notes) {
            log::error!("Initial cache load failed, index not initialized yet: {}", e);
        }

        let (scan_tx, scan_rx) = mpsc::channel();
        let worker = scanner::spawn_worker(scan_rx, ctx, Arc::clone(&reload));

        let queue_tx = scan_tx.clone();
        let scan_debounce = Arc::new(Debouncer::new(config.scan_debounce, move |reason| {
            let _ = queue_tx.send(ScanTask::Scan {
                reason: reason.to_string(),
            });
        }));
        let scan = ScanScheduler::new(scan_debounce);

        let suppressor = Arc::new(EventSuppressor::new());
        let watcher = if config.watch {
            match LibraryWatcher::start(&config.root, Arc::clone(&suppressor), scan.clone()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Failed to start file system watcher: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            notes,
            cache,
            codec,
            suppressor,
            reload,
            scan,
            scan_tx,
            worker: Some(worker),
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn index(&self) -> &MetadataCache {
        &self.cache
    }

    pub fn store(&self) -> &CardStore {
        &self.store
    }

    pub fn notes(&self) -> &NoteStore {
        &self.notes
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    /// Display list snapshot, loading synchronously if a read arrives
    /// before the first successful rebuild.
    pub fn cards(&self) -> Vec<Arc<Card>> {
        if let Err(e) = self.cache.ensure_initialized(&self.store, &self.notes) {
            log::error!("Cache load failed: {}", e);
        }
        self.cache.snapshot()
    }

    pub fn card(&self, id: &str) -> Option<Arc<Card>> {
        self.cache.get(id)
    }

    pub fn global_tags(&self) -> Vec<String> {
        self.cache.global_tags()
    }

    pub fn category_counts(&self) -> std::collections::HashMap<String, i64> {
        self.cache.category_counts()
    }

    pub fn visible_folders(&self) -> Vec<String> {
        self.cache.visible_folders()
    }

    pub fn bundle_leader(&self, bundle_dir: &str) -> Option<String> {
        self.cache.bundle_leader(bundle_dir)
    }

    // ------------------------------------------------------------------
    // Incremental mutation surface (the fast path for route handlers
    // that already wrote the authoritative file)
    // ------------------------------------------------------------------

    pub fn update_fields(&self, id: &str, patch: &CardPatch) -> Option<Arc<Card>> {
        self.cache.update_fields(id, patch)
    }

    pub fn move_card(
        &self,
        old_id: &str,
        new_id: &str,
        old_category: &str,
        new_category: &str,
        new_filename: &str,
        full_path: &Path,
    ) -> bool {
        self.cache
            .move_card(old_id, new_id, old_category, new_category, new_filename, full_path)
    }

    pub fn move_bundle(
        &self,
        old_dir: &str,
        new_dir: &str,
        old_category: &str,
        new_category: &str,
    ) -> bool {
        self.cache.move_bundle(old_dir, new_dir, old_category, new_category)
    }

    pub fn move_folder(&self, old_prefix: &str, new_prefix: &str) -> bool {
        self.cache.move_folder(old_prefix, new_prefix)
    }

    pub fn add_card(&self, card: Card) {
        self.cache.add_card(card);
    }

    pub fn delete_card(&self, id: &str) -> bool {
        self.cache.delete_card(id)
    }

    pub fn delete_bundle(&self, bundle_dir: &str) -> bool {
        self.cache.delete_bundle(bundle_dir)
    }

    pub fn update_tags(&self, id: &str, new_tags: &[String]) -> bool {
        self.cache.update_tags(id, new_tags)
    }

    /// Persist and cache a favorite flag change.
    pub fn set_favorite(&self, id: &str, favorite: bool) -> Result<bool, String> {
        let stored = self.store.set_favorite(id, favorite)?;
        let cached = self.cache.toggle_favorite(id, favorite);
        Ok(stored || cached)
    }

    /// Re-extract a card after a write this subsystem was notified about,
    /// refreshing the persistent record (favorite flag preserved, hash
    /// recomputed eagerly since this is a single file) and patching the
    /// cached entry. Returns the updated entry if the id is cached.
    pub fn refresh_card(&self, id: &str) -> Result<Option<Arc<Card>>, String> {
        let full_path = paths::resolve(&self.config.root, id);
        let data = self.codec.extract(&full_path)?;

        let meta = std::fs::metadata(&full_path)
            .map_err(|e| format!("Failed to stat {}: {}", full_path.display(), e))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(paths::system_time_seconds)
            .unwrap_or(0.0);
        let (file_hash, file_size) = scanner::hash_file(&full_path).unwrap_or_default();
        let favorite = self.store.get(id)?.map(|r| r.favorite).unwrap_or(false);

        let record = CardRecord {
            id: id.to_string(),
            name: data.name.clone(),
            description: data.description.clone(),
            first_mes: data.first_mes.clone(),
            mes_example: data.mes_example.clone(),
            tags: data.tags.clone(),
            category: paths::parent_category(id).to_string(),
            creator: data.creator.clone(),
            version: data.version.clone(),
            last_modified: mtime,
            file_hash: file_hash.clone(),
            file_size,
            token_count: codec::estimate_tokens(&data),
            has_lore_book: data.has_lore_book,
            lore_book_name: data.lore_book_name.clone(),
            favorite,
        };
        self.store.upsert(&record)?;

        let patch = CardPatch {
            name: Some(data.name),
            tags: Some(data.tags),
            creator: Some(data.creator),
            version: Some(data.version),
            last_modified: Some(mtime),
            file_hash: Some(file_hash),
            file_size: Some(file_size),
            token_count: Some(record.token_count),
            has_lore_book: Some(data.has_lore_book),
            lore_book_name: Some(data.lore_book_name),
            ..Default::default()
        };
        Ok(self.cache.update_fields(id, &patch))
    }

    // ------------------------------------------------------------------
    // Reconciliation controls
    // ------------------------------------------------------------------

    /// Debounced cache rebuild; bursts collapse into one.
    pub fn schedule_reload(&self, reason: &str) {
        self.reload.signal(reason);
    }

    /// Cancel any pending reload and rebuild synchronously, for callers
    /// that must return the freshly aggregated view.
    pub fn force_reload(&self, reason: &str) {
        self.reload.force(reason);
    }

    /// Debounced scan request; the scan queues after the quiet period.
    pub fn request_scan(&self, reason: &str) {
        self.scan.request(reason);
    }

    /// Ignore watch events for the given window. Called before a batch of
    /// self-initiated writes so they cannot trigger a redundant scan.
    pub fn suppress_events(&self, window: Duration) {
        self.suppressor.suppress_for(window);
    }

    /// Run one reconciliation cycle through the worker queue (keeping
    /// scans single-flight) and wait for it; on changes the cache is
    /// rebuilt before returning.
    pub fn scan_now(&self, reason: &str) -> Result<bool, String> {
        let (done_tx, done_rx) = mpsc::channel();
        self.scan_tx
            .send(ScanTask::ScanSync {
                reason: reason.to_string(),
                done: done_tx,
            })
            .map_err(|_| "scan worker is not running".to_string())?;

        match done_rx.recv_timeout(Duration::from_secs(300)) {
            Ok(result) => {
                let changed = result?;
                if changed {
                    self.force_reload(&format!("scan:{}", reason));
                }
                Ok(changed)
            }
            Err(_) => Err("scan timed out".to_string()),
        }
    }
}

impl Drop for CardLibrary {
    fn drop(&mut self) {
        let _ = self.scan_tx.send(ScanTask::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
