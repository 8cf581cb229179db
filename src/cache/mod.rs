use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

use crate::notes::{CardNote, NoteStore};
use crate::paths::{self, BUNDLE_MARKER};
use crate::store::{CardRecord, CardStore};

/// One version stub inside a bundle, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionEntry {
    pub id: String,
    pub filename: String,
    pub last_modified: f64,
    pub version: String,
}

/// One display entity: a plain card, or the synthetic card representing a
/// version bundle. Bundles borrow every field from their leading version
/// and carry the full version list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Card {
    pub id: String,
    pub filename: String,
    pub name: String,
    pub tags: Vec<String>,
    pub category: String,
    pub creator: String,
    pub version: String,
    pub last_modified: f64,
    pub file_hash: String,
    pub file_size: i64,
    pub token_count: i64,
    pub favorite: bool,
    pub has_lore_book: bool,
    pub lore_book_name: String,
    /// Directory prefix of the physical file (for a bundle: the bundle
    /// directory, since the borrowed id lives inside it).
    pub dir_path: String,
    pub is_bundle: bool,
    pub bundle_dir: String,
    pub versions: Vec<VersionEntry>,
    pub summary: String,
    pub link: String,
    pub resource_folder: String,
    pub image_url: String,
    pub thumb_url: String,
}

impl Card {
    pub fn from_record(record: &CardRecord) -> Card {
        let id = record.id.replace('\\', "/");
        let filename = id.rsplit('/').next().unwrap_or("").to_string();
        let dir_path = paths::parent_category(&id).to_string();

        let mut card = Card {
            filename,
            dir_path,
            name: record.name.clone(),
            tags: record.tags.clone(),
            category: record.category.replace('\\', "/"),
            creator: record.creator.clone(),
            version: record.version.clone(),
            last_modified: record.last_modified,
            file_hash: record.file_hash.clone(),
            file_size: record.file_size,
            token_count: record.token_count,
            favorite: record.favorite,
            has_lore_book: record.has_lore_book,
            lore_book_name: record.lore_book_name.clone(),
            is_bundle: false,
            bundle_dir: String::new(),
            versions: Vec::new(),
            summary: String::new(),
            link: String::new(),
            resource_folder: String::new(),
            image_url: String::new(),
            thumb_url: String::new(),
            id,
        };
        card.refresh_urls();
        card
    }

    pub fn refresh_urls(&mut self) {
        let (image_url, thumb_url) = paths::card_urls(&self.id, self.last_modified);
        self.image_url = image_url;
        self.thumb_url = thumb_url;
    }

    /// Merge sidecar annotations. Bundles key by their directory with a
    /// fallback to the leading card id.
    fn apply_notes(&mut self, notes: &HashMap<String, CardNote>) {
        let note = if self.is_bundle {
            notes
                .get(self.bundle_dir.as_str())
                .or_else(|| notes.get(self.id.as_str()))
        } else {
            notes.get(self.id.as_str())
        };

        if let Some(note) = note {
            self.summary = note.summary.clone();
            self.link = note.link.clone();
            self.resource_folder = note.resource_folder.clone();
        }
    }
}

/// Field-level patch for [`MetadataCache::update_fields`]; only present
/// fields are applied.
#[derive(Debug, Clone, Default)]
pub struct CardPatch {
    pub name: Option<String>,
    pub tags: Option<Vec<String>>,
    pub category: Option<String>,
    pub creator: Option<String>,
    pub version: Option<String>,
    pub last_modified: Option<f64>,
    pub file_hash: Option<String>,
    pub file_size: Option<i64>,
    pub token_count: Option<i64>,
    pub favorite: Option<bool>,
    pub has_lore_book: Option<bool>,
    pub lore_book_name: Option<String>,
    pub summary: Option<String>,
    pub link: Option<String>,
    pub resource_folder: Option<String>,
}

#[derive(Default)]
struct CacheInner {
    /// Display order. Bundle member versions are not listed individually.
    cards: Vec<Arc<Card>>,
    /// Every known id, including every bundle version id, mapping to the
    /// owning display entity.
    id_map: HashMap<String, Arc<Card>>,
    /// Bundle directory -> leading card id.
    bundle_map: HashMap<String, String>,
    global_tags: Vec<String>,
    category_counts: HashMap<String, i64>,
    visible_folders: Vec<String>,
    initialized: bool,
}

/// The in-memory metadata index serving every list/browse query. One
/// instance per library, owned by the composition root. A single mutex
/// guards the whole structure; mutations are short and never do I/O under
/// the lock, and `rebuild` constructs a fresh structure outside the lock
/// and swaps it in.
///
/// Entries are `Arc<Card>` so a list snapshot is a copy of references;
/// incremental updates build a patched card and swap the Arc at every
/// alias, leaving snapshots already handed out internally consistent.
pub struct MetadataCache {
    root: PathBuf,
    inner: Mutex<CacheInner>,
}

impl MetadataCache {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    // ------------------------------------------------------------------
    // Full rebuild
    // ------------------------------------------------------------------

    /// Reconstruct the whole index from the store, a live directory walk
    /// and the sidecar notes, then swap it in atomically. On failure the
    /// previous structure (and the initialized flag) stay untouched.
    pub fn rebuild(&self, store: &CardStore, notes: &NoteStore) -> Result<usize, String> {
        let snapshot = self.build_snapshot(store, notes)?;
        let count = snapshot.cards.len();

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| "cache mutex poisoned".to_string())?;
        *inner = snapshot;
        drop(inner);

        log::info!("[Cache] reloaded: {} entries (bundles included)", count);
        Ok(count)
    }

    /// Synchronous load for reads arriving before the first rebuild.
    pub fn ensure_initialized(&self, store: &CardStore, notes: &NoteStore) -> Result<(), String> {
        if self.is_initialized() {
            return Ok(());
        }
        self.rebuild(store, notes).map(|_| ())
    }

    fn build_snapshot(&self, store: &CardStore, notes: &NoteStore) -> Result<CacheInner, String> {
        let physical_folders = self.collect_physical_folders();
        let note_data = notes.load();
        let records = store.fetch_all()?;

        let raw_cards: Vec<Card> = records.iter().map(Card::from_record).collect();

        // Probe each distinct card directory for the bundle sentinel.
        let mut bundle_dirs: HashSet<String> = HashSet::new();
        let unique_dirs: HashSet<&str> = raw_cards.iter().map(|c| c.dir_path.as_str()).collect();
        for dir in unique_dirs {
            if dir.is_empty() {
                continue;
            }
            if paths::resolve(&self.root, dir).join(BUNDLE_MARKER).exists() {
                bundle_dirs.insert(dir.to_string());
            }
        }

        let mut plain: Vec<Card> = Vec::new();
        let mut groups: BTreeMap<String, Vec<Card>> = BTreeMap::new();
        for card in raw_cards {
            if bundle_dirs.contains(&card.dir_path) {
                groups.entry(card.dir_path.clone()).or_default().push(card);
            } else {
                plain.push(card);
            }
        }

        let mut inner = CacheInner::default();
        for mut card in plain {
            card.apply_notes(&note_data);
            push_entry(&mut inner, card);
        }
        for (dir, group) in groups {
            if let Some(mut bundle) = aggregate_bundle(&dir, group) {
                bundle.apply_notes(&note_data);
                push_entry(&mut inner, bundle);
            }
        }

        // Tags, counts and folder sets over the final display entities.
        let mut tags: HashSet<String> = HashSet::new();
        let mut derived_folders: HashSet<String> = HashSet::new();
        let categories: Vec<String> = inner.cards.iter().map(|c| c.category.clone()).collect();
        for card in &inner.cards {
            for tag in &card.tags {
                tags.insert(tag.clone());
            }
        }
        for category in &categories {
            bump(&mut inner.category_counts, category, 1);
            for prefix in paths::ancestor_paths(category) {
                derived_folders.insert(prefix);
            }
        }

        let mut all_visible: HashSet<String> = derived_folders;
        all_visible.extend(physical_folders);
        let mut visible_folders: Vec<String> = all_visible
            .into_iter()
            .filter(|f| !bundle_dirs.contains(f) && !f.is_empty() && f != ".")
            .collect();
        visible_folders.sort();

        // Empty visible folders still get a count entry.
        for folder in &visible_folders {
            inner.category_counts.entry(folder.clone()).or_insert(0);
        }

        let mut global_tags: Vec<String> = tags.into_iter().collect();
        global_tags.sort();

        inner.global_tags = global_tags;
        inner.visible_folders = visible_folders;
        inner.initialized = true;
        Ok(inner)
    }

    /// Every directory under the root, hidden names excluded. A failed
    /// walk degrades to "no physical folders" rather than failing the
    /// rebuild; card-derived folders still appear.
    fn collect_physical_folders(&self) -> HashSet<String> {
        let mut folders = HashSet::new();
        let walker = WalkDir::new(&self.root).into_iter().filter_entry(|e| {
            e.depth() == 0 || !paths::is_hidden_name(&e.file_name().to_string_lossy())
        });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::debug!("[Cache] folder walk: {}", e);
                    continue;
                }
            };
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                continue;
            }
            if let Some(rel) = paths::relative_id(&self.root, entry.path()) {
                folders.insert(rel);
            }
        }
        folders
    }

    // ------------------------------------------------------------------
    // Incremental operations
    // ------------------------------------------------------------------

    /// Merge fields into an existing entry. Category changes adjust the
    /// rolled-up counts; URLs are regenerated from the patched
    /// modification time. Returns the updated entry, or None when the id
    /// is unknown.
    pub fn update_fields(&self, id: &str, patch: &CardPatch) -> Option<Arc<Card>> {
        let mut inner = self.inner.lock().ok()?;
        let old = Arc::clone(inner.id_map.get(id)?);
        let mut card = (*old).clone();
        let old_category = card.category.clone();

        if let Some(v) = &patch.name {
            card.name = v.clone();
        }
        if let Some(v) = &patch.tags {
            card.tags = v.clone();
        }
        if let Some(v) = &patch.category {
            card.category = v.clone();
        }
        if let Some(v) = &patch.creator {
            card.creator = v.clone();
        }
        if let Some(v) = &patch.version {
            card.version = v.clone();
        }
        if let Some(v) = patch.last_modified {
            card.last_modified = v;
        }
        if let Some(v) = &patch.file_hash {
            card.file_hash = v.clone();
        }
        if let Some(v) = patch.file_size {
            card.file_size = v;
        }
        if let Some(v) = patch.token_count {
            card.token_count = v;
        }
        if let Some(v) = patch.favorite {
            card.favorite = v;
        }
        if let Some(v) = patch.has_lore_book {
            card.has_lore_book = v;
        }
        if let Some(v) = &patch.lore_book_name {
            card.lore_book_name = v.clone();
        }
        if let Some(v) = &patch.summary {
            card.summary = v.clone();
        }
        if let Some(v) = &patch.link {
            card.link = v.clone();
        }
        if let Some(v) = &patch.resource_folder {
            card.resource_folder = v.clone();
        }

        if card.category != old_category {
            let new_category = card.category.clone();
            bump(&mut inner.category_counts, &old_category, -1);
            bump(&mut inner.category_counts, &new_category, 1);
        }

        card.refresh_urls();

        if let Some(tags) = &patch.tags {
            merge_tags(&mut inner, tags);
        }

        let updated = Arc::new(card);
        replace_card(&mut inner, &old, &updated);
        Some(updated)
    }

    /// Re-key a single card after a file move or rename. The modification
    /// time is re-read from the moved file.
    pub fn move_card(
        &self,
        old_id: &str,
        new_id: &str,
        old_category: &str,
        new_category: &str,
        new_filename: &str,
        full_path: &Path,
    ) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };
        let old = match inner.id_map.get(old_id) {
            Some(card) => Arc::clone(card),
            None => return false,
        };
        // A non-leading bundle version id aliases the whole bundle; moving
        // one is a bundle or folder operation, not a card move.
        if old.id != old_id {
            return false;
        }

        let mut card = (*old).clone();
        card.id = new_id.to_string();
        card.filename = new_filename.to_string();
        card.category = new_category.to_string();
        card.dir_path = paths::parent_category(new_id).to_string();
        if let Some(mtime) = paths::mtime_seconds(full_path) {
            card.last_modified = mtime;
        }
        card.refresh_urls();

        let updated = Arc::new(card);
        inner.id_map.remove(old_id);
        if let Some(pos) = inner.cards.iter().position(|c| Arc::ptr_eq(c, &old)) {
            inner.cards[pos] = Arc::clone(&updated);
        }
        inner.id_map.insert(new_id.to_string(), updated);

        if old_category != new_category {
            bump(&mut inner.category_counts, old_category, -1);
            bump(&mut inner.category_counts, new_category, 1);
        }
        true
    }

    /// Re-key everything under a moved bundle directory: the display
    /// entity plus every version alias. Only the display entity affects
    /// the category counts.
    pub fn move_bundle(
        &self,
        old_dir: &str,
        new_dir: &str,
        old_category: &str,
        new_category: &str,
    ) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };

        let child_prefix = format!("{}/", old_dir);
        let affected: Vec<String> = inner
            .id_map
            .keys()
            .filter(|k| *k == old_dir || k.starts_with(&child_prefix))
            .cloned()
            .collect();
        if affected.is_empty() {
            return false;
        }

        let mut rewritten: Vec<(Arc<Card>, Arc<Card>)> = Vec::new();
        let mut display_moved = false;
        for key in &affected {
            let old = match inner.id_map.get(key) {
                Some(card) => Arc::clone(card),
                None => continue,
            };
            if rewritten.iter().any(|(o, _)| Arc::ptr_eq(o, &old)) {
                continue;
            }

            let mut card = (*old).clone();
            card.id = rewrite_prefix(&card.id, old_dir, new_dir);
            card.category = new_category.to_string();
            card.dir_path = paths::parent_category(&card.id).to_string();
            if card.is_bundle {
                card.bundle_dir = new_dir.to_string();
                for version in &mut card.versions {
                    version.id = rewrite_prefix(&version.id, old_dir, new_dir);
                }
            }
            card.refresh_urls();

            let updated = Arc::new(card);
            if let Some(pos) = inner.cards.iter().position(|c| Arc::ptr_eq(c, &old)) {
                inner.cards[pos] = Arc::clone(&updated);
                display_moved = true;
            }
            rewritten.push((old, updated));
        }

        for key in &affected {
            if let Some(current) = inner.id_map.remove(key) {
                let updated = rewritten
                    .iter()
                    .find(|(o, _)| Arc::ptr_eq(o, &current))
                    .map(|(_, n)| Arc::clone(n))
                    .unwrap_or(current);
                inner.id_map.insert(rewrite_prefix(key, old_dir, new_dir), updated);
            }
        }

        if let Some(leader) = inner.bundle_map.remove(old_dir) {
            inner
                .bundle_map
                .insert(new_dir.to_string(), rewrite_prefix(&leader, old_dir, new_dir));
        }

        if display_moved && old_category != new_category {
            bump(&mut inner.category_counts, old_category, -1);
            bump(&mut inner.category_counts, new_category, 1);
        }
        true
    }

    /// Re-key every id strictly under a renamed folder prefix. Folder
    /// renames can touch arbitrarily many categories, so the counts are
    /// recomputed wholesale instead of by deltas.
    pub fn move_folder(&self, old_prefix: &str, new_prefix: &str) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };

        let child_prefix = format!("{}/", old_prefix);
        let affected: Vec<String> = inner
            .id_map
            .keys()
            .filter(|k| k.starts_with(&child_prefix))
            .cloned()
            .collect();

        let mut rewritten: Vec<(Arc<Card>, Arc<Card>)> = Vec::new();
        for key in &affected {
            let old = match inner.id_map.get(key) {
                Some(card) => Arc::clone(card),
                None => continue,
            };
            if rewritten.iter().any(|(o, _)| Arc::ptr_eq(o, &old)) {
                continue;
            }

            let mut card = (*old).clone();
            card.id = rewrite_prefix(&card.id, old_prefix, new_prefix);
            card.category = if card.category == old_prefix
                || card.category.starts_with(&child_prefix)
            {
                rewrite_prefix(&card.category, old_prefix, new_prefix)
            } else {
                paths::parent_category(&card.id).to_string()
            };
            card.dir_path = paths::parent_category(&card.id).to_string();
            if card.is_bundle {
                card.bundle_dir = rewrite_prefix(&card.bundle_dir, old_prefix, new_prefix);
                for version in &mut card.versions {
                    version.id = rewrite_prefix(&version.id, old_prefix, new_prefix);
                }
            }
            card.refresh_urls();

            let updated = Arc::new(card);
            if let Some(pos) = inner.cards.iter().position(|c| Arc::ptr_eq(c, &old)) {
                inner.cards[pos] = Arc::clone(&updated);
            }
            rewritten.push((old, updated));
        }

        for key in &affected {
            if let Some(current) = inner.id_map.remove(key) {
                let updated = rewritten
                    .iter()
                    .find(|(o, _)| Arc::ptr_eq(o, &current))
                    .map(|(_, n)| Arc::clone(n))
                    .unwrap_or(current);
                inner
                    .id_map
                    .insert(rewrite_prefix(key, old_prefix, new_prefix), updated);
            }
        }

        let moved_dirs: Vec<String> = inner
            .bundle_map
            .keys()
            .filter(|d| *d == old_prefix || d.starts_with(&child_prefix))
            .cloned()
            .collect();
        for dir in moved_dirs {
            if let Some(leader) = inner.bundle_map.remove(&dir) {
                inner.bundle_map.insert(
                    rewrite_prefix(&dir, old_prefix, new_prefix),
                    rewrite_prefix(&leader, old_prefix, new_prefix),
                );
            }
        }

        let mut visible: Vec<String> = inner
            .visible_folders
            .iter()
            .map(|f| rewrite_prefix(f, old_prefix, new_prefix))
            .collect();
        visible.sort();
        let folders_changed = visible != inner.visible_folders;
        inner.visible_folders = visible;

        recalculate_counts(&mut inner);
        !affected.is_empty() || folders_changed
    }

    /// Append a fully-built display entity (the caller synthesizes it via
    /// [`Card::from_record`] or bundle aggregation).
    pub fn add_card(&self, card: Card) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        let category = card.category.clone();
        let tags = card.tags.clone();
        push_entry(&mut inner, card);
        bump(&mut inner.category_counts, &category, 1);
        merge_tags(&mut inner, &tags);
    }

    /// Remove one id. Removing a display entity also drops its aliases
    /// and count; removing a non-leading bundle version id only drops the
    /// alias (the next rebuild refreshes the version list). Absent ids
    /// are a silent no-op returning false.
    pub fn delete_card(&self, id: &str) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };
        let card = match inner.id_map.remove(id) {
            Some(card) => card,
            None => return false,
        };

        if card.id == id {
            if let Some(pos) = inner.cards.iter().position(|c| Arc::ptr_eq(c, &card)) {
                inner.cards.remove(pos);
                let category = card.category.clone();
                bump(&mut inner.category_counts, &category, -1);
            }
            if card.is_bundle {
                for version in &card.versions {
                    if version.id != id {
                        inner.id_map.remove(&version.id);
                    }
                }
                inner.bundle_map.remove(&card.bundle_dir);
            }
        }
        true
    }

    /// Remove a bundle: the display entity and every id under the
    /// directory. The parent category count drops once, not once per
    /// version.
    pub fn delete_bundle(&self, bundle_dir: &str) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };

        let child_prefix = format!("{}/", bundle_dir);
        let doomed: Vec<String> = inner
            .id_map
            .iter()
            .filter(|(key, card)| {
                (card.is_bundle && card.bundle_dir == bundle_dir)
                    || key.starts_with(&child_prefix)
            })
            .map(|(key, _)| key.clone())
            .collect();
        if doomed.is_empty() {
            return false;
        }

        let mut removed_category: Option<String> = None;
        for key in &doomed {
            if let Some(card) = inner.id_map.remove(key) {
                if let Some(pos) = inner.cards.iter().position(|c| Arc::ptr_eq(c, &card)) {
                    removed_category = Some(card.category.clone());
                    inner.cards.remove(pos);
                }
            }
        }
        inner.bundle_map.remove(bundle_dir);

        if let Some(category) = removed_category {
            bump(&mut inner.category_counts, &category, -1);
        }
        true
    }

    pub fn update_tags(&self, id: &str, new_tags: &[String]) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };
        let old = match inner.id_map.get(id) {
            Some(card) => Arc::clone(card),
            None => return false,
        };

        let mut card = (*old).clone();
        card.tags = new_tags.to_vec();
        let updated = Arc::new(card);
        replace_card(&mut inner, &old, &updated);
        merge_tags(&mut inner, new_tags);
        true
    }

    pub fn toggle_favorite(&self, id: &str, favorite: bool) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };
        let old = match inner.id_map.get(id) {
            Some(card) => Arc::clone(card),
            None => return false,
        };

        let mut card = (*old).clone();
        card.favorite = favorite;
        let updated = Arc::new(card);
        replace_card(&mut inner, &old, &updated);
        true
    }

    // ------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------

    /// Shallow copy of the display list; filtering and sorting happen
    /// outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<Card>> {
        self.inner
            .lock()
            .map(|inner| inner.cards.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Card>> {
        self.inner.lock().ok()?.id_map.get(id).cloned()
    }

    pub fn global_tags(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.global_tags.clone())
            .unwrap_or_default()
    }

    pub fn category_counts(&self) -> HashMap<String, i64> {
        self.inner
            .lock()
            .map(|inner| inner.category_counts.clone())
            .unwrap_or_default()
    }

    pub fn visible_folders(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.visible_folders.clone())
            .unwrap_or_default()
    }

    /// Leading card id of a bundle directory, if that directory is one.
    pub fn bundle_leader(&self, bundle_dir: &str) -> Option<String> {
        self.inner.lock().ok()?.bundle_map.get(bundle_dir).cloned()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.initialized)
            .unwrap_or(false)
    }
}

/// Aggregate one bundle directory's cards into the synthetic display
/// card. Versions sort by modification time descending; the input arrives
/// id-ordered from the store, so equal timestamps resolve deterministically.
/// The bundle's visible category is the directory's parent, so the
/// directory itself never shows up as a browsable folder.
fn aggregate_bundle(dir: &str, mut group: Vec<Card>) -> Option<Card> {
    if group.is_empty() {
        return None;
    }
    group.sort_by(|a, b| {
        b.last_modified
            .partial_cmp(&a.last_modified)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let versions: Vec<VersionEntry> = group
        .iter()
        .map(|card| VersionEntry {
            id: card.id.clone(),
            filename: card.filename.clone(),
            last_modified: card.last_modified,
            version: card.version.clone(),
        })
        .collect();

    let mut bundle = group.remove(0);
    bundle.is_bundle = true;
    bundle.bundle_dir = dir.to_string();
    bundle.versions = versions;
    bundle.category = paths::parent_category(dir).to_string();
    Some(bundle)
}

/// Insert a display entity: list slot, own id, version aliases and the
/// bundle-directory mapping.
fn push_entry(inner: &mut CacheInner, card: Card) {
    let entry = Arc::new(card);
    inner.id_map.insert(entry.id.clone(), Arc::clone(&entry));
    if entry.is_bundle {
        for version in &entry.versions {
            inner.id_map.insert(version.id.clone(), Arc::clone(&entry));
        }
        inner
            .bundle_map
            .insert(entry.bundle_dir.clone(), entry.id.clone());
    }
    inner.cards.push(entry);
}

/// Adjust the count of a category and every ancestor prefix. Root entries
/// count under `""`; non-root categories never roll up into the root.
fn bump(counts: &mut HashMap<String, i64>, category: &str, delta: i64) {
    if category.is_empty() {
        let slot = counts.entry(String::new()).or_insert(0);
        *slot = (*slot + delta).max(0);
        return;
    }
    for prefix in paths::ancestor_paths(category) {
        let slot = counts.entry(prefix).or_insert(0);
        *slot = (*slot + delta).max(0);
    }
}

fn recalculate_counts(inner: &mut CacheInner) {
    let categories: Vec<String> = inner.cards.iter().map(|c| c.category.clone()).collect();
    inner.category_counts.clear();
    for category in &categories {
        bump(&mut inner.category_counts, category, 1);
    }
    let CacheInner {
        category_counts,
        visible_folders,
        ..
    } = inner;
    for folder in visible_folders.iter() {
        category_counts.entry(folder.clone()).or_insert(0);
    }
}

fn merge_tags(inner: &mut CacheInner, tags: &[String]) {
    let mut set: HashSet<String> = inner.global_tags.iter().cloned().collect();
    let mut grew = false;
    for tag in tags {
        if set.insert(tag.clone()) {
            grew = true;
        }
    }
    if grew {
        let mut all: Vec<String> = set.into_iter().collect();
        all.sort();
        inner.global_tags = all;
    }
}

/// Swap a display entity in place, keeping every alias pointing at the
/// fresh Arc. Only valid when the id did not change.
fn replace_card(inner: &mut CacheInner, old: &Arc<Card>, updated: &Arc<Card>) {
    if let Some(pos) = inner.cards.iter().position(|c| Arc::ptr_eq(c, old)) {
        inner.cards[pos] = Arc::clone(updated);
    }
    for slot in inner.id_map.values_mut() {
        if Arc::ptr_eq(slot, old) {
            *slot = Arc::clone(updated);
        }
    }
}

fn rewrite_prefix(value: &str, old_prefix: &str, new_prefix: &str) -> String {
    if value == old_prefix {
        new_prefix.to_string()
    } else if value.starts_with(old_prefix) && value[old_prefix.len()..].starts_with('/') {
        format!("{}{}", new_prefix, &value[old_prefix.len()..])
    } else {
        value.to_string()
    }
}
